//! Configuration handling for the firmware update tool.
//!
//! Settings come from an optional YAML file, then environment variables,
//! then command-line flags (applied by the caller).

use anyhow::Result;
use fwup_transfer::{TransferConfig, DEFAULT_MAX_CONSECUTIVE_REJECTS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Firmware update tool configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FwupConfig {
    /// Key material location
    pub secrets: SecretsConfig,
    /// Link timing
    pub serial: SerialConfig,
    /// Retry policy
    pub transfer: RetryConfig,
}

/// Key material location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// File whose first 16 bytes are the bundle key
    pub key_file: PathBuf,
}

/// Link timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Wait for each response byte (milliseconds)
    pub read_timeout_ms: u64,
    /// Interval between handshake sentinels (milliseconds)
    pub handshake_poll_ms: u64,
    /// Give up on the handshake after this long (seconds)
    pub handshake_timeout_secs: u64,
    /// Repeat the handshake before every record (older bootloaders)
    pub handshake_every_record: bool,
}

/// Retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Consecutive frame rejects tolerated before aborting
    pub max_consecutive_rejects: u32,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            key_file: PathBuf::from("secret_build_output.txt"),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 2000,
            handshake_poll_ms: 500,
            handshake_timeout_secs: 60,
            handshake_every_record: false,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_consecutive_rejects: DEFAULT_MAX_CONSECUTIVE_REJECTS,
        }
    }
}

impl FwupConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<FwupConfig>(&content) {
                Ok(parsed) => {
                    config = parsed;
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => {
                    warn!(
                        "Failed to parse config file {:?} ({}), using defaults",
                        config_path.as_ref(),
                        e
                    );
                }
            },
            Err(_) => {
                info!("Config file {:?} not found, using defaults", config_path.as_ref());
            }
        }

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `FWUP_*` overrides from a variable lookup
    pub fn apply_overrides<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) {
        if let Some(key_file) = lookup("FWUP_KEY_FILE") {
            self.secrets.key_file = PathBuf::from(key_file);
            info!("Key file overridden by environment: {:?}", self.secrets.key_file);
        }

        if let Some(ms) = lookup("FWUP_READ_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
            self.serial.read_timeout_ms = ms;
            info!("Read timeout overridden by environment: {}ms", ms);
        }

        if let Some(secs) =
            lookup("FWUP_HANDSHAKE_TIMEOUT_SECS").and_then(|v| v.parse::<u64>().ok())
        {
            self.serial.handshake_timeout_secs = secs;
            info!("Handshake timeout overridden by environment: {}s", secs);
        }

        if let Some(max) = lookup("FWUP_MAX_REJECTS").and_then(|v| v.parse::<u32>().ok()) {
            self.transfer.max_consecutive_rejects = max;
            info!("Reject budget overridden by environment: {}", max);
        }
    }

    /// Session settings derived from this configuration
    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            read_timeout: Duration::from_millis(self.serial.read_timeout_ms),
            handshake_poll: Duration::from_millis(self.serial.handshake_poll_ms),
            handshake_timeout: Duration::from_secs(self.serial.handshake_timeout_secs),
            max_consecutive_rejects: self.transfer.max_consecutive_rejects,
            handshake_every_record: self.serial.handshake_every_record,
            ..TransferConfig::default()
        }
    }
}
