//! Firmware update tool.
//!
//! `protect` seals a firmware image into an encrypted bundle, `update` streams
//! a bundle to a device bootloader, and `verify` checks a bundle offline.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use fwup_bundle::{decode, encode, BundleKey, BundleLayout};
use fwup_transfer::{connect_tcp, open_device, IoStream, TransferSession};
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::FwupConfig;
use logging::FwupLogFormatter;

/// Encrypted firmware bundling and bootloader delivery
#[derive(Parser, Debug)]
#[command(name = "fwup", version, about = "Encrypted firmware bundling and serial delivery")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "fwup.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Seal a firmware image into an encrypted bundle
    Protect {
        /// Plaintext firmware image
        #[arg(long)]
        infile: PathBuf,

        /// Bundle to write
        #[arg(long)]
        outfile: PathBuf,

        /// Firmware version (0..=32767)
        #[arg(long)]
        version: u16,

        /// Release message shown by the device after install
        #[arg(long)]
        message: String,

        /// Secrets file overriding the configured key file
        #[arg(long)]
        key_file: Option<PathBuf>,
    },

    /// Stream a bundle to a device waiting in update mode
    Update {
        /// Serial device, e.g. /dev/ttyACM0 (baud set externally)
        #[arg(long, conflicts_with = "connect", required_unless_present = "connect")]
        port: Option<PathBuf>,

        /// TCP serial bridge, e.g. 127.0.0.1:4000
        #[arg(long)]
        connect: Option<SocketAddr>,

        /// Bundle produced by `protect`
        #[arg(long)]
        firmware: PathBuf,

        /// Per-byte response timeout, e.g. 2s
        #[arg(long)]
        read_timeout: Option<humantime::Duration>,

        /// Handshake deadline, e.g. 60s
        #[arg(long)]
        handshake_timeout: Option<humantime::Duration>,

        /// Repeat the handshake before every record (older bootloaders)
        #[arg(long)]
        handshake_every_record: bool,

        /// Log every frame and ACK
        #[arg(long)]
        debug: bool,
    },

    /// Authenticate and decrypt a bundle without a device
    Verify {
        /// Bundle to check
        #[arg(long)]
        bundle: PathBuf,

        /// Secrets file overriding the configured key file
        #[arg(long)]
        key_file: Option<PathBuf>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let debug = matches!(args.command, Command::Update { debug: true, .. });
    let log_level = effective_log_level(&args.log_level, debug);

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("fwup={}", log_level).parse()?)
        .add_directive(format!("fwup_bundle={}", log_level).parse()?)
        .add_directive(format!("fwup_transfer={}", log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .event_format(FwupLogFormatter::new("fwup".to_string()))
        .init();

    let config = FwupConfig::load_from_file(&args.config)?;
    debug!("Effective configuration: {:?}", config);

    match args.command {
        Command::Protect {
            infile,
            outfile,
            version,
            message,
            key_file,
        } => {
            let key_file = key_file.unwrap_or_else(|| config.secrets.key_file.clone());
            protect(infile, outfile, version, &message, key_file).await
        }
        Command::Update {
            port,
            connect,
            firmware,
            read_timeout,
            handshake_timeout,
            handshake_every_record,
            ..
        } => {
            let mut transfer = config.transfer_config();
            transfer.handshake_every_record |= handshake_every_record;
            if let Some(t) = read_timeout {
                transfer.read_timeout = t.into();
            }
            if let Some(t) = handshake_timeout {
                transfer.handshake_timeout = t.into();
            }

            let link = match (port, connect) {
                (Some(path), _) => open_device(&path)
                    .await
                    .with_context(|| format!("opening serial device {:?}", path))?,
                (None, Some(addr)) => connect_tcp(addr)
                    .await
                    .with_context(|| format!("connecting to serial bridge {}", addr))?,
                (None, None) => bail!("either --port or --connect is required"),
            };

            update(link, firmware, transfer).await
        }
        Command::Verify {
            bundle,
            key_file,
            json,
        } => {
            let key_file = key_file.unwrap_or_else(|| config.secrets.key_file.clone());
            verify(bundle, key_file, json).await
        }
    }
}

/// `--debug` raises the level to at least `debug`, where frames and ACKs are logged
fn effective_log_level(requested: &str, debug: bool) -> String {
    match requested {
        "trace" => requested.to_string(),
        _ if debug => "debug".to_string(),
        _ => requested.to_string(),
    }
}

fn load_key(path: &Path) -> Result<BundleKey> {
    let key = BundleKey::from_secrets_file(path)
        .with_context(|| format!("reading key from {:?}", path))?;
    debug!("Loaded bundle key from {:?}", path);
    Ok(key)
}

async fn protect(
    infile: PathBuf,
    outfile: PathBuf,
    version: u16,
    message: &str,
    key_file: PathBuf,
) -> Result<()> {
    let key = load_key(&key_file)?;
    let firmware = Bytes::from(
        tokio::fs::read(&infile)
            .await
            .with_context(|| format!("reading firmware image {:?}", infile))?,
    );

    let bundle = encode(&firmware, version, message, &key).context("sealing firmware")?;

    tokio::fs::write(&outfile, &bundle)
        .await
        .with_context(|| format!("writing bundle {:?}", outfile))?;

    component_info!(
        "protect",
        "Sealed {} bytes of firmware v{} into {:?} ({} bytes)",
        firmware.len(),
        version,
        outfile,
        bundle.len()
    );
    Ok(())
}

async fn update(
    link: IoStream,
    firmware: PathBuf,
    transfer: fwup_transfer::TransferConfig,
) -> Result<()> {
    let bundle = Bytes::from(
        tokio::fs::read(&firmware)
            .await
            .with_context(|| format!("reading bundle {:?}", firmware))?,
    );

    let layout = BundleLayout::from_bundle(&bundle).context("bundle failed layout checks")?;
    component_info!(
        "update",
        "Sending firmware v{} ({} bytes in {} chunks)",
        layout.version,
        layout.total_plain_size,
        layout.num_chunks()
    );
    component_info!("update", "Waiting for the device to enter update mode");

    let mut session = TransferSession::new(transfer, link);
    match session.run(&bundle).await {
        Ok(stats) => {
            component_info!(
                "update",
                "Update complete: {} chunks, {} frames, {} rejected, {} bytes on the wire",
                stats.chunks_sent,
                stats.frames_sent,
                stats.frames_rejected,
                stats.bytes_sent
            );
            Ok(())
        }
        Err(e) => {
            if e.requires_restart() {
                component_error!(
                    "update",
                    "Transfer aborted after {} chunks; device is in an indeterminate state and must restart its update",
                    session.stats().chunks_sent
                );
            } else {
                component_warn!("update", "Nothing was sent to the device");
            }
            Err(e).context("firmware update failed")
        }
    }
}

async fn verify(bundle: PathBuf, key_file: PathBuf, json: bool) -> Result<()> {
    let key = load_key(&key_file)?;
    let data = Bytes::from(
        tokio::fs::read(&bundle)
            .await
            .with_context(|| format!("reading bundle {:?}", bundle))?,
    );

    let decoded = decode(&data, &key).with_context(|| format!("verifying {:?}", bundle))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&decoded)?);
    } else {
        info!(
            "Bundle {:?} OK: version {}, {} firmware bytes in {} chunks, message {:?}",
            bundle,
            decoded.version,
            decoded.firmware.len(),
            decoded.chunks,
            decoded.message
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_flag_raises_log_level() {
        assert_eq!(effective_log_level("info", true), "debug");
        assert_eq!(effective_log_level("warn", true), "debug");
        assert_eq!(effective_log_level("trace", true), "trace");
        assert_eq!(effective_log_level("info", false), "info");
    }

    #[test]
    fn test_update_arguments() {
        let args = Args::try_parse_from([
            "fwup",
            "update",
            "--port",
            "/dev/ttyACM0",
            "--firmware",
            "fw.bin",
            "--debug",
        ])
        .unwrap();
        assert!(matches!(args.command, Command::Update { debug: true, .. }));

        assert!(Args::try_parse_from(["fwup", "update", "--firmware", "fw.bin"]).is_err());
    }
}
