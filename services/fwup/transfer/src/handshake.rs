//! Update-mode handshake with the bootloader.
//!
//! The host repeatedly writes the sentinel byte and waits for the bootloader
//! to echo it, which signals that the device has entered update mode.

use crate::error::{Phase, TransferError};
use crate::transport::AckChannel;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::{debug, info, trace};

/// Sentinel byte exchanged during the handshake
pub const HANDSHAKE_BYTE: u8 = b'U';

/// Wait for the bootloader to enter update mode
///
/// Writes [`HANDSHAKE_BYTE`] every `poll_interval` until the echo arrives,
/// discarding any other bytes on the line. Returns the number of sentinels
/// written, or [`TransferError::Timeout`] once `deadline` has elapsed.
pub async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(
    channel: &mut AckChannel<S>,
    poll_interval: Duration,
    deadline: Duration,
) -> Result<u32, TransferError> {
    let started = Instant::now();
    let mut attempts = 0u32;

    info!("Waiting for bootloader to enter update mode...");

    loop {
        if started.elapsed() >= deadline {
            return Err(TransferError::Timeout {
                phase: Phase::Handshake,
                chunk_index: None,
            });
        }

        channel.send(&[HANDSHAKE_BYTE]).await?;
        attempts += 1;

        let poll_until = Instant::now() + poll_interval;
        loop {
            let remaining = poll_until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match channel.read_byte(remaining).await? {
                Some(HANDSHAKE_BYTE) => {
                    debug!("Bootloader answered after {} attempts", attempts);
                    return Ok(attempts);
                }
                Some(other) => trace!("Discarding {:#04x} during handshake", other),
                None => break,
            }
        }
    }
}
