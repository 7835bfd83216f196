//! Handshake, framing, ACK and bounded retry for streaming bundles to a bootloader.
//!
//! This crate delivers a sealed firmware bundle to a remote bootloader over a
//! half-duplex byte link (serial device or TCP bridge), tolerating transient
//! frame corruption.
//!
//! ## Wire Protocol
//!
//! ```text
//! host                                   bootloader
//!  | 'U' 'U' ...                              |
//!  |                                     'U'  |   update mode
//!  | header(8) nonce(16) tag(16)              |
//!  |                                    0x00  |   metadata accepted
//!  | frame (<= 16 bytes ciphertext)           |
//!  |                             0x00 | 0x01  |   accept | resend
//!  | ... every frame, every chunk ...         |
//!  | 0x00 0x00                                |   finish page
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use fwup_transfer::{open_device, TransferConfig, TransferSession};
//!
//! # async fn example(bundle: bytes::Bytes) -> Result<(), fwup_transfer::TransferError> {
//! let link = open_device("/dev/ttyACM0").await?;
//! let mut session = TransferSession::new(TransferConfig::default(), link);
//! let stats = session.run(&bundle).await?;
//! println!("{} frames, {} rejects", stats.frames_sent, stats.frames_rejected);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod handshake;
pub mod retry;
pub mod session;
pub mod transport;

// Re-export main types
pub use error::{AbortReason, Phase, TransferError};
pub use handshake::{handshake, HANDSHAKE_BYTE};
pub use retry::{RejectBudget, DEFAULT_MAX_CONSECUTIVE_REJECTS};
pub use session::{
    Ack, TransferConfig, TransferSession, TransferState, TransferStats, ACK_OK, ACK_REJECT,
    FINALIZE_FRAME, FRAME_SIZE,
};
pub use transport::{connect_tcp, open_device, AckChannel, IoStream, SerialDevice};
