//! Transfer protocol error types.

use fwup_bundle::BundleError;
use std::fmt;
use thiserror::Error;

/// Protocol phase in which a read timed out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the bootloader to echo the sentinel
    Handshake,
    /// Waiting for the metadata acknowledgement
    Metadata,
    /// Waiting for a frame acknowledgement
    Frame,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Handshake => f.write_str("handshake"),
            Phase::Metadata => f.write_str("metadata"),
            Phase::Frame => f.write_str("frame"),
        }
    }
}

/// Why a transfer was abandoned
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// Too many consecutive frame rejects
    #[error("{rejects} consecutive rejects on chunk {chunk_index} frame {frame_index}")]
    RejectBudgetExhausted {
        /// Chunk being sent
        chunk_index: i16,
        /// Frame within the chunk
        frame_index: usize,
        /// Consecutive rejects seen
        rejects: u32,
    },

    /// The channel was closed by the peer or the caller
    #[error("transport closed")]
    TransportClosed,
}

/// Transfer protocol errors
#[derive(Error, Debug)]
pub enum TransferError {
    /// Bundle failed layout validation
    #[error("bundle error: {0}")]
    Bundle(#[from] BundleError),

    /// Bootloader answered with an unexpected byte
    #[error("protocol violation on chunk {chunk_index}: unexpected response {byte:#04x}")]
    ProtocolViolation {
        /// Chunk being sent
        chunk_index: i16,
        /// Frame within the chunk, `None` during the metadata phase
        frame_index: Option<usize>,
        /// Byte received
        byte: u8,
    },

    /// Bootloader rejected a frame; recoverable by resending it
    #[error("frame {frame_index} of chunk {chunk_index} rejected")]
    FrameRejected {
        /// Chunk being sent
        chunk_index: i16,
        /// Frame within the chunk
        frame_index: usize,
    },

    /// No response within the read timeout
    #[error("timed out waiting for {phase} response")]
    Timeout {
        /// Phase that timed out
        phase: Phase,
        /// Chunk being sent, if any
        chunk_index: Option<i16>,
    },

    /// Transfer abandoned; must restart from the handshake
    #[error("transfer aborted: {0}")]
    Aborted(AbortReason),

    /// Transport I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Whether the whole transfer must be restarted from the handshake
    pub fn requires_restart(&self) -> bool {
        !matches!(self, TransferError::Bundle(_) | TransferError::FrameRejected { .. })
    }
}
