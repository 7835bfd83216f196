//! Bundle format error types.

use thiserror::Error;

/// Errors raised while building, parsing or opening a firmware bundle
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BundleError {
    /// A header field does not fit in a signed 16-bit integer
    #[error("header field {field} out of range: {value}")]
    Range {
        /// Name of the offending field
        field: &'static str,
        /// Value that failed to fit
        value: i64,
    },

    /// Header has the wrong size or inconsistent fields
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// Tag verification failed; no plaintext is released
    #[error("authentication failed for chunk {chunk_index}")]
    Authentication {
        /// Index of the chunk that failed to verify
        chunk_index: i16,
    },

    /// Tag verification passed but the padding trailer is inconsistent
    #[error(
        "invalid padding{}",
        .chunk_index.map(|i| format!(" in chunk {}", i)).unwrap_or_default()
    )]
    Padding {
        /// Index of the offending chunk, when known
        chunk_index: Option<i16>,
    },

    /// Encryption could not be performed for a chunk
    #[error("cannot seal chunk {chunk_index}: {reason}")]
    Seal {
        /// Index of the chunk being sealed
        chunk_index: i16,
        /// What was wrong
        reason: String,
    },

    /// Key material has the wrong length
    #[error("key must be 16 bytes, got {0}")]
    KeyLength(usize),

    /// A record extends past the end of the bundle
    #[error("bundle truncated at offset {offset}")]
    Truncated {
        /// Byte offset of the incomplete record
        offset: usize,
    },

    /// Bundle does not end with the release-message record
    #[error("bundle has no release message record")]
    MissingReleaseMessage,

    /// Record placement or sequencing violates the bundle layout
    #[error("layout violation at chunk {chunk_index}: {reason}")]
    Layout {
        /// Chunk index where the violation was detected
        chunk_index: i16,
        /// What was wrong
        reason: String,
    },

    /// Release message is not terminated or not UTF-8
    #[error("invalid release message in chunk {chunk_index}: {reason}")]
    Message {
        /// Index of the message record
        chunk_index: i16,
        /// What was wrong
        reason: String,
    },

    /// Reading key material failed
    #[error("key file: {0}")]
    KeyFile(String),
}
