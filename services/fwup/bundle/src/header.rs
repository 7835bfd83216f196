//! Chunk header packing.
//!
//! Every record in a bundle starts with an 8-byte header made of four
//! little-endian signed 16-bit fields:
//!
//! ```text
//! +----------------+---------+------------------+-------------+
//! | padded_length  | version | total_plain_size | chunk_index |
//! +----------------+---------+------------------+-------------+
//!        i16          i16            i16             i16
//! ```
//!
//! The header is bound to the ciphertext as AEAD associated data, so any
//! change to it invalidates the record's tag.

use crate::chunk::AEAD_BLOCK_SIZE;
use crate::error::BundleError;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// Header size in bytes
pub const CHUNK_HEADER_SIZE: usize = 8;

/// Reserved chunk index of the trailing release-message record
pub const MESSAGE_CHUNK_INDEX: i16 = -1;

/// Metadata header carried by every record of a bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHeader {
    /// Ciphertext length, always a multiple of 16
    pub padded_length: i16,
    /// Firmware version, identical across a bundle
    pub version: i16,
    /// Size of the unencrypted firmware image, identical across a bundle
    pub total_plain_size: i16,
    /// 0-based firmware chunk number, or -1 for the release message
    pub chunk_index: i16,
}

fn narrow(field: &'static str, value: i64) -> Result<i16, BundleError> {
    i16::try_from(value).map_err(|_| BundleError::Range { field, value })
}

/// Build a header, checking that every field fits in an `i16`
pub fn pack_header(
    padded_length: usize,
    version: u32,
    total_plain_size: usize,
    chunk_index: i64,
) -> Result<ChunkHeader, BundleError> {
    Ok(ChunkHeader {
        padded_length: narrow("padded_length", padded_length as i64)?,
        version: narrow("version", version as i64)?,
        total_plain_size: narrow("total_plain_size", total_plain_size as i64)?,
        chunk_index: narrow("chunk_index", chunk_index)?,
    })
}

impl ChunkHeader {
    /// Whether this header marks the release-message record
    pub fn is_release_message(&self) -> bool {
        self.chunk_index == MESSAGE_CHUNK_INDEX
    }

    /// Encode the header to bytes (little-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i16_le(self.padded_length);
        buf.put_i16_le(self.version);
        buf.put_i16_le(self.total_plain_size);
        buf.put_i16_le(self.chunk_index);
    }

    /// Header as a fixed array, used as associated data
    pub fn to_bytes(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut buf = BytesMut::with_capacity(CHUNK_HEADER_SIZE);
        self.encode(&mut buf);
        let mut out = [0u8; CHUNK_HEADER_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Decode a header from exactly eight bytes
    pub fn decode(mut buf: &[u8]) -> Result<Self, BundleError> {
        if buf.len() != CHUNK_HEADER_SIZE {
            return Err(BundleError::MalformedHeader(format!(
                "expected {} bytes, got {}",
                CHUNK_HEADER_SIZE,
                buf.len()
            )));
        }

        Ok(Self {
            padded_length: buf.get_i16_le(),
            version: buf.get_i16_le(),
            total_plain_size: buf.get_i16_le(),
            chunk_index: buf.get_i16_le(),
        })
    }

    /// Check internal consistency of the fields
    pub fn validate(&self) -> Result<(), BundleError> {
        if self.padded_length <= 0 || self.padded_length as usize % AEAD_BLOCK_SIZE != 0 {
            return Err(BundleError::MalformedHeader(format!(
                "padded_length {} is not a positive multiple of {}",
                self.padded_length, AEAD_BLOCK_SIZE
            )));
        }

        if self.total_plain_size < 0 {
            return Err(BundleError::MalformedHeader(format!(
                "negative total_plain_size {}",
                self.total_plain_size
            )));
        }

        if self.chunk_index < MESSAGE_CHUNK_INDEX {
            return Err(BundleError::MalformedHeader(format!(
                "invalid chunk_index {}",
                self.chunk_index
            )));
        }

        Ok(())
    }

    /// Ciphertext length as a byte count
    pub fn ciphertext_len(&self) -> usize {
        self.padded_length.max(0) as usize
    }
}

/// Decode the four header fields from bytes
pub fn unpack_header(buf: &[u8]) -> Result<ChunkHeader, BundleError> {
    ChunkHeader::decode(buf)
}
