//! Bundle encoding, parsing and decoding.
//!
//! A bundle is a plain concatenation of records with no file-level header:
//!
//! ```text
//! +-------------+------------+----------+-------------------------+
//! | header (8B) | nonce (16B)| tag (16B)| ciphertext (padded_len) |
//! +-------------+------------+----------+-------------------------+
//! ```
//!
//! Firmware records come first in increasing `chunk_index`, followed by one
//! release-message record with index `-1`. Every firmware record except the
//! last carries a full [`CHUNK_PAYLOAD_SIZE`] block, so firmware record `i`
//! always starts at `i * RECORD_STRIDE`.

use crate::chunk::{
    pad, padded_len, split, unpad, CHUNK_PAYLOAD_SIZE, MAX_PADDED_CHUNK_SIZE,
};
use crate::crypto::{open, seal, BundleKey, NONCE_SIZE, TAG_SIZE};
use crate::error::BundleError;
use crate::header::{pack_header, ChunkHeader, CHUNK_HEADER_SIZE, MESSAGE_CHUNK_INDEX};
use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use tracing::{debug, warn};

/// Bytes preceding the ciphertext in every record
pub const RECORD_PREFIX_SIZE: usize = CHUNK_HEADER_SIZE + NONCE_SIZE + TAG_SIZE;

/// Distance between the starts of consecutive full firmware records
pub const RECORD_STRIDE: usize = RECORD_PREFIX_SIZE + MAX_PADDED_CHUNK_SIZE;

/// One authenticated record of a bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedChunk {
    /// Clear-text metadata, bound as associated data
    pub header: ChunkHeader,
    /// Per-record nonce
    pub nonce: [u8; NONCE_SIZE],
    /// Authentication tag
    pub tag: [u8; TAG_SIZE],
    /// Ciphertext of `header.padded_length` bytes
    pub ciphertext: Bytes,
}

impl EncryptedChunk {
    /// Seal a plaintext block into a record
    pub fn seal(
        key: &BundleKey,
        plaintext: &[u8],
        version: u16,
        total_plain_size: usize,
        chunk_index: i64,
    ) -> Result<Self, BundleError> {
        let padded = pad(plaintext);
        let header = pack_header(padded.len(), version as u32, total_plain_size, chunk_index)?;
        let sealed = seal(key, &header, &padded)?;

        Ok(Self {
            header,
            nonce: sealed.nonce,
            tag: sealed.tag,
            ciphertext: sealed.ciphertext,
        })
    }

    /// Verify and decrypt, returning the unpadded plaintext
    pub fn open(&self, key: &BundleKey) -> Result<Vec<u8>, BundleError> {
        let padded = open(key, &self.header, &self.nonce, &self.tag, &self.ciphertext)?;
        let plain = unpad(&padded).map_err(|_| BundleError::Padding {
            chunk_index: Some(self.header.chunk_index),
        })?;
        Ok(plain.to_vec())
    }

    /// Header, nonce and tag as sent in the metadata phase
    pub fn metadata(&self) -> [u8; RECORD_PREFIX_SIZE] {
        let mut out = [0u8; RECORD_PREFIX_SIZE];
        out[..CHUNK_HEADER_SIZE].copy_from_slice(&self.header.to_bytes());
        out[CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + NONCE_SIZE].copy_from_slice(&self.nonce);
        out[CHUNK_HEADER_SIZE + NONCE_SIZE..].copy_from_slice(&self.tag);
        out
    }

    /// Encoded size of this record
    pub fn record_len(&self) -> usize {
        RECORD_PREFIX_SIZE + self.ciphertext.len()
    }

    /// Append the encoded record to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) {
        self.header.encode(buf);
        buf.put_slice(&self.nonce);
        buf.put_slice(&self.tag);
        buf.put_slice(&self.ciphertext);
    }
}

/// Encode firmware and a release message into a sealed bundle
pub fn encode(
    firmware: &Bytes,
    version: u16,
    message: &str,
    key: &BundleKey,
) -> Result<Bytes, BundleError> {
    let blocks = split(firmware, CHUNK_PAYLOAD_SIZE);
    let mut buf = BytesMut::with_capacity(blocks.len() * RECORD_STRIDE + RECORD_STRIDE);

    for (i, block) in blocks.iter().enumerate() {
        let record = EncryptedChunk::seal(key, block, version, firmware.len(), i as i64)?;
        record.encode_into(&mut buf);
    }

    let mut msg = Vec::with_capacity(message.len() + 1);
    msg.extend_from_slice(message.as_bytes());
    msg.push(0);
    let record = EncryptedChunk::seal(
        key,
        &msg,
        version,
        firmware.len(),
        MESSAGE_CHUNK_INDEX as i64,
    )?;
    record.encode_into(&mut buf);

    debug!(
        "Encoded bundle v{}: {} firmware chunks, {} bytes",
        version,
        blocks.len(),
        buf.len()
    );

    Ok(buf.freeze())
}

/// Scan a bundle record by record without a key
pub fn parse_records(bundle: &Bytes) -> Result<Vec<EncryptedChunk>, BundleError> {
    let mut records = Vec::new();
    let mut offset = 0;

    while offset < bundle.len() {
        if bundle.len() - offset < RECORD_PREFIX_SIZE {
            return Err(BundleError::Truncated { offset });
        }

        let header = ChunkHeader::decode(&bundle[offset..offset + CHUNK_HEADER_SIZE])?;
        header.validate()?;

        let cipher_start = offset + RECORD_PREFIX_SIZE;
        let cipher_end = cipher_start + header.ciphertext_len();
        if cipher_end > bundle.len() {
            return Err(BundleError::Truncated { offset });
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bundle[offset + CHUNK_HEADER_SIZE..offset + CHUNK_HEADER_SIZE + NONCE_SIZE]);
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&bundle[offset + CHUNK_HEADER_SIZE + NONCE_SIZE..cipher_start]);

        records.push(EncryptedChunk {
            header,
            nonce,
            tag,
            ciphertext: bundle.slice(cipher_start..cipher_end),
        });
        offset = cipher_end;
    }

    Ok(records)
}

/// Chunk boundaries re-derived from the bundle's own headers
#[derive(Debug, Clone)]
pub struct BundleLayout {
    /// Firmware version shared by every record
    pub version: i16,
    /// Size of the unencrypted firmware
    pub total_plain_size: usize,
    /// Firmware records in index order
    pub firmware: Vec<EncryptedChunk>,
    /// Trailing release-message record
    pub message: EncryptedChunk,
}

impl BundleLayout {
    /// Validate the record structure of a bundle and index its records
    pub fn from_bundle(bundle: &Bytes) -> Result<Self, BundleError> {
        let mut records = parse_records(bundle)?;

        let message = match records.pop() {
            Some(record) if record.header.is_release_message() => record,
            _ => return Err(BundleError::MissingReleaseMessage),
        };

        let version = message.header.version;
        let total_plain_size = message.header.total_plain_size as usize;
        let expected_chunks = total_plain_size.div_ceil(CHUNK_PAYLOAD_SIZE);

        if records.len() != expected_chunks {
            return Err(BundleError::Layout {
                chunk_index: records.len() as i16,
                reason: format!(
                    "{} firmware records for {} bytes, expected {}",
                    records.len(),
                    total_plain_size,
                    expected_chunks
                ),
            });
        }

        let mut offset = 0;
        for (i, record) in records.iter().enumerate() {
            let header = &record.header;
            let layout_err = |reason: String| BundleError::Layout {
                chunk_index: header.chunk_index,
                reason,
            };

            if header.chunk_index as i64 != i as i64 {
                return Err(layout_err(format!("expected chunk index {}", i)));
            }
            if header.version != version || header.total_plain_size != message.header.total_plain_size {
                return Err(BundleError::MalformedHeader(format!(
                    "chunk {} disagrees on version or size",
                    header.chunk_index
                )));
            }
            if offset != i * RECORD_STRIDE {
                return Err(layout_err(format!(
                    "record at offset {}, expected {}",
                    offset,
                    i * RECORD_STRIDE
                )));
            }

            let plain_len = std::cmp::min(CHUNK_PAYLOAD_SIZE, total_plain_size - i * CHUNK_PAYLOAD_SIZE);
            if header.ciphertext_len() != padded_len(plain_len) {
                return Err(layout_err(format!(
                    "padded length {}, expected {}",
                    header.padded_length,
                    padded_len(plain_len)
                )));
            }

            offset += record.record_len();
        }

        Ok(Self {
            version,
            total_plain_size,
            firmware: records,
            message,
        })
    }

    /// Number of firmware chunks
    pub fn num_chunks(&self) -> usize {
        self.firmware.len()
    }

    /// All records in transmission order, release message last
    pub fn records(&self) -> impl Iterator<Item = &EncryptedChunk> {
        self.firmware.iter().chain(std::iter::once(&self.message))
    }
}

/// Plaintext contents recovered from a bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedBundle {
    /// Firmware version
    pub version: u16,
    /// Number of firmware chunks
    pub chunks: usize,
    /// Release message without its terminator
    pub message: String,
    /// Firmware image
    #[serde(skip)]
    pub firmware: Bytes,
}

/// Verify and decrypt a whole bundle
pub fn decode(bundle: &Bytes, key: &BundleKey) -> Result<DecodedBundle, BundleError> {
    let layout = BundleLayout::from_bundle(bundle)?;

    let mut firmware = BytesMut::with_capacity(layout.total_plain_size);
    for record in &layout.firmware {
        let plain = record.open(key).map_err(|e| {
            warn!("Chunk {} rejected: {}", record.header.chunk_index, e);
            e
        })?;
        firmware.extend_from_slice(&plain);
    }

    if firmware.len() != layout.total_plain_size {
        return Err(BundleError::MalformedHeader(format!(
            "decrypted {} firmware bytes, header declares {}",
            firmware.len(),
            layout.total_plain_size
        )));
    }

    let msg = layout.message.open(key)?;
    let end = msg
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| BundleError::Message {
            chunk_index: MESSAGE_CHUNK_INDEX,
            reason: "missing null terminator".to_string(),
        })?;
    let message = std::str::from_utf8(&msg[..end])
        .map_err(|e| BundleError::Message {
            chunk_index: MESSAGE_CHUNK_INDEX,
            reason: e.to_string(),
        })?
        .to_string();

    Ok(DecodedBundle {
        version: layout.version as u16,
        chunks: layout.num_chunks(),
        message,
        firmware: firmware.freeze(),
    })
}
