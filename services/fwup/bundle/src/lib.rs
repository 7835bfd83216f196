//! Chunking, AEAD sealing and the on-disk bundle format for firmware updates.
//!
//! This crate turns a raw firmware image into a sealed bundle that can be
//! stored and later streamed to a bootloader, and verifies bundles back into
//! firmware and release message.
//!
//! ## Features
//!
//! - **Fixed-size chunking**: 1000-byte plaintext blocks, PKCS#7 padded to 16
//! - **AES-128-GCM**: fresh 128-bit nonce per chunk, header bound as AAD
//! - **Release message**: trailing record with reserved index `-1`
//! - **Layout re-derivation**: record boundaries recovered from the bundle alone
//!
//! ## Bundle Format
//!
//! ```text
//! +--------+--------+--------+------------+        +--------+-----+-----+------------+
//! | hdr 0  | nonce  | tag    | cipher 0   |  ...   | hdr -1 | ... | ... | message    |
//! +--------+--------+--------+------------+        +--------+-----+-----+------------+
//! |<------------ RECORD_STRIDE ---------->|
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod codec;
pub mod crypto;
pub mod error;
pub mod header;

// Re-export main types
pub use chunk::{
    pad, padded_len, split, unpad, AEAD_BLOCK_SIZE, CHUNK_PAYLOAD_SIZE, MAX_PADDED_CHUNK_SIZE,
};
pub use codec::{
    decode, encode, parse_records, BundleLayout, DecodedBundle, EncryptedChunk,
    RECORD_PREFIX_SIZE, RECORD_STRIDE,
};
pub use crypto::{open, seal, BundleKey, SealedChunk, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use error::BundleError;
pub use header::{
    pack_header, unpack_header, ChunkHeader, CHUNK_HEADER_SIZE, MESSAGE_CHUNK_INDEX,
};
