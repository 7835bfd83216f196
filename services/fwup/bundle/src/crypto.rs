//! AEAD sealing of individual chunks.
//!
//! Chunks are sealed with AES-128-GCM using a 16-byte nonce drawn fresh from
//! the OS RNG for every chunk. The 8-byte chunk header is passed as
//! associated data so it is authenticated but left in the clear.

use crate::error::BundleError;
use crate::header::ChunkHeader;
use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes128;
use aes_gcm::{AesGcm, Key, Nonce, Tag};
use bytes::Bytes;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::path::Path;
use tracing::trace;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Nonce size in bytes
pub const NONCE_SIZE: usize = 16;

/// Authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Symmetric key size in bytes
pub const KEY_SIZE: usize = 16;

/// AES-128-GCM with a 128-bit nonce
type Aes128Gcm16 = AesGcm<Aes128, U16>;

/// Shared symmetric key between the bundler and the bootloader
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct BundleKey([u8; KEY_SIZE]);

impl BundleKey {
    /// Wrap raw key bytes
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build a key from a slice that must be exactly 16 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, BundleError> {
        let key: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| BundleError::KeyLength(bytes.len()))?;
        Ok(Self(key))
    }

    /// Load the key from a build secrets file; the key is its first 16 bytes
    pub fn from_secrets_file<P: AsRef<Path>>(path: P) -> Result<Self, BundleError> {
        let mut secrets = std::fs::read(path.as_ref())
            .map_err(|e| BundleError::KeyFile(format!("{}: {}", path.as_ref().display(), e)))?;

        if secrets.len() < KEY_SIZE {
            let len = secrets.len();
            secrets.zeroize();
            return Err(BundleError::KeyLength(len));
        }

        let key = Self::from_slice(&secrets[..KEY_SIZE]);
        secrets.zeroize();
        key
    }

    fn cipher(&self) -> Aes128Gcm16 {
        Aes128Gcm16::new(Key::<Aes128Gcm16>::from_slice(&self.0))
    }
}

impl fmt::Debug for BundleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BundleKey(..)")
    }
}

/// Output of sealing one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedChunk {
    /// Random per-chunk nonce
    pub nonce: [u8; NONCE_SIZE],
    /// Tag over header and ciphertext
    pub tag: [u8; TAG_SIZE],
    /// Ciphertext, same length as the padded plaintext
    pub ciphertext: Bytes,
}

/// Encrypt a padded block under `key`, authenticating `header`
pub fn seal(
    key: &BundleKey,
    header: &ChunkHeader,
    padded_plaintext: &[u8],
) -> Result<SealedChunk, BundleError> {
    if padded_plaintext.len() != header.ciphertext_len() {
        return Err(BundleError::Seal {
            chunk_index: header.chunk_index,
            reason: format!(
                "{} plaintext bytes, header declares {}",
                padded_plaintext.len(),
                header.padded_length
            ),
        });
    }

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let mut buffer = padded_plaintext.to_vec();
    let tag = key
        .cipher()
        .encrypt_in_place_detached(Nonce::<U16>::from_slice(&nonce), &header.to_bytes(), &mut buffer)
        .map_err(|_| BundleError::Seal {
            chunk_index: header.chunk_index,
            reason: "plaintext exceeds the AEAD length limit".to_string(),
        })?;

    trace!(
        "Sealed chunk {} ({} bytes)",
        header.chunk_index,
        buffer.len()
    );

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(&tag);

    Ok(SealedChunk {
        nonce,
        tag: tag_bytes,
        ciphertext: Bytes::from(buffer),
    })
}

/// Verify and decrypt one chunk; nothing is returned unless the tag verifies
pub fn open(
    key: &BundleKey,
    header: &ChunkHeader,
    nonce: &[u8; NONCE_SIZE],
    tag: &[u8; TAG_SIZE],
    ciphertext: &[u8],
) -> Result<Vec<u8>, BundleError> {
    let mut buffer = ciphertext.to_vec();

    match key.cipher().decrypt_in_place_detached(
        Nonce::<U16>::from_slice(nonce),
        &header.to_bytes(),
        &mut buffer,
        Tag::<U16>::from_slice(tag),
    ) {
        Ok(()) => Ok(buffer),
        Err(_) => {
            buffer.zeroize();
            Err(BundleError::Authentication {
                chunk_index: header.chunk_index,
            })
        }
    }
}
