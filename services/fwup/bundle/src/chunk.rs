//! Firmware splitting and block padding.
//!
//! Firmware images are cut into fixed-size plaintext blocks before sealing.
//! Every block, including the release message, is padded PKCS#7-style to
//! the AEAD block alignment so the original length can be recovered exactly
//! after decryption.

use crate::error::BundleError;
use bytes::{BufMut, Bytes, BytesMut};

/// Plaintext bytes carried by each firmware chunk
pub const CHUNK_PAYLOAD_SIZE: usize = 1000;

/// Alignment of padded plaintext
pub const AEAD_BLOCK_SIZE: usize = 16;

/// Largest ciphertext a firmware record can carry
pub const MAX_PADDED_CHUNK_SIZE: usize = padded_len(CHUNK_PAYLOAD_SIZE);

/// Length of `len` bytes after padding (always at least one pad byte)
pub const fn padded_len(len: usize) -> usize {
    (len / AEAD_BLOCK_SIZE + 1) * AEAD_BLOCK_SIZE
}

/// Split a payload into `block_size` blocks, the last one holding the remainder
pub fn split(payload: &Bytes, block_size: usize) -> Vec<Bytes> {
    if payload.is_empty() || block_size == 0 {
        return vec![];
    }

    let total_blocks = payload.len().div_ceil(block_size);
    let mut blocks = Vec::with_capacity(total_blocks);
    let mut offset = 0;

    while offset < payload.len() {
        let end = std::cmp::min(offset + block_size, payload.len());
        blocks.push(payload.slice(offset..end));
        offset = end;
    }

    blocks
}

/// Pad a block to the next multiple of [`AEAD_BLOCK_SIZE`]
pub fn pad(block: &[u8]) -> BytesMut {
    let total = padded_len(block.len());
    let pad_len = total - block.len();
    let mut buf = BytesMut::with_capacity(total);
    buf.extend_from_slice(block);
    buf.put_bytes(pad_len as u8, pad_len);
    buf
}

/// Strip the padding added by [`pad`]
pub fn unpad(padded: &[u8]) -> Result<&[u8], BundleError> {
    if padded.is_empty() || padded.len() % AEAD_BLOCK_SIZE != 0 {
        return Err(BundleError::Padding { chunk_index: None });
    }

    let pad_len = padded[padded.len() - 1] as usize;
    if pad_len == 0 || pad_len > AEAD_BLOCK_SIZE {
        return Err(BundleError::Padding { chunk_index: None });
    }

    let (body, trailer) = padded.split_at(padded.len() - pad_len);
    if trailer.iter().any(|&b| b as usize != pad_len) {
        return Err(BundleError::Padding { chunk_index: None });
    }

    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_with_remainder() {
        let payload = Bytes::from(vec![0xAB; 2 * CHUNK_PAYLOAD_SIZE + 37]);
        let blocks = split(&payload, CHUNK_PAYLOAD_SIZE);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].len(), CHUNK_PAYLOAD_SIZE);
        assert_eq!(blocks[1].len(), CHUNK_PAYLOAD_SIZE);
        assert_eq!(blocks[2].len(), 37);
    }

    #[test]
    fn test_split_exact_multiple_has_no_short_block() {
        let payload = Bytes::from(vec![1u8; 3 * CHUNK_PAYLOAD_SIZE]);
        let blocks = split(&payload, CHUNK_PAYLOAD_SIZE);
        assert_eq!(blocks.len(), 3);
        assert!(blocks.iter().all(|b| b.len() == CHUNK_PAYLOAD_SIZE));
    }

    #[test]
    fn test_split_rejoins() {
        let payload = Bytes::from((0..2500u32).map(|i| i as u8).collect::<Vec<_>>());
        let joined: Vec<u8> = split(&payload, CHUNK_PAYLOAD_SIZE)
            .iter()
            .flat_map(|b| b.iter().copied())
            .collect();
        assert_eq!(joined, payload.to_vec());
    }

    #[test]
    fn test_split_empty() {
        assert!(split(&Bytes::new(), CHUNK_PAYLOAD_SIZE).is_empty());
    }

    #[test]
    fn test_pad_aligned_block_gets_full_pad_block() {
        let padded = pad(&[7u8; 16]);
        assert_eq!(padded.len(), 32);
        assert!(padded[16..].iter().all(|&b| b == 16));
    }

    #[test]
    fn test_pad_unpad() {
        for len in [0usize, 1, 15, 17, 200, 1000] {
            let block = vec![0x5Au8; len];
            let padded = pad(&block);
            assert_eq!(padded.len(), padded_len(len));
            assert_eq!(padded.len() % AEAD_BLOCK_SIZE, 0);
            assert_eq!(unpad(&padded).unwrap(), &block[..]);
        }
    }

    #[test]
    fn test_max_padded_chunk_size() {
        assert_eq!(MAX_PADDED_CHUNK_SIZE, 1008);
    }

    #[test]
    fn test_unpad_rejects_bad_trailer() {
        let mut padded = pad(b"hello").to_vec();
        let last = padded.len() - 2;
        padded[last] ^= 0x01;
        assert_eq!(unpad(&padded), Err(BundleError::Padding { chunk_index: None }));
        assert_eq!(unpad(&[0u8; 16]), Err(BundleError::Padding { chunk_index: None }));
        assert_eq!(unpad(&[1u8; 15]), Err(BundleError::Padding { chunk_index: None }));
    }
}
