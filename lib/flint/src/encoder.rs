//! Payload encoder expected by the clicker firmware: AES-128 in a
//! CBC-like mode where the per-block IV is reconstructed from the key
//! instead of being transmitted. For block index `i` the IV is
//! `reverse(key)[0..15] || i`; a one-byte block counter suffices because
//! a single wire payload never exceeds 255 bytes.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;

pub const BLOCK_SIZE: usize = 16;
pub const KEY_SIZE: usize = 16;

/// Builds the IV seed for a key: the key reversed, last byte reserved
/// for the block counter.
fn iv_seed(key: &[u8; KEY_SIZE]) -> [u8; BLOCK_SIZE] {
    let mut iv = [0u8; BLOCK_SIZE];
    for t in 0..BLOCK_SIZE - 1 {
        iv[t] = key[BLOCK_SIZE - 1 - t];
    }
    iv
}

/// Returns `key || iv_seed`, the layout `decode` consumes.
pub fn key_with_iv(key: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE + BLOCK_SIZE] {
    let mut out = [0u8; KEY_SIZE + BLOCK_SIZE];
    out[..KEY_SIZE].copy_from_slice(key);
    out[KEY_SIZE..].copy_from_slice(&iv_seed(key));
    out
}

/// Encrypts `plain` under `key`, zero-padding to a 16-byte multiple.
/// Only the real plaintext bytes are IV-masked; the trailing pad is
/// encrypted as-is, so round trips are byte-exact for the first
/// `plain.len()` bytes only.
pub fn encode(plain: &[u8], key: &[u8; KEY_SIZE]) -> Vec<u8> {
    let len = plain.len();
    let padded = (len + BLOCK_SIZE - 1) / BLOCK_SIZE * BLOCK_SIZE;

    let mut out = vec![0u8; padded];
    out[..len].copy_from_slice(plain);

    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut iv = iv_seed(key);

    for (index, chunk) in out.chunks_exact_mut(BLOCK_SIZE).enumerate() {
        iv[BLOCK_SIZE - 1] = index as u8;

        for (y, byte) in chunk.iter_mut().enumerate() {
            if index * BLOCK_SIZE + y < len {
                *byte ^= iv[y];
            }
        }

        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
    }

    out
}

/// Inverse of `encode`, operating in place. `key_and_iv` is the
/// `key || iv_seed` layout produced by `key_with_iv`. Every block is
/// fully IV-masked after decryption, including pad bytes.
pub fn decode(data: &mut [u8], key_and_iv: &[u8; KEY_SIZE + BLOCK_SIZE]) {
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&key_and_iv[..KEY_SIZE]);

    let cipher = Aes128::new(GenericArray::from_slice(&key));

    let mut iv = [0u8; BLOCK_SIZE];
    iv[..BLOCK_SIZE - 1].copy_from_slice(&key_and_iv[KEY_SIZE..KEY_SIZE + BLOCK_SIZE - 1]);

    for (index, chunk) in data.chunks_exact_mut(BLOCK_SIZE).enumerate() {
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));

        iv[BLOCK_SIZE - 1] = index as u8;
        for (y, byte) in chunk.iter_mut().enumerate() {
            *byte ^= iv[y];
        }
    }
}
