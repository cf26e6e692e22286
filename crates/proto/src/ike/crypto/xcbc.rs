//! AES-XCBC-MAC core (RFC 3566)
//!
//! Shared by `PRF_AES128_XCBC` (RFC 4434) and `AUTH_AES_XCBC_96`.
//! The key is always 128 bits; callers apply the RFC 4434 key
//! normalization before reaching this module.

use crate::ike::{IkeError, Result};
use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;

/// AES block size in bytes
const BLOCK_SIZE: usize = 16;

/// Compute the full 128-bit AES-XCBC-MAC over `data`.
///
/// # Arguments
///
/// * `key` - 16-byte MAC key
/// * `data` - Message of any length (including empty)
///
/// # Returns
///
/// Returns the untruncated 16-byte MAC.
pub fn aes_xcbc_mac(key: &[u8], data: &[u8]) -> Result<[u8; 16]> {
    if key.len() != BLOCK_SIZE {
        return Err(IkeError::CryptoError(format!(
            "AES-XCBC key must be 16 bytes, got {}",
            key.len()
        )));
    }

    let cipher = Aes128::new(GenericArray::from_slice(key));

    // Derive K1, K2, K3 by encrypting the constant blocks (RFC 3566 Section 4)
    let k1 = encrypt_constant(&cipher, 0x01);
    let k2 = encrypt_constant(&cipher, 0x02);
    let k3 = encrypt_constant(&cipher, 0x03);

    let subkey_cipher = Aes128::new(GenericArray::from_slice(&k1));

    let mut e = [0u8; BLOCK_SIZE];

    // Number of blocks, counting a final (possibly partial) block even for
    // empty input
    let n = if data.is_empty() {
        1
    } else {
        (data.len() + BLOCK_SIZE - 1) / BLOCK_SIZE
    };

    for i in 0..n.saturating_sub(1) {
        let block = &data[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE];
        for (e_byte, m_byte) in e.iter_mut().zip(block) {
            *e_byte ^= m_byte;
        }
        let mut ga = GenericArray::clone_from_slice(&e);
        subkey_cipher.encrypt_block(&mut ga);
        e.copy_from_slice(&ga);
    }

    // Last block: full blocks mix K2, partial blocks are 0x80-padded and mix K3
    let last = if data.is_empty() {
        &[][..]
    } else {
        &data[(n - 1) * BLOCK_SIZE..]
    };

    if last.len() == BLOCK_SIZE {
        for ((e_byte, m_byte), k_byte) in e.iter_mut().zip(last).zip(&k2) {
            *e_byte ^= m_byte ^ k_byte;
        }
    } else {
        let mut padded = [0u8; BLOCK_SIZE];
        padded[..last.len()].copy_from_slice(last);
        padded[last.len()] = 0x80;
        for ((e_byte, m_byte), k_byte) in e.iter_mut().zip(&padded).zip(&k3) {
            *e_byte ^= m_byte ^ k_byte;
        }
    }

    let mut ga = GenericArray::clone_from_slice(&e);
    subkey_cipher.encrypt_block(&mut ga);
    e.copy_from_slice(&ga);

    Ok(e)
}

fn encrypt_constant(cipher: &Aes128, value: u8) -> [u8; 16] {
    let mut block = GenericArray::clone_from_slice(&[value; BLOCK_SIZE]);
    cipher.encrypt_block(&mut block);
    let mut out = [0u8; 16];
    out.copy_from_slice(&block);
    out
}
