//! Cipher implementations for the IKEv2 encrypted payload
//!
//! Implements the ENCR transforms required by the core: 3DES-CBC, AES-CBC
//! and AES-GCM with 8/12/16-byte ICVs. Normal (CBC) ciphers pair with a
//! separate integrity algorithm; AES-GCM is combined-mode and carries its
//! ICV inside the AEAD tag.
//!
//! For AES-GCM the negotiated key material is `key | salt`: the last four
//! bytes are the implicit salt and the 12-byte nonce is `salt | wire IV`
//! (RFC 4106 layout).

use crate::ike::{IkeError, Result};
use aes::cipher::consts::{U12, U16, U8};
use aes::{Aes128, Aes192, Aes256};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::AesGcm;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use des::TdesEde3;
use rand::RngCore;

/// AES-GCM salt length in bytes (RFC 4106)
const GCM_SALT_LEN: usize = 4;

/// Cipher family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CipherKind {
    TripleDesCbc,
    AesCbc,
    AesGcm8,
    AesGcm12,
    AesGcm16,
}

/// A negotiated encryption algorithm instance.
///
/// Built from the ENCR transform id plus the key-length attribute, since
/// AES transforms share one id across key sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IkeCipher {
    kind: CipherKind,
    key_len: usize,
}

impl IkeCipher {
    /// ENCR_3DES transform id
    pub const ENCR_3DES: u16 = 3;
    /// ENCR_AES_CBC transform id
    pub const ENCR_AES_CBC: u16 = 12;
    /// ENCR_AES_GCM_8 transform id
    pub const ENCR_AES_GCM_8: u16 = 18;
    /// ENCR_AES_GCM_12 transform id
    pub const ENCR_AES_GCM_12: u16 = 19;
    /// ENCR_AES_GCM_16 transform id
    pub const ENCR_AES_GCM_16: u16 = 20;

    /// Build a cipher from its IANA transform id and key length.
    ///
    /// # Arguments
    ///
    /// * `transform_id` - ENCR transform id
    /// * `key_len_bits` - Key-length attribute; ignored for 3DES
    pub fn new(transform_id: u16, key_len_bits: usize) -> Result<Self> {
        let (kind, key_len) = match transform_id {
            Self::ENCR_3DES => (CipherKind::TripleDesCbc, 24),
            Self::ENCR_AES_CBC => (CipherKind::AesCbc, validate_aes_key(key_len_bits)?),
            Self::ENCR_AES_GCM_8 => (CipherKind::AesGcm8, validate_aes_key(key_len_bits)?),
            Self::ENCR_AES_GCM_12 => (CipherKind::AesGcm12, validate_aes_key(key_len_bits)?),
            Self::ENCR_AES_GCM_16 => (CipherKind::AesGcm16, validate_aes_key(key_len_bits)?),
            other => {
                return Err(IkeError::InvalidParameter(format!(
                    "unsupported ENCR transform id {}",
                    other
                )))
            }
        };
        Ok(IkeCipher { kind, key_len })
    }

    /// IANA transform id
    pub fn transform_id(self) -> u16 {
        match self.kind {
            CipherKind::TripleDesCbc => Self::ENCR_3DES,
            CipherKind::AesCbc => Self::ENCR_AES_CBC,
            CipherKind::AesGcm8 => Self::ENCR_AES_GCM_8,
            CipherKind::AesGcm12 => Self::ENCR_AES_GCM_12,
            CipherKind::AesGcm16 => Self::ENCR_AES_GCM_16,
        }
    }

    /// Cipher key length in bytes (without the AEAD salt)
    pub fn key_len(self) -> usize {
        self.key_len
    }

    /// Length of key material to take from PRF+ output
    ///
    /// AES-GCM appends a 4-byte salt after the key proper.
    pub fn keymat_len(self) -> usize {
        if self.is_aead() {
            self.key_len + GCM_SALT_LEN
        } else {
            self.key_len
        }
    }

    /// Block size used for pad-length computation
    pub fn block_size(self) -> usize {
        match self.kind {
            CipherKind::TripleDesCbc => 8,
            CipherKind::AesCbc => 16,
            // AEAD needs no block alignment; pad to 4 for tidy encoding
            CipherKind::AesGcm8 | CipherKind::AesGcm12 | CipherKind::AesGcm16 => 4,
        }
    }

    /// Length of the on-wire IV
    pub fn iv_len(self) -> usize {
        match self.kind {
            CipherKind::TripleDesCbc => 8,
            CipherKind::AesCbc => 16,
            CipherKind::AesGcm8 | CipherKind::AesGcm12 | CipherKind::AesGcm16 => 8,
        }
    }

    /// Whether this is a combined-mode (AEAD) cipher
    pub fn is_aead(self) -> bool {
        matches!(
            self.kind,
            CipherKind::AesGcm8 | CipherKind::AesGcm12 | CipherKind::AesGcm16
        )
    }

    /// ICV length for combined-mode ciphers (0 for normal ciphers)
    pub fn checksum_len(self) -> usize {
        match self.kind {
            CipherKind::TripleDesCbc | CipherKind::AesCbc => 0,
            CipherKind::AesGcm8 => 8,
            CipherKind::AesGcm12 => 12,
            CipherKind::AesGcm16 => 16,
        }
    }

    /// Draw a fresh IV from the provided CSPRNG.
    pub fn generate_iv(self, rng: &mut dyn RngCore) -> Vec<u8> {
        let mut iv = vec![0u8; self.iv_len()];
        rng.fill_bytes(&mut iv);
        iv
    }

    /// Encrypt padded plaintext.
    ///
    /// # Arguments
    ///
    /// * `keymat` - Key material (`keymat_len()` bytes)
    /// * `iv` - On-wire IV (`iv_len()` bytes)
    /// * `plaintext` - Already padded to `block_size()` for normal ciphers
    /// * `aad` - Associated data for AEAD ciphers (ignored otherwise)
    ///
    /// # Returns
    ///
    /// Ciphertext; for AEAD ciphers the ICV tag is appended.
    pub fn encrypt(
        self,
        keymat: &[u8],
        iv: &[u8],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>> {
        self.validate_inputs(keymat, iv)?;

        match self.kind {
            CipherKind::TripleDesCbc => {
                check_block_aligned(plaintext.len(), 8)?;
                let enc = cbc::Encryptor::<TdesEde3>::new_from_slices(keymat, iv)
                    .map_err(|_| IkeError::CryptoError("3DES-CBC setup failed".into()))?;
                Ok(enc.encrypt_padded_vec_mut::<NoPadding>(plaintext))
            }
            CipherKind::AesCbc => {
                check_block_aligned(plaintext.len(), 16)?;
                match self.key_len {
                    16 => {
                        let enc = cbc::Encryptor::<Aes128>::new_from_slices(keymat, iv)
                            .map_err(|_| IkeError::CryptoError("AES-CBC setup failed".into()))?;
                        Ok(enc.encrypt_padded_vec_mut::<NoPadding>(plaintext))
                    }
                    24 => {
                        let enc = cbc::Encryptor::<Aes192>::new_from_slices(keymat, iv)
                            .map_err(|_| IkeError::CryptoError("AES-CBC setup failed".into()))?;
                        Ok(enc.encrypt_padded_vec_mut::<NoPadding>(plaintext))
                    }
                    _ => {
                        let enc = cbc::Encryptor::<Aes256>::new_from_slices(keymat, iv)
                            .map_err(|_| IkeError::CryptoError("AES-CBC setup failed".into()))?;
                        Ok(enc.encrypt_padded_vec_mut::<NoPadding>(plaintext))
                    }
                }
            }
            CipherKind::AesGcm8 | CipherKind::AesGcm12 | CipherKind::AesGcm16 => {
                let nonce = self.build_nonce(keymat, iv);
                let payload = Payload {
                    msg: plaintext,
                    aad,
                };
                self.gcm_seal(&keymat[..self.key_len], &nonce, payload)
            }
        }
    }

    /// Decrypt ciphertext.
    ///
    /// For AEAD ciphers the trailing ICV tag is verified and stripped;
    /// verification failure maps to `IntegrityCheckFailed`.
    pub fn decrypt(
        self,
        keymat: &[u8],
        iv: &[u8],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>> {
        self.validate_inputs(keymat, iv)?;

        match self.kind {
            CipherKind::TripleDesCbc => {
                check_block_aligned(ciphertext.len(), 8)?;
                let dec = cbc::Decryptor::<TdesEde3>::new_from_slices(keymat, iv)
                    .map_err(|_| IkeError::CryptoError("3DES-CBC setup failed".into()))?;
                dec.decrypt_padded_vec_mut::<NoPadding>(ciphertext)
                    .map_err(|_| IkeError::CryptoError("3DES-CBC decrypt failed".into()))
            }
            CipherKind::AesCbc => {
                check_block_aligned(ciphertext.len(), 16)?;
                match self.key_len {
                    16 => cbc::Decryptor::<Aes128>::new_from_slices(keymat, iv)
                        .map_err(|_| IkeError::CryptoError("AES-CBC setup failed".into()))?
                        .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
                        .map_err(|_| IkeError::CryptoError("AES-CBC decrypt failed".into())),
                    24 => cbc::Decryptor::<Aes192>::new_from_slices(keymat, iv)
                        .map_err(|_| IkeError::CryptoError("AES-CBC setup failed".into()))?
                        .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
                        .map_err(|_| IkeError::CryptoError("AES-CBC decrypt failed".into())),
                    _ => cbc::Decryptor::<Aes256>::new_from_slices(keymat, iv)
                        .map_err(|_| IkeError::CryptoError("AES-CBC setup failed".into()))?
                        .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
                        .map_err(|_| IkeError::CryptoError("AES-CBC decrypt failed".into())),
                }
            }
            CipherKind::AesGcm8 | CipherKind::AesGcm12 | CipherKind::AesGcm16 => {
                if ciphertext.len() < self.checksum_len() {
                    return Err(IkeError::BufferTooShort {
                        required: self.checksum_len(),
                        available: ciphertext.len(),
                    });
                }
                let nonce = self.build_nonce(keymat, iv);
                let payload = Payload {
                    msg: ciphertext,
                    aad,
                };
                self.gcm_open(&keymat[..self.key_len], &nonce, payload)
            }
        }
    }

    fn build_nonce(self, keymat: &[u8], iv: &[u8]) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..GCM_SALT_LEN].copy_from_slice(&keymat[self.key_len..]);
        nonce[GCM_SALT_LEN..].copy_from_slice(iv);
        nonce
    }

    fn gcm_seal(self, key: &[u8], nonce: &[u8; 12], payload: Payload<'_, '_>) -> Result<Vec<u8>> {
        let nonce = aes_gcm::Nonce::from_slice(nonce);
        let result = match (self.kind, self.key_len) {
            (CipherKind::AesGcm8, 16) => AesGcm::<Aes128, U12, U8>::new_from_slice(key)
                .map_err(setup_err)?
                .encrypt(nonce, payload),
            (CipherKind::AesGcm8, 24) => AesGcm::<Aes192, U12, U8>::new_from_slice(key)
                .map_err(setup_err)?
                .encrypt(nonce, payload),
            (CipherKind::AesGcm8, _) => AesGcm::<Aes256, U12, U8>::new_from_slice(key)
                .map_err(setup_err)?
                .encrypt(nonce, payload),
            (CipherKind::AesGcm12, 16) => AesGcm::<Aes128, U12, U12>::new_from_slice(key)
                .map_err(setup_err)?
                .encrypt(nonce, payload),
            (CipherKind::AesGcm12, 24) => AesGcm::<Aes192, U12, U12>::new_from_slice(key)
                .map_err(setup_err)?
                .encrypt(nonce, payload),
            (CipherKind::AesGcm12, _) => AesGcm::<Aes256, U12, U12>::new_from_slice(key)
                .map_err(setup_err)?
                .encrypt(nonce, payload),
            (_, 16) => AesGcm::<Aes128, U12, U16>::new_from_slice(key)
                .map_err(setup_err)?
                .encrypt(nonce, payload),
            (_, 24) => AesGcm::<Aes192, U12, U16>::new_from_slice(key)
                .map_err(setup_err)?
                .encrypt(nonce, payload),
            (_, _) => AesGcm::<Aes256, U12, U16>::new_from_slice(key)
                .map_err(setup_err)?
                .encrypt(nonce, payload),
        };
        result.map_err(|_| IkeError::CryptoError("AES-GCM encryption failed".into()))
    }

    fn gcm_open(self, key: &[u8], nonce: &[u8; 12], payload: Payload<'_, '_>) -> Result<Vec<u8>> {
        let nonce = aes_gcm::Nonce::from_slice(nonce);
        let result = match (self.kind, self.key_len) {
            (CipherKind::AesGcm8, 16) => AesGcm::<Aes128, U12, U8>::new_from_slice(key)
                .map_err(setup_err)?
                .decrypt(nonce, payload),
            (CipherKind::AesGcm8, 24) => AesGcm::<Aes192, U12, U8>::new_from_slice(key)
                .map_err(setup_err)?
                .decrypt(nonce, payload),
            (CipherKind::AesGcm8, _) => AesGcm::<Aes256, U12, U8>::new_from_slice(key)
                .map_err(setup_err)?
                .decrypt(nonce, payload),
            (CipherKind::AesGcm12, 16) => AesGcm::<Aes128, U12, U12>::new_from_slice(key)
                .map_err(setup_err)?
                .decrypt(nonce, payload),
            (CipherKind::AesGcm12, 24) => AesGcm::<Aes192, U12, U12>::new_from_slice(key)
                .map_err(setup_err)?
                .decrypt(nonce, payload),
            (CipherKind::AesGcm12, _) => AesGcm::<Aes256, U12, U12>::new_from_slice(key)
                .map_err(setup_err)?
                .decrypt(nonce, payload),
            (_, 16) => AesGcm::<Aes128, U12, U16>::new_from_slice(key)
                .map_err(setup_err)?
                .decrypt(nonce, payload),
            (_, 24) => AesGcm::<Aes192, U12, U16>::new_from_slice(key)
                .map_err(setup_err)?
                .decrypt(nonce, payload),
            (_, _) => AesGcm::<Aes256, U12, U16>::new_from_slice(key)
                .map_err(setup_err)?
                .decrypt(nonce, payload),
        };
        // AEAD failure means tag mismatch: integrity, not syntax
        result.map_err(|_| IkeError::IntegrityCheckFailed)
    }

    fn validate_inputs(self, keymat: &[u8], iv: &[u8]) -> Result<()> {
        if keymat.len() != self.keymat_len() {
            return Err(IkeError::CryptoError(format!(
                "cipher key material must be {} bytes, got {}",
                self.keymat_len(),
                keymat.len()
            )));
        }
        if iv.len() != self.iv_len() {
            return Err(IkeError::CryptoError(format!(
                "IV must be {} bytes, got {}",
                self.iv_len(),
                iv.len()
            )));
        }
        Ok(())
    }
}

fn validate_aes_key(key_len_bits: usize) -> Result<usize> {
    match key_len_bits {
        128 => Ok(16),
        192 => Ok(24),
        256 => Ok(32),
        other => Err(IkeError::InvalidParameter(format!(
            "invalid AES key length attribute: {} bits",
            other
        ))),
    }
}

fn check_block_aligned(len: usize, block: usize) -> Result<()> {
    if len % block != 0 {
        return Err(IkeError::CryptoError(format!(
            "data length {} not aligned to {}-byte blocks",
            len, block
        )));
    }
    Ok(())
}

fn setup_err<E>(_: E) -> IkeError {
    IkeError::CryptoError("AES-GCM cipher setup failed".into())
}
