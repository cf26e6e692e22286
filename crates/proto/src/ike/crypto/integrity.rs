//! Integrity (keyed MAC) algorithms for the encrypted payload envelope
//!
//! Implements the INTEG transforms from the IANA IKEv2 registry. Each
//! algorithm produces a truncated checksum; verification is constant-time.

use super::xcbc::aes_xcbc_mac;
use crate::ike::{IkeError, Result};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq;

/// Integrity algorithm (IANA INTEG transform ids)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityAlgorithm {
    /// AUTH_NONE (0) - only valid with AEAD ciphers
    None,
    /// AUTH_HMAC_SHA1_96 (2)
    HmacSha1_96,
    /// AUTH_AES_XCBC_96 (5)
    AesXcbc96,
    /// AUTH_HMAC_SHA2_256_128 (12)
    HmacSha256_128,
    /// AUTH_HMAC_SHA2_384_192 (13)
    HmacSha384_192,
    /// AUTH_HMAC_SHA2_512_256 (14)
    HmacSha512_256,
}

impl IntegrityAlgorithm {
    /// Resolve from the IANA transform id
    pub fn from_transform_id(id: u16) -> Option<Self> {
        match id {
            0 => Some(IntegrityAlgorithm::None),
            2 => Some(IntegrityAlgorithm::HmacSha1_96),
            5 => Some(IntegrityAlgorithm::AesXcbc96),
            12 => Some(IntegrityAlgorithm::HmacSha256_128),
            13 => Some(IntegrityAlgorithm::HmacSha384_192),
            14 => Some(IntegrityAlgorithm::HmacSha512_256),
            _ => None,
        }
    }

    /// IANA transform id
    pub fn transform_id(self) -> u16 {
        match self {
            IntegrityAlgorithm::None => 0,
            IntegrityAlgorithm::HmacSha1_96 => 2,
            IntegrityAlgorithm::AesXcbc96 => 5,
            IntegrityAlgorithm::HmacSha256_128 => 12,
            IntegrityAlgorithm::HmacSha384_192 => 13,
            IntegrityAlgorithm::HmacSha512_256 => 14,
        }
    }

    /// Key length in bytes
    pub fn key_len(self) -> usize {
        match self {
            IntegrityAlgorithm::None => 0,
            IntegrityAlgorithm::HmacSha1_96 => 20,
            IntegrityAlgorithm::AesXcbc96 => 16,
            IntegrityAlgorithm::HmacSha256_128 => 32,
            IntegrityAlgorithm::HmacSha384_192 => 48,
            IntegrityAlgorithm::HmacSha512_256 => 64,
        }
    }

    /// Truncated checksum length in bytes
    pub fn checksum_len(self) -> usize {
        match self {
            IntegrityAlgorithm::None => 0,
            IntegrityAlgorithm::HmacSha1_96 => 12,
            IntegrityAlgorithm::AesXcbc96 => 12,
            IntegrityAlgorithm::HmacSha256_128 => 16,
            IntegrityAlgorithm::HmacSha384_192 => 24,
            IntegrityAlgorithm::HmacSha512_256 => 32,
        }
    }

    /// Compute the truncated checksum over `data`.
    pub fn compute_checksum(self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        if key.len() != self.key_len() {
            return Err(IkeError::CryptoError(format!(
                "integrity key must be {} bytes, got {}",
                self.key_len(),
                key.len()
            )));
        }

        let full = match self {
            IntegrityAlgorithm::None => {
                return Err(IkeError::CryptoError(
                    "AUTH_NONE has no checksum".into(),
                ))
            }
            IntegrityAlgorithm::HmacSha1_96 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(key)
                    .map_err(|_| IkeError::CryptoError("HMAC key setup failed".into()))?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            IntegrityAlgorithm::AesXcbc96 => aes_xcbc_mac(key, data)?.to_vec(),
            IntegrityAlgorithm::HmacSha256_128 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(key)
                    .map_err(|_| IkeError::CryptoError("HMAC key setup failed".into()))?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            IntegrityAlgorithm::HmacSha384_192 => {
                let mut mac = Hmac::<Sha384>::new_from_slice(key)
                    .map_err(|_| IkeError::CryptoError("HMAC key setup failed".into()))?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            IntegrityAlgorithm::HmacSha512_256 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(key)
                    .map_err(|_| IkeError::CryptoError("HMAC key setup failed".into()))?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        };

        let mut checksum = full;
        checksum.truncate(self.checksum_len());
        Ok(checksum)
    }

    /// Verify a received checksum in constant time.
    ///
    /// # Errors
    ///
    /// Returns `IntegrityCheckFailed` on mismatch or length mismatch.
    pub fn verify_checksum(self, key: &[u8], data: &[u8], received: &[u8]) -> Result<()> {
        if received.len() != self.checksum_len() {
            return Err(IkeError::IntegrityCheckFailed);
        }

        let expected = self.compute_checksum(key, data)?;
        if expected.ct_eq(received).into() {
            Ok(())
        } else {
            Err(IkeError::IntegrityCheckFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_and_checksum_lengths() {
        assert_eq!(IntegrityAlgorithm::HmacSha1_96.key_len(), 20);
        assert_eq!(IntegrityAlgorithm::HmacSha1_96.checksum_len(), 12);
        assert_eq!(IntegrityAlgorithm::AesXcbc96.key_len(), 16);
        assert_eq!(IntegrityAlgorithm::AesXcbc96.checksum_len(), 12);
        assert_eq!(IntegrityAlgorithm::HmacSha256_128.checksum_len(), 16);
        assert_eq!(IntegrityAlgorithm::HmacSha384_192.checksum_len(), 24);
        assert_eq!(IntegrityAlgorithm::HmacSha512_256.checksum_len(), 32);
        assert_eq!(IntegrityAlgorithm::None.checksum_len(), 0);
    }

    #[test]
    fn test_transform_id_roundtrip() {
        for algo in [
            IntegrityAlgorithm::None,
            IntegrityAlgorithm::HmacSha1_96,
            IntegrityAlgorithm::AesXcbc96,
            IntegrityAlgorithm::HmacSha256_128,
            IntegrityAlgorithm::HmacSha384_192,
            IntegrityAlgorithm::HmacSha512_256,
        ] {
            assert_eq!(
                IntegrityAlgorithm::from_transform_id(algo.transform_id()),
                Some(algo)
            );
        }
        assert_eq!(IntegrityAlgorithm::from_transform_id(99), None);
    }

    #[test]
    fn test_checksum_truncation() {
        let key = vec![0x0b; 20];
        let checksum = IntegrityAlgorithm::HmacSha1_96
            .compute_checksum(&key, b"Hi There")
            .unwrap();
        assert_eq!(checksum.len(), 12);

        // RFC 2202 test case 1, truncated to 96 bits
        assert_eq!(hex::encode(&checksum), "b617318655057264e28bc0b6");
    }

    #[test]
    fn test_verify_accepts_valid() {
        let key = vec![0x42; 32];
        let data = b"authenticated span";
        let checksum = IntegrityAlgorithm::HmacSha256_128
            .compute_checksum(&key, data)
            .unwrap();

        assert!(IntegrityAlgorithm::HmacSha256_128
            .verify_checksum(&key, data, &checksum)
            .is_ok());
    }

    #[test]
    fn test_verify_rejects_bit_flip() {
        let key = vec![0x42; 32];
        let data = b"authenticated span";
        let mut checksum = IntegrityAlgorithm::HmacSha256_128
            .compute_checksum(&key, data)
            .unwrap();
        checksum[0] ^= 0x01;

        let result = IntegrityAlgorithm::HmacSha256_128.verify_checksum(&key, data, &checksum);
        assert!(matches!(result, Err(IkeError::IntegrityCheckFailed)));
    }

    #[test]
    fn test_verify_rejects_wrong_length() {
        let key = vec![0x42; 20];
        let result = IntegrityAlgorithm::HmacSha1_96.verify_checksum(&key, b"data", &[0u8; 11]);
        assert!(matches!(result, Err(IkeError::IntegrityCheckFailed)));
    }

    #[test]
    fn test_wrong_key_length_rejected() {
        let result = IntegrityAlgorithm::AesXcbc96.compute_checksum(&[0u8; 10], b"data");
        assert!(matches!(result, Err(IkeError::CryptoError(_))));
    }
}
