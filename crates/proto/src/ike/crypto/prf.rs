//! Pseudo-Random Function (PRF) implementations
//!
//! Implements the negotiable PRF algorithms for IKEv2 key derivation as
//! defined in RFC 7296, keyed by IANA transform id.

use super::xcbc::aes_xcbc_mac;
use crate::ike::{IkeError, Result};
use hmac::{Hmac, Mac};
use sha1::Sha1;

/// PRF algorithm (IANA PRF transform ids)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrfAlgorithm {
    /// PRF_HMAC_SHA1 (2)
    HmacSha1,
    /// PRF_AES128_XCBC (4)
    Aes128Xcbc,
}

impl PrfAlgorithm {
    /// Resolve from the IANA transform id
    pub fn from_transform_id(id: u16) -> Option<Self> {
        match id {
            2 => Some(PrfAlgorithm::HmacSha1),
            4 => Some(PrfAlgorithm::Aes128Xcbc),
            _ => None,
        }
    }

    /// IANA transform id
    pub fn transform_id(self) -> u16 {
        match self {
            PrfAlgorithm::HmacSha1 => 2,
            PrfAlgorithm::Aes128Xcbc => 4,
        }
    }

    /// Preferred key length in bytes (RFC 7296 Section 2.14)
    pub fn key_len(self) -> usize {
        match self {
            PrfAlgorithm::HmacSha1 => 20,
            PrfAlgorithm::Aes128Xcbc => 16,
        }
    }

    /// PRF output length in bytes
    pub fn output_len(self) -> usize {
        match self {
            PrfAlgorithm::HmacSha1 => 20,
            PrfAlgorithm::Aes128Xcbc => 16,
        }
    }

    /// Compute PRF(key, data).
    ///
    /// HMAC accepts keys of any length. AES-XCBC applies the RFC 4434 key
    /// rules: shorter keys are zero-padded to 16 bytes, longer keys are
    /// first run through the PRF under an all-zero key.
    pub fn compute(self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        match self {
            PrfAlgorithm::HmacSha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(key)
                    .map_err(|_| IkeError::CryptoError("HMAC key setup failed".into()))?;
                mac.update(data);
                Ok(mac.finalize().into_bytes().to_vec())
            }
            PrfAlgorithm::Aes128Xcbc => {
                let normalized = normalize_xcbc_key(key)?;
                Ok(aes_xcbc_mac(&normalized, data)?.to_vec())
            }
        }
    }

    /// Compute prf+ (key expansion function)
    ///
    /// Defined in RFC 7296 Section 2.13:
    /// ```text
    /// prf+ (K,S) = T1 | T2 | T3 | T4 | ...
    ///
    /// where:
    /// T1 = prf (K, S | 0x01)
    /// T2 = prf (K, T1 | S | 0x02)
    /// T3 = prf (K, T2 | S | 0x03)
    /// ...
    /// ```
    ///
    /// The concatenation is truncated to `output_len` bytes. The iteration
    /// counter is a single byte, so at most `255 * output_len()` bytes can
    /// be produced.
    pub fn prf_plus(self, key: &[u8], seed: &[u8], output_len: usize) -> Result<Vec<u8>> {
        if output_len > 255 * self.output_len() {
            return Err(IkeError::Internal(format!(
                "prf+ output of {} bytes exceeds the one-byte counter limit",
                output_len
            )));
        }

        let mut output = Vec::with_capacity(output_len);
        let mut t = Vec::new();
        let mut counter: u8 = 1;

        while output.len() < output_len {
            // Build input: T(i-1) | S | counter
            let mut input = Vec::with_capacity(t.len() + seed.len() + 1);
            input.extend_from_slice(&t);
            input.extend_from_slice(seed);
            input.push(counter);

            t = self.compute(key, &input)?;
            output.extend_from_slice(&t);

            counter = counter.wrapping_add(1);
        }

        output.truncate(output_len);
        Ok(output)
    }
}

/// RFC 4434 Section 2 key normalization for AES-XCBC-PRF-128.
fn normalize_xcbc_key(key: &[u8]) -> Result<[u8; 16]> {
    let mut normalized = [0u8; 16];
    if key.len() == 16 {
        normalized.copy_from_slice(key);
    } else if key.len() < 16 {
        normalized[..key.len()].copy_from_slice(key);
    } else {
        normalized.copy_from_slice(&aes_xcbc_mac(&[0u8; 16], key)?);
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_lengths() {
        assert_eq!(PrfAlgorithm::HmacSha1.output_len(), 20);
        assert_eq!(PrfAlgorithm::Aes128Xcbc.output_len(), 16);
        assert_eq!(PrfAlgorithm::HmacSha1.key_len(), 20);
    }

    #[test]
    fn test_transform_id_roundtrip() {
        assert_eq!(
            PrfAlgorithm::from_transform_id(2),
            Some(PrfAlgorithm::HmacSha1)
        );
        assert_eq!(
            PrfAlgorithm::from_transform_id(4),
            Some(PrfAlgorithm::Aes128Xcbc)
        );
        assert_eq!(PrfAlgorithm::from_transform_id(99), None);
        assert_eq!(PrfAlgorithm::HmacSha1.transform_id(), 2);
    }

    #[test]
    fn test_hmac_sha1_vector() {
        // SK_pi vector: prf(SK_pi, IDi') used for AUTH payload computation
        let key = hex::decode("094787780EE466E2CB049FA327B43908BC57E485").unwrap();
        let data = hex::decode("010000000a50500d").unwrap();

        let output = PrfAlgorithm::HmacSha1.compute(&key, &data).unwrap();
        assert_eq!(
            hex::encode_upper(output),
            "D83B20CC6A0932B2A7CEF26E4020ABAAB64F0C6A"
        );
    }

    #[test]
    fn test_prf_deterministic() {
        let key = b"test key";
        let data = b"test data";

        let a = PrfAlgorithm::HmacSha1.compute(key, data).unwrap();
        let b = PrfAlgorithm::HmacSha1.compute(key, data).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 20);
    }

    #[test]
    fn test_xcbc_prf_short_key_padded() {
        // RFC 4434: shorter keys are zero-padded, so these two must agree
        let short = PrfAlgorithm::Aes128Xcbc.compute(b"abc", b"data").unwrap();
        let mut padded_key = [0u8; 16];
        padded_key[..3].copy_from_slice(b"abc");
        let padded = PrfAlgorithm::Aes128Xcbc
            .compute(&padded_key, b"data")
            .unwrap();
        assert_eq!(short, padded);
    }

    #[test]
    fn test_xcbc_prf_long_key_digested() {
        let long_key = [0x5a_u8; 40];
        let output = PrfAlgorithm::Aes128Xcbc
            .compute(&long_key, b"data")
            .unwrap();
        assert_eq!(output.len(), 16);

        // Must differ from using the first 16 bytes directly
        let truncated = PrfAlgorithm::Aes128Xcbc
            .compute(&long_key[..16], b"data")
            .unwrap();
        assert_ne!(output, truncated);
    }

    #[test]
    fn test_prf_plus_prefix_property() {
        let key = b"secret key";
        let seed = b"seed data";

        let short = PrfAlgorithm::HmacSha1.prf_plus(key, seed, 16).unwrap();
        let long = PrfAlgorithm::HmacSha1.prf_plus(key, seed, 72).unwrap();

        assert_eq!(long.len(), 72);
        assert_eq!(&short[..], &long[..16]);
    }

    #[test]
    fn test_prf_plus_expansion_boundary() {
        let key = b"secret key";
        let seed = b"seed data";

        // Exactly two blocks for HMAC-SHA1
        let output = PrfAlgorithm::HmacSha1.prf_plus(key, seed, 40).unwrap();
        assert_eq!(output.len(), 40);
    }

    #[test]
    fn test_prf_plus_counter_limit() {
        let result = PrfAlgorithm::HmacSha1.prf_plus(b"k", b"s", 255 * 20 + 1);
        assert!(matches!(result, Err(IkeError::Internal(_))));
    }
}
