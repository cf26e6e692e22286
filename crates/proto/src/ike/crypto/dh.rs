//! Diffie-Hellman key exchange for IKE_SA_INIT and PFS rekeys
//!
//! Implements the MODP groups required by the core (RFC 2409 group 2,
//! RFC 3526 group 14). Public values and shared secrets are fixed-width
//! big-endian, left-padded to the group modulus length as the KE payload
//! requires.
//!
//! # Security
//!
//! - Peer public values are range-checked (1 < y < p-1)
//! - Private exponents are zeroized on drop

use crate::ike::{IkeError, Result};
use num_bigint::{BigUint, RandBigInt};
use once_cell::sync::Lazy;
use rand::RngCore;
use zeroize::Zeroize;

/// DH Group 2 prime (1024-bit MODP, RFC 2409 Section 6.2)
static MODP_1024_P: Lazy<BigUint> = Lazy::new(|| {
    BigUint::from_bytes_be(
        &hex::decode(
            "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
             29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
             EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
             E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
             EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381\
             FFFFFFFFFFFFFFFF",
        )
        .expect("Invalid hex"),
    )
});

/// DH Group 14 prime (2048-bit MODP, RFC 3526 Section 3)
static MODP_2048_P: Lazy<BigUint> = Lazy::new(|| {
    BigUint::from_bytes_be(
        &hex::decode(
            "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
             29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
             EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
             E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
             EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
             C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
             83655D23DCA3AD961C62F356208552BB9ED529077096966D\
             670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
             E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
             DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
             15728E5A8AACAA68FFFFFFFFFFFFFFFF",
        )
        .expect("Invalid hex"),
    )
});

/// Generator for both MODP groups
static MODP_G: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));

/// Diffie-Hellman group (IANA D-H transform ids)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DhGroup {
    /// NONE (0) - no key exchange
    None,
    /// 1024-bit MODP group (2)
    Modp1024,
    /// 2048-bit MODP group (14)
    Modp2048,
}

impl DhGroup {
    /// Resolve from the IANA transform id
    pub fn from_transform_id(id: u16) -> Option<Self> {
        match id {
            0 => Some(DhGroup::None),
            2 => Some(DhGroup::Modp1024),
            14 => Some(DhGroup::Modp2048),
            _ => None,
        }
    }

    /// IANA transform id
    pub fn transform_id(self) -> u16 {
        match self {
            DhGroup::None => 0,
            DhGroup::Modp1024 => 2,
            DhGroup::Modp2048 => 14,
        }
    }

    /// Public value / shared secret length in bytes
    pub fn key_len(self) -> usize {
        match self {
            DhGroup::None => 0,
            DhGroup::Modp1024 => 128,
            DhGroup::Modp2048 => 256,
        }
    }

    fn prime(self) -> Result<&'static BigUint> {
        match self {
            DhGroup::None => Err(IkeError::InvalidParameter(
                "DH group NONE has no parameters".into(),
            )),
            DhGroup::Modp1024 => Ok(&MODP_1024_P),
            DhGroup::Modp2048 => Ok(&MODP_2048_P),
        }
    }
}

/// An ephemeral DH key pair for one exchange.
pub struct DhKeyPair {
    group: DhGroup,
    private_key: Vec<u8>,
    public_key: Vec<u8>,
}

impl DhKeyPair {
    /// Generate a key pair with the provided CSPRNG.
    pub fn generate(group: DhGroup, rng: &mut dyn RngCore) -> Result<Self> {
        let p = group.prime()?;

        // Random private exponent x with 1 < x < p-1
        let p_minus_one = p - 1u32;
        let x = rng.gen_biguint_range(&BigUint::from(2u32), &p_minus_one);

        // Public value: y = g^x mod p
        let y = MODP_G.modpow(&x, p);

        Ok(DhKeyPair {
            group,
            private_key: x.to_bytes_be(),
            public_key: left_pad(&y.to_bytes_be(), group.key_len()),
        })
    }

    /// The group this pair belongs to.
    pub fn group(&self) -> DhGroup {
        self.group
    }

    /// The fixed-width public value for the KE payload.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Compute the shared secret `g^ir` from the peer's public value.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKe` when the peer value has the wrong width and
    /// `CryptoError` when it is outside the valid range.
    pub fn compute_shared_secret(&self, peer_public: &[u8]) -> Result<Vec<u8>> {
        if peer_public.len() != self.group.key_len() {
            return Err(IkeError::InvalidKe {
                expected: self.group.transform_id(),
                received: self.group.transform_id(),
            });
        }

        let p = self.group.prime()?;
        let y_peer = BigUint::from_bytes_be(peer_public);

        // Validate peer's public value: 1 < y < p-1
        if y_peer <= BigUint::from(1u32) || y_peer >= p - 1u32 {
            return Err(IkeError::CryptoError(
                "peer DH public value out of range".into(),
            ));
        }

        let x = BigUint::from_bytes_be(&self.private_key);
        let k = y_peer.modpow(&x, p);

        Ok(left_pad(&k.to_bytes_be(), self.group.key_len()))
    }
}

impl Drop for DhKeyPair {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose the private exponent
        f.debug_struct("DhKeyPair")
            .field("group", &self.group)
            .finish()
    }
}

fn left_pad(data: &[u8], width: usize) -> Vec<u8> {
    if data.len() >= width {
        return data[data.len() - width..].to_vec();
    }
    let mut padded = vec![0u8; width];
    padded[width - data.len()..].copy_from_slice(data);
    padded
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_group_parameters() {
        assert_eq!(DhGroup::Modp1024.key_len(), 128);
        assert_eq!(DhGroup::Modp2048.key_len(), 256);
        assert_eq!(DhGroup::None.key_len(), 0);
    }

    #[test]
    fn test_transform_id_roundtrip() {
        for group in [DhGroup::None, DhGroup::Modp1024, DhGroup::Modp2048] {
            assert_eq!(DhGroup::from_transform_id(group.transform_id()), Some(group));
        }
        assert_eq!(DhGroup::from_transform_id(31), None);
    }

    #[test]
    fn test_modp_1024_agreement() {
        let alice = DhKeyPair::generate(DhGroup::Modp1024, &mut OsRng).unwrap();
        let bob = DhKeyPair::generate(DhGroup::Modp1024, &mut OsRng).unwrap();

        assert_eq!(alice.public_key().len(), 128);

        let k_alice = alice.compute_shared_secret(bob.public_key()).unwrap();
        let k_bob = bob.compute_shared_secret(alice.public_key()).unwrap();

        assert_eq!(k_alice, k_bob);
        assert_eq!(k_alice.len(), 128);
    }

    #[test]
    fn test_modp_2048_agreement() {
        let alice = DhKeyPair::generate(DhGroup::Modp2048, &mut OsRng).unwrap();
        let bob = DhKeyPair::generate(DhGroup::Modp2048, &mut OsRng).unwrap();

        let k_alice = alice.compute_shared_secret(bob.public_key()).unwrap();
        let k_bob = bob.compute_shared_secret(alice.public_key()).unwrap();

        assert_eq!(k_alice, k_bob);
        assert_eq!(k_alice.len(), 256);
    }

    #[test]
    fn test_rejects_out_of_range_peer_value() {
        let pair = DhKeyPair::generate(DhGroup::Modp1024, &mut OsRng).unwrap();

        // y = 1 is invalid
        let mut one = vec![0u8; 128];
        one[127] = 1;
        assert!(pair.compute_shared_secret(&one).is_err());

        // y = p - 1 is invalid
        let p_minus_one = (&*MODP_1024_P - 1u32).to_bytes_be();
        assert!(pair.compute_shared_secret(&p_minus_one).is_err());
    }

    #[test]
    fn test_rejects_wrong_width() {
        let pair = DhKeyPair::generate(DhGroup::Modp1024, &mut OsRng).unwrap();
        let result = pair.compute_shared_secret(&[0x42; 256]);
        assert!(matches!(result, Err(IkeError::InvalidKe { .. })));
    }

    #[test]
    fn test_group_none_has_no_key_pair() {
        assert!(DhKeyPair::generate(DhGroup::None, &mut OsRng).is_err());
    }

    #[test]
    fn test_left_pad() {
        assert_eq!(left_pad(&[0x01], 4), vec![0, 0, 0, 1]);
        assert_eq!(left_pad(&[1, 2, 3, 4], 4), vec![1, 2, 3, 4]);
    }
}
