//! AUTH payload computation (RFC 7296 Sections 2.15 / 2.16)
//!
//! After an EAP method produces an MSK, both sides prove possession of it:
//!
//! ```text
//! SignedOctets(I) = RealMessage1 | NonceR | prf(SK_pi, IDi')
//! SignedOctets(R) = RealMessage2 | NonceI | prf(SK_pr, IDr')
//! AUTH            = prf(prf(MSK, "Key Pad for IKEv2"), SignedOctets)
//! ```
//!
//! `IDx'` is the identification payload body without its generic header.

use crate::ike::crypto::PrfAlgorithm;
use crate::ike::message::{AuthPayload, IdPayload};
use crate::ike::{IkeError, Result};

/// Fixed pad string from RFC 7296 Section 2.15
const KEY_PAD: &[u8] = b"Key Pad for IKEv2";

/// Build the signed-octets blob for one side.
///
/// # Arguments
///
/// * `prf` - Negotiated PRF
/// * `message_bytes` - The side's own IKE_SA_INIT message, as sent
/// * `peer_nonce` - The other side's nonce data
/// * `sk_p` - That side's SK_p key
/// * `id` - That side's identification payload
pub fn signed_octets(
    prf: PrfAlgorithm,
    message_bytes: &[u8],
    peer_nonce: &[u8],
    sk_p: &[u8],
    id: &IdPayload,
) -> Result<Vec<u8>> {
    let maced_id = prf.compute(sk_p, &id.to_payload_data())?;

    let mut octets =
        Vec::with_capacity(message_bytes.len() + peer_nonce.len() + maced_id.len());
    octets.extend_from_slice(message_bytes);
    octets.extend_from_slice(peer_nonce);
    octets.extend_from_slice(&maced_id);
    Ok(octets)
}

/// Compute the AUTH payload from an EAP-generated MSK.
pub fn compute_auth_from_msk(
    prf: PrfAlgorithm,
    msk: &[u8],
    signed_octets: &[u8],
) -> Result<AuthPayload> {
    let auth_key = prf.compute(msk, KEY_PAD)?;
    let auth_data = prf.compute(&auth_key, signed_octets)?;
    Ok(AuthPayload::new(AuthPayload::METHOD_SHARED_KEY_MIC, auth_data))
}

/// Verify a received AUTH payload against an EAP-generated MSK.
pub fn verify_auth_from_msk(
    prf: PrfAlgorithm,
    msk: &[u8],
    signed_octets: &[u8],
    received: &AuthPayload,
) -> Result<()> {
    if received.auth_method != AuthPayload::METHOD_SHARED_KEY_MIC {
        return Err(IkeError::AuthenticationFailed(format!(
            "unexpected AUTH method {}",
            received.auth_method
        )));
    }

    let expected = compute_auth_from_msk(prf, msk, signed_octets)?;
    if expected.auth_data != received.auth_data {
        return Err(IkeError::AuthenticationFailed(
            "AUTH payload mismatch".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ike::message::IdType;

    fn id() -> IdPayload {
        IdPayload::new(IdType::KeyId, b"client".to_vec())
    }

    #[test]
    fn test_signed_octets_layout() {
        let message = vec![0x01; 64];
        let nonce = vec![0x02; 32];
        let sk_p = vec![0x03; 20];

        let octets =
            signed_octets(PrfAlgorithm::HmacSha1, &message, &nonce, &sk_p, &id()).unwrap();

        // message | nonce | prf output
        assert_eq!(octets.len(), 64 + 32 + 20);
        assert_eq!(&octets[..64], &message[..]);
        assert_eq!(&octets[64..96], &nonce[..]);
    }

    #[test]
    fn test_auth_roundtrip() {
        let msk = vec![0x42; 64];
        let octets = vec![0x17; 100];

        let auth = compute_auth_from_msk(PrfAlgorithm::HmacSha1, &msk, &octets).unwrap();
        assert_eq!(auth.auth_method, AuthPayload::METHOD_SHARED_KEY_MIC);
        assert_eq!(auth.auth_data.len(), 20);

        assert!(verify_auth_from_msk(PrfAlgorithm::HmacSha1, &msk, &octets, &auth).is_ok());
    }

    #[test]
    fn test_auth_rejects_wrong_msk() {
        let octets = vec![0x17; 100];
        let auth =
            compute_auth_from_msk(PrfAlgorithm::HmacSha1, &[0x42; 64], &octets).unwrap();

        let result =
            verify_auth_from_msk(PrfAlgorithm::HmacSha1, &[0x43; 64], &octets, &auth);
        assert!(matches!(result, Err(IkeError::AuthenticationFailed(_))));
    }

    #[test]
    fn test_auth_rejects_wrong_method() {
        let octets = vec![0x17; 100];
        let msk = vec![0x42; 64];
        let mut auth = compute_auth_from_msk(PrfAlgorithm::HmacSha1, &msk, &octets).unwrap();
        auth.auth_method = 1; // RSA signature

        let result = verify_auth_from_msk(PrfAlgorithm::HmacSha1, &msk, &octets, &auth);
        assert!(matches!(result, Err(IkeError::AuthenticationFailed(_))));
    }

    #[test]
    fn test_auth_depends_on_octets() {
        let msk = vec![0x42; 64];
        let a = compute_auth_from_msk(PrfAlgorithm::HmacSha1, &msk, &[1, 2, 3]).unwrap();
        let b = compute_auth_from_msk(PrfAlgorithm::HmacSha1, &msk, &[1, 2, 4]).unwrap();
        assert_ne!(a.auth_data, b.auth_data);
    }
}
