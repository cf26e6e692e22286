//! Encrypted payload envelope (SK payload body)
//!
//! The body of an SK payload is `IV | ciphertext(inner chain | padding |
//! pad length) | ICV`. Integrity covers the message from the first header
//! byte through the end of the ciphertext.
//!
//! Decode order is fixed: verify the ICV over the authenticated span,
//! then decrypt, then strip `pad length + 1` trailing bytes. Encode order
//! mirrors it: pad so `(len + pad + 1) % block == 0` with random padding
//! bytes, encrypt under a fresh IV, then checksum the encoded message
//! minus the ICV tail.
//!
//! Combined-mode (AES-GCM) ciphers carry the ICV inside the AEAD tag; the
//! header and SK generic header become associated data instead.

use super::header::IkeHeader;
use crate::ike::constants::{IKE_HEADER_SIZE, PayloadType};
use crate::ike::crypto::{IkeCipher, IntegrityAlgorithm};
use crate::ike::message::payload::PayloadHeader;
use crate::ike::{IkeError, Result};
use rand::RngCore;

/// Length of the pad-length field
const PAD_LEN_LEN: usize = 1;

/// Offset of the SK payload body in a message (header + generic header)
const SK_BODY_OFFSET: usize = IKE_HEADER_SIZE + PayloadHeader::SIZE;

/// Verify and decrypt the SK payload of a received message.
///
/// # Arguments
///
/// * `message` - The complete received message (header included)
/// * `cipher` - Negotiated cipher
/// * `integrity` - Negotiated integrity algorithm (NONE for AEAD)
/// * `integrity_key` - Inbound integrity key (empty for AEAD)
/// * `decryption_keymat` - Inbound cipher key material
///
/// # Returns
///
/// The decrypted inner payload chain bytes with padding removed.
///
/// # Errors
///
/// `IntegrityCheckFailed` when the checksum (or AEAD tag) does not verify;
/// `InvalidSyntax` when lengths or padding are inconsistent.
pub fn decode_and_decrypt(
    message: &[u8],
    cipher: IkeCipher,
    integrity: IntegrityAlgorithm,
    integrity_key: &[u8],
    decryption_keymat: &[u8],
) -> Result<Vec<u8>> {
    let checksum_len = if cipher.is_aead() {
        cipher.checksum_len()
    } else {
        integrity.checksum_len()
    };
    let iv_len = cipher.iv_len();

    if message.len() < SK_BODY_OFFSET + iv_len + checksum_len {
        return Err(IkeError::BufferTooShort {
            required: SK_BODY_OFFSET + iv_len + checksum_len,
            available: message.len(),
        });
    }

    let iv = &message[SK_BODY_OFFSET..SK_BODY_OFFSET + iv_len];

    let plaintext = if cipher.is_aead() {
        // Tag rides at the end of the ciphertext; header and SK generic
        // header are associated data
        let ciphertext_and_tag = &message[SK_BODY_OFFSET + iv_len..];
        let aad = &message[..SK_BODY_OFFSET];
        cipher.decrypt(decryption_keymat, iv, ciphertext_and_tag, aad)?
    } else {
        let ciphertext_end = message.len() - checksum_len;
        let ciphertext = &message[SK_BODY_OFFSET + iv_len..ciphertext_end];
        let received_checksum = &message[ciphertext_end..];

        // ICV first, over everything before it
        integrity.verify_checksum(
            integrity_key,
            &message[..ciphertext_end],
            received_checksum,
        )?;

        cipher.decrypt(decryption_keymat, iv, ciphertext, &[])?
    };

    strip_padding(plaintext)
}

/// Encrypt an inner payload chain and encode the complete message.
///
/// The header's length field is recomputed; its other fields are encoded
/// as given.
///
/// # Arguments
///
/// * `header` - Message header (length ignored)
/// * `first_payload` - Type of the first payload inside the envelope
/// * `inner` - Serialized inner payload chain
/// * `cipher` / `integrity` - Negotiated algorithms
/// * `integrity_key` - Outbound integrity key (empty for AEAD)
/// * `encryption_keymat` - Outbound cipher key material
/// * `rng` - CSPRNG for the IV and padding bytes
pub fn encrypt_and_encode(
    header: &IkeHeader,
    first_payload: u8,
    inner: &[u8],
    cipher: IkeCipher,
    integrity: IntegrityAlgorithm,
    integrity_key: &[u8],
    encryption_keymat: &[u8],
    rng: &mut dyn RngCore,
) -> Result<Vec<u8>> {
    let iv = cipher.generate_iv(rng);
    let padded = pad_plaintext(inner, cipher.block_size(), rng);

    let checksum_len = if cipher.is_aead() {
        cipher.checksum_len()
    } else {
        integrity.checksum_len()
    };

    if cipher.is_aead() {
        // Assemble header + SK generic header first: they are the AAD
        let ciphertext_len = padded.len() + checksum_len;
        let sk_len = PayloadHeader::SIZE + iv.len() + ciphertext_len;
        let total_len = IKE_HEADER_SIZE + sk_len;

        let mut out = Vec::with_capacity(total_len);
        let mut wire_header = header.clone();
        wire_header.next_payload = PayloadType::SK;
        wire_header.length = total_len as u32;
        out.extend_from_slice(&wire_header.to_bytes());
        out.extend_from_slice(
            &PayloadHeader {
                next_payload: first_payload,
                critical: false,
                length: sk_len as u16,
            }
            .to_bytes(),
        );

        let ciphertext = cipher.encrypt(encryption_keymat, &iv, &padded, &out)?;
        debug_assert_eq!(ciphertext.len(), ciphertext_len);

        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    } else {
        let ciphertext = cipher.encrypt(encryption_keymat, &iv, &padded, &[])?;

        let sk_len = PayloadHeader::SIZE + iv.len() + ciphertext.len() + checksum_len;
        let total_len = IKE_HEADER_SIZE + sk_len;

        let mut out = Vec::with_capacity(total_len);
        let mut wire_header = header.clone();
        wire_header.next_payload = PayloadType::SK;
        wire_header.length = total_len as u32;
        out.extend_from_slice(&wire_header.to_bytes());
        out.extend_from_slice(
            &PayloadHeader {
                next_payload: first_payload,
                critical: false,
                length: sk_len as u16,
            }
            .to_bytes(),
        );
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);

        let checksum = integrity.compute_checksum(integrity_key, &out)?;
        out.extend_from_slice(&checksum);
        Ok(out)
    }
}

/// First inner payload type of an encrypted message (SK generic header).
pub fn first_inner_payload(message: &[u8]) -> Result<u8> {
    if message.len() < SK_BODY_OFFSET {
        return Err(IkeError::BufferTooShort {
            required: SK_BODY_OFFSET,
            available: message.len(),
        });
    }
    Ok(message[IKE_HEADER_SIZE])
}

/// Pad so that `(inner + padding + pad_len_byte)` is block-aligned.
/// Padding bytes may hold any value; a CSPRNG supplies them.
fn pad_plaintext(inner: &[u8], block_size: usize, rng: &mut dyn RngCore) -> Vec<u8> {
    let unpadded = inner.len() + PAD_LEN_LEN;
    let pad_len = (block_size - unpadded % block_size) % block_size;

    let mut padded = Vec::with_capacity(unpadded + pad_len);
    padded.extend_from_slice(inner);

    let mut padding = vec![0u8; pad_len];
    rng.fill_bytes(&mut padding);
    padded.extend_from_slice(&padding);
    padded.push(pad_len as u8);
    padded
}

fn strip_padding(mut plaintext: Vec<u8>) -> Result<Vec<u8>> {
    let pad_len = *plaintext
        .last()
        .ok_or_else(|| IkeError::InvalidSyntax("empty decrypted payload body".into()))?
        as usize;

    if pad_len + PAD_LEN_LEN > plaintext.len() {
        return Err(IkeError::InvalidSyntax(format!(
            "pad length {} exceeds decrypted data",
            pad_len
        )));
    }

    plaintext.truncate(plaintext.len() - pad_len - PAD_LEN_LEN);
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ike::constants::{ExchangeType, IkeFlags};
    use rand::rngs::OsRng;

    fn test_header() -> IkeHeader {
        IkeHeader::new(
            [0x11; 8],
            [0x22; 8],
            PayloadType::SK,
            ExchangeType::Informational,
            IkeFlags::request(true),
            3,
            0,
        )
    }

    fn cbc_suite() -> (IkeCipher, IntegrityAlgorithm, Vec<u8>, Vec<u8>) {
        let cipher = IkeCipher::new(IkeCipher::ENCR_AES_CBC, 128).unwrap();
        let integrity = IntegrityAlgorithm::HmacSha1_96;
        (cipher, integrity, vec![0x42; 16], vec![0x24; 20])
    }

    #[test]
    fn test_cbc_roundtrip() {
        let (cipher, integrity, encr_key, integ_key) = cbc_suite();
        let inner = b"inner payload chain bytes".to_vec();

        let message = encrypt_and_encode(
            &test_header(),
            PayloadType::D.to_u8(),
            &inner,
            cipher,
            integrity,
            &integ_key,
            &encr_key,
            &mut OsRng,
        )
        .unwrap();

        // Wire length field matches the real length
        let header = IkeHeader::from_bytes(&message).unwrap();
        assert_eq!(header.length as usize, message.len());
        assert_eq!(first_inner_payload(&message).unwrap(), PayloadType::D.to_u8());

        let decrypted =
            decode_and_decrypt(&message, cipher, integrity, &integ_key, &encr_key).unwrap();
        assert_eq!(decrypted, inner);
    }

    #[test]
    fn test_gcm_roundtrip() {
        let cipher = IkeCipher::new(IkeCipher::ENCR_AES_GCM_16, 128).unwrap();
        let keymat = vec![0x42; cipher.keymat_len()];
        let inner = b"aead protected chain".to_vec();

        let message = encrypt_and_encode(
            &test_header(),
            PayloadType::N.to_u8(),
            &inner,
            cipher,
            IntegrityAlgorithm::None,
            &[],
            &keymat,
            &mut OsRng,
        )
        .unwrap();

        let decrypted = decode_and_decrypt(
            &message,
            cipher,
            IntegrityAlgorithm::None,
            &[],
            &keymat,
        )
        .unwrap();
        assert_eq!(decrypted, inner);
    }

    #[test]
    fn test_empty_inner_chain() {
        let (cipher, integrity, encr_key, integ_key) = cbc_suite();

        let message = encrypt_and_encode(
            &test_header(),
            PayloadType::None.to_u8(),
            &[],
            cipher,
            integrity,
            &integ_key,
            &encr_key,
            &mut OsRng,
        )
        .unwrap();

        let decrypted =
            decode_and_decrypt(&message, cipher, integrity, &integ_key, &encr_key).unwrap();
        assert!(decrypted.is_empty());
    }

    #[test]
    fn test_bit_flip_in_header_rejected() {
        let (cipher, integrity, encr_key, integ_key) = cbc_suite();
        let mut message = encrypt_and_encode(
            &test_header(),
            PayloadType::D.to_u8(),
            b"data",
            cipher,
            integrity,
            &integ_key,
            &encr_key,
            &mut OsRng,
        )
        .unwrap();

        message[5] ^= 0x01; // flip a bit inside the initiator SPI

        let result = decode_and_decrypt(&message, cipher, integrity, &integ_key, &encr_key);
        assert!(matches!(result, Err(IkeError::IntegrityCheckFailed)));
    }

    #[test]
    fn test_bit_flip_in_iv_rejected() {
        let (cipher, integrity, encr_key, integ_key) = cbc_suite();
        let mut message = encrypt_and_encode(
            &test_header(),
            PayloadType::D.to_u8(),
            b"data",
            cipher,
            integrity,
            &integ_key,
            &encr_key,
            &mut OsRng,
        )
        .unwrap();

        message[SK_BODY_OFFSET] ^= 0x01;

        let result = decode_and_decrypt(&message, cipher, integrity, &integ_key, &encr_key);
        assert!(matches!(result, Err(IkeError::IntegrityCheckFailed)));
    }

    #[test]
    fn test_bit_flip_in_ciphertext_rejected() {
        let (cipher, integrity, encr_key, integ_key) = cbc_suite();
        let mut message = encrypt_and_encode(
            &test_header(),
            PayloadType::D.to_u8(),
            b"data",
            cipher,
            integrity,
            &integ_key,
            &encr_key,
            &mut OsRng,
        )
        .unwrap();

        let ct_index = message.len() - integrity.checksum_len() - 1;
        message[ct_index] ^= 0x01;

        let result = decode_and_decrypt(&message, cipher, integrity, &integ_key, &encr_key);
        assert!(matches!(result, Err(IkeError::IntegrityCheckFailed)));
    }

    #[test]
    fn test_wrong_integrity_key_rejected() {
        let (cipher, integrity, encr_key, integ_key) = cbc_suite();
        let message = encrypt_and_encode(
            &test_header(),
            PayloadType::D.to_u8(),
            b"data",
            cipher,
            integrity,
            &integ_key,
            &encr_key,
            &mut OsRng,
        )
        .unwrap();

        let wrong_key = vec![0xFF; 20];
        let result = decode_and_decrypt(&message, cipher, integrity, &wrong_key, &encr_key);
        assert!(matches!(result, Err(IkeError::IntegrityCheckFailed)));
    }

    #[test]
    fn test_pad_alignment_invariant() {
        // For all (len, block): (len + pad + 1) % block == 0 and pad < block
        for block in [4usize, 8, 16] {
            for len in 0..64 {
                let inner = vec![0xAA; len];
                let padded = pad_plaintext(&inner, block, &mut OsRng);
                assert_eq!(padded.len() % block, 0, "len={} block={}", len, block);
                let pad = *padded.last().unwrap() as usize;
                assert!(pad < block, "pad {} >= block {}", pad, block);
                assert_eq!(padded.len(), len + pad + 1);
            }
        }
    }

    #[test]
    fn test_strip_padding_rejects_bad_pad_len() {
        // pad length byte larger than the data itself
        let result = strip_padding(vec![0x00, 0x00, 0xFF]);
        assert!(matches!(result, Err(IkeError::InvalidSyntax(_))));
    }
}
