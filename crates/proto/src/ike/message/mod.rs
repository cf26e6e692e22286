//! IKE message structures and parsing
//!
//! An `IkeMessage` is a header plus a payload chain. IKE_SA_INIT messages
//! travel in the clear; every later exchange wraps its payloads in an SK
//! envelope handled by the `encrypted` submodule.

pub mod encrypted;
pub mod header;
pub mod payload;

pub use header::IkeHeader;
pub use payload::{
    AuthPayload, DeletePayload, IdPayload, IdType, IkePayload, KePayload, NoncePayload,
    NotifyPayload, PayloadHeader, SaPayload, SkPayload,
};

use super::constants::{IKE_HEADER_SIZE, PayloadType};
use super::crypto::{IkeCipher, IntegrityAlgorithm};
use super::ts::TrafficSelectorsPayload;
use super::{IkeError, Result};
use rand::RngCore;

/// A decoded IKE message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IkeMessage {
    /// Message header
    pub header: IkeHeader,

    /// Decoded payload chain
    pub payloads: Vec<IkePayload>,
}

impl IkeMessage {
    /// Create a message from a header and payload list
    pub fn new(header: IkeHeader, payloads: Vec<IkePayload>) -> Self {
        IkeMessage { header, payloads }
    }

    /// Decode an unencrypted message (IKE_SA_INIT).
    ///
    /// # Errors
    ///
    /// `InvalidSyntax` when the declared length disagrees with the
    /// datagram, the chain overruns, or a payload is malformed.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = IkeHeader::from_bytes(data)?;

        if header.length as usize != data.len() {
            return Err(IkeError::InvalidSyntax(format!(
                "declared length {} != datagram length {}",
                header.length,
                data.len()
            )));
        }

        let payloads = payload::decode_payload_chain(
            header.next_payload.to_u8(),
            &data[IKE_HEADER_SIZE..],
        )?;

        Ok(IkeMessage { header, payloads })
    }

    /// Encode an unencrypted message, fixing up first-payload and length.
    pub fn encode(&self) -> Vec<u8> {
        let mut chain = Vec::new();
        let first = payload::encode_payload_chain(&self.payloads, &mut chain);

        let mut header = self.header.clone();
        header.next_payload =
            PayloadType::from_u8(first).unwrap_or(PayloadType::None);
        header.length = (IKE_HEADER_SIZE + chain.len()) as u32;

        let mut out = Vec::with_capacity(header.length as usize);
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&chain);
        out
    }

    /// Decode an encrypted message: verify, decrypt, then decode the
    /// inner chain.
    pub fn decode_encrypted(
        data: &[u8],
        cipher: IkeCipher,
        integrity: IntegrityAlgorithm,
        integrity_key: &[u8],
        decryption_keymat: &[u8],
    ) -> Result<Self> {
        let header = IkeHeader::from_bytes(data)?;

        if header.length as usize != data.len() {
            return Err(IkeError::InvalidSyntax(format!(
                "declared length {} != datagram length {}",
                header.length,
                data.len()
            )));
        }
        if header.next_payload != PayloadType::SK {
            return Err(IkeError::InvalidSyntax(format!(
                "expected SK payload, got type {}",
                header.next_payload.to_u8()
            )));
        }

        let first_inner = encrypted::first_inner_payload(data)?;
        let inner = encrypted::decode_and_decrypt(
            data,
            cipher,
            integrity,
            integrity_key,
            decryption_keymat,
        )?;

        let payloads = payload::decode_payload_chain(first_inner, &inner)?;

        Ok(IkeMessage { header, payloads })
    }

    /// Encrypt this message's payloads into an SK envelope and encode the
    /// complete wire message.
    pub fn encode_encrypted(
        &self,
        cipher: IkeCipher,
        integrity: IntegrityAlgorithm,
        integrity_key: &[u8],
        encryption_keymat: &[u8],
        rng: &mut dyn RngCore,
    ) -> Result<Vec<u8>> {
        let mut inner = Vec::new();
        let first = payload::encode_payload_chain(&self.payloads, &mut inner);

        encrypted::encrypt_and_encode(
            &self.header,
            first,
            &inner,
            cipher,
            integrity,
            integrity_key,
            encryption_keymat,
            rng,
        )
    }

    /// First SA payload, if present
    pub fn sa_payload(&self) -> Option<&SaPayload> {
        self.payloads.iter().find_map(|p| match p {
            IkePayload::SA(sa) => Some(sa),
            _ => None,
        })
    }

    /// First KE payload, if present
    pub fn ke_payload(&self) -> Option<&KePayload> {
        self.payloads.iter().find_map(|p| match p {
            IkePayload::KE(ke) => Some(ke),
            _ => None,
        })
    }

    /// First Nonce payload, if present
    pub fn nonce_payload(&self) -> Option<&NoncePayload> {
        self.payloads.iter().find_map(|p| match p {
            IkePayload::Nonce(nonce) => Some(nonce),
            _ => None,
        })
    }

    /// All Notify payloads
    pub fn notify_payloads(&self) -> impl Iterator<Item = &NotifyPayload> {
        self.payloads.iter().filter_map(|p| match p {
            IkePayload::N(n) => Some(n),
            _ => None,
        })
    }

    /// First Notify payload with the given type
    pub fn notify(&self, notify_type: super::constants::NotifyType) -> Option<&NotifyPayload> {
        self.notify_payloads()
            .find(|n| n.notify_type == notify_type.to_u16())
    }

    /// First error notification carried by this message, if any
    pub fn first_error_notify(&self) -> Option<&NotifyPayload> {
        self.notify_payloads().find(|n| n.is_error())
    }

    /// All Delete payloads
    pub fn delete_payloads(&self) -> impl Iterator<Item = &DeletePayload> {
        self.payloads.iter().filter_map(|p| match p {
            IkePayload::D(d) => Some(d),
            _ => None,
        })
    }

    /// First EAP payload, if present
    pub fn eap_payload(&self) -> Option<&[u8]> {
        self.payloads.iter().find_map(|p| match p {
            IkePayload::EAP(data) => Some(data.as_slice()),
            _ => None,
        })
    }

    /// First AUTH payload, if present
    pub fn auth_payload(&self) -> Option<&AuthPayload> {
        self.payloads.iter().find_map(|p| match p {
            IkePayload::AUTH(auth) => Some(auth),
            _ => None,
        })
    }

    /// TSi payload, if present
    pub fn tsi_payload(&self) -> Option<&TrafficSelectorsPayload> {
        self.payloads.iter().find_map(|p| match p {
            IkePayload::TSi(ts) => Some(ts),
            _ => None,
        })
    }

    /// TSr payload, if present
    pub fn tsr_payload(&self) -> Option<&TrafficSelectorsPayload> {
        self.payloads.iter().find_map(|p| match p {
            IkePayload::TSr(ts) => Some(ts),
            _ => None,
        })
    }
}
