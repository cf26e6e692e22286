//! IKEv2 payload structures and the payload-chain codec
//!
//! Implements the typed payloads of RFC 7296 Section 3 and the linked
//! decoding of payload chains. The decoder is strict: a chain that runs
//! past the declared message length, a payload shorter than its generic
//! header, or an unknown payload carrying the critical bit all reject the
//! message.

use crate::ike::constants::{NotifyType, PayloadType, ProtocolId, GENERIC_PAYLOAD_HEADER_SIZE};
use crate::ike::proposal::{decode_proposals, encode_proposals, Proposal};
use crate::ike::ts::TrafficSelectorsPayload;
use crate::ike::{IkeError, Result};

/// Generic IKE payload header (4 bytes)
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | Next Payload  |C|  RESERVED   |         Payload Length        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    /// Type of the payload that follows this one
    pub next_payload: u8,

    /// Critical bit
    pub critical: bool,

    /// Total payload length including this header
    pub length: u16,
}

impl PayloadHeader {
    /// Header size
    pub const SIZE: usize = GENERIC_PAYLOAD_HEADER_SIZE;

    /// Parse a generic payload header
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(IkeError::BufferTooShort {
                required: Self::SIZE,
                available: data.len(),
            });
        }

        let length = u16::from_be_bytes([data[2], data[3]]);
        if (length as usize) < Self::SIZE {
            return Err(IkeError::InvalidSyntax(format!(
                "payload length {} below generic header size",
                length
            )));
        }

        Ok(PayloadHeader {
            next_payload: data[0],
            critical: (data[1] & 0x80) != 0,
            length,
        })
    }

    /// Serialize the generic header
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = self.next_payload;
        bytes[1] = if self.critical { 0x80 } else { 0x00 };
        bytes[2..4].copy_from_slice(&self.length.to_be_bytes());
        bytes
    }
}

/// Security Association payload (Section 3.3)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaPayload {
    /// Offered or chosen proposals
    pub proposals: Vec<Proposal>,
}

impl SaPayload {
    /// Create from a proposal list
    pub fn new(proposals: Vec<Proposal>) -> Self {
        SaPayload { proposals }
    }

    /// Parse from payload body bytes
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        Ok(SaPayload {
            proposals: decode_proposals(data)?,
        })
    }

    /// Serialize to payload body bytes
    pub fn to_payload_data(&self) -> Vec<u8> {
        encode_proposals(&self.proposals)
    }
}

/// Key Exchange payload (Section 3.4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KePayload {
    /// Diffie-Hellman group number
    pub dh_group: u16,

    /// Public value
    pub key_data: Vec<u8>,
}

impl KePayload {
    /// Create a KE payload
    pub fn new(dh_group: u16, key_data: Vec<u8>) -> Self {
        KePayload { dh_group, key_data }
    }

    /// Parse from payload body bytes
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(IkeError::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }
        Ok(KePayload {
            dh_group: u16::from_be_bytes([data[0], data[1]]),
            key_data: data[4..].to_vec(),
        })
    }

    /// Serialize to payload body bytes
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(4 + self.key_data.len());
        data.extend_from_slice(&self.dh_group.to_be_bytes());
        data.extend_from_slice(&[0u8, 0u8]); // Reserved
        data.extend_from_slice(&self.key_data);
        data
    }
}

/// Nonce payload (Section 3.9)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoncePayload {
    /// Nonce data
    pub nonce: Vec<u8>,
}

impl NoncePayload {
    /// Minimum nonce size
    pub const MIN_SIZE: usize = 16;

    /// Maximum nonce size
    pub const MAX_SIZE: usize = 256;

    /// Create a nonce payload, validating size bounds
    pub fn new(nonce: Vec<u8>) -> Result<Self> {
        if nonce.len() < Self::MIN_SIZE || nonce.len() > Self::MAX_SIZE {
            return Err(IkeError::InvalidSyntax(format!(
                "nonce length {} outside {}..={}",
                nonce.len(),
                Self::MIN_SIZE,
                Self::MAX_SIZE
            )));
        }
        Ok(NoncePayload { nonce })
    }

    /// Parse from payload body bytes
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        Self::new(data.to_vec())
    }

    /// Serialize to payload body bytes
    pub fn to_payload_data(&self) -> Vec<u8> {
        self.nonce.clone()
    }
}

/// Identification type constants (Section 3.5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IdType {
    /// IPv4 address (1)
    Ipv4Addr = 1,
    /// Fully-qualified domain name (2)
    Fqdn = 2,
    /// RFC 822 email address (3)
    Rfc822Addr = 3,
    /// Opaque key id (11)
    KeyId = 11,
}

impl IdType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(IdType::Ipv4Addr),
            2 => Some(IdType::Fqdn),
            3 => Some(IdType::Rfc822Addr),
            11 => Some(IdType::KeyId),
            _ => None,
        }
    }
}

/// Identification payload, IDi or IDr (Section 3.5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdPayload {
    /// Identification type
    pub id_type: IdType,

    /// Identification data
    pub data: Vec<u8>,
}

impl IdPayload {
    /// Create an identification payload
    pub fn new(id_type: IdType, data: Vec<u8>) -> Self {
        IdPayload { id_type, data }
    }

    /// Parse from payload body bytes
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(IkeError::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }
        let id_type = IdType::from_u8(data[0])
            .ok_or_else(|| IkeError::InvalidSyntax(format!("unknown ID type: {}", data[0])))?;
        Ok(IdPayload {
            id_type,
            data: data[4..].to_vec(),
        })
    }

    /// Serialize to payload body bytes
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.data.len());
        out.push(self.id_type as u8);
        out.extend_from_slice(&[0u8; 3]); // Reserved
        out.extend_from_slice(&self.data);
        out
    }
}

/// Authentication payload (Section 3.8)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPayload {
    /// Authentication method
    pub auth_method: u8,

    /// Authentication data
    pub auth_data: Vec<u8>,
}

impl AuthPayload {
    /// Shared-key message integrity code method (also used after EAP)
    pub const METHOD_SHARED_KEY_MIC: u8 = 2;

    /// Create an AUTH payload
    pub fn new(auth_method: u8, auth_data: Vec<u8>) -> Self {
        AuthPayload {
            auth_method,
            auth_data,
        }
    }

    /// Parse from payload body bytes
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(IkeError::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }
        Ok(AuthPayload {
            auth_method: data[0],
            auth_data: data[4..].to_vec(),
        })
    }

    /// Serialize to payload body bytes
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.auth_data.len());
        out.push(self.auth_method);
        out.extend_from_slice(&[0u8; 3]); // Reserved
        out.extend_from_slice(&self.auth_data);
        out
    }
}

/// Notify payload (Section 3.10)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyPayload {
    /// Protocol the notification concerns
    pub protocol: ProtocolId,

    /// SPI of the concerned SA (empty when not SA-specific)
    pub spi: Vec<u8>,

    /// Notify message type (raw; unknown status types are tolerated)
    pub notify_type: u16,

    /// Notification data
    pub data: Vec<u8>,
}

impl NotifyPayload {
    /// Notification without SPI or data
    pub fn new(notify_type: NotifyType) -> Self {
        NotifyPayload {
            protocol: ProtocolId::None,
            spi: Vec::new(),
            notify_type: notify_type.to_u16(),
            data: Vec::new(),
        }
    }

    /// Notification with data
    pub fn with_data(notify_type: NotifyType, data: Vec<u8>) -> Self {
        NotifyPayload {
            protocol: ProtocolId::None,
            spi: Vec::new(),
            notify_type: notify_type.to_u16(),
            data,
        }
    }

    /// REKEY_SA notification naming the Child SA being rekeyed
    pub fn rekey_sa(child_spi: u32) -> Self {
        NotifyPayload {
            protocol: ProtocolId::Esp,
            spi: child_spi.to_be_bytes().to_vec(),
            notify_type: NotifyType::RekeySa.to_u16(),
            data: Vec::new(),
        }
    }

    /// Typed view of the notify type, if it is one we know
    pub fn typed(&self) -> Option<NotifyType> {
        NotifyType::from_u16(self.notify_type)
    }

    /// Whether this is an error notification
    pub fn is_error(&self) -> bool {
        self.notify_type < 16384
    }

    /// The Child SPI carried in this notify, when 4 bytes wide
    pub fn child_spi(&self) -> Option<u32> {
        if self.spi.len() == 4 {
            Some(u32::from_be_bytes([
                self.spi[0],
                self.spi[1],
                self.spi[2],
                self.spi[3],
            ]))
        } else {
            None
        }
    }

    /// Parse from payload body bytes
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(IkeError::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }
        let protocol = ProtocolId::from_u8(data[0]).ok_or_else(|| {
            IkeError::InvalidSyntax(format!("unknown notify protocol id: {}", data[0]))
        })?;
        let spi_size = data[1] as usize;
        let notify_type = u16::from_be_bytes([data[2], data[3]]);

        if 4 + spi_size > data.len() {
            return Err(IkeError::InvalidSyntax("notify SPI overruns payload".into()));
        }

        Ok(NotifyPayload {
            protocol,
            spi: data[4..4 + spi_size].to_vec(),
            notify_type,
            data: data[4 + spi_size..].to_vec(),
        })
    }

    /// Serialize to payload body bytes
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.spi.len() + self.data.len());
        out.push(self.protocol.to_u8());
        out.push(self.spi.len() as u8);
        out.extend_from_slice(&self.notify_type.to_be_bytes());
        out.extend_from_slice(&self.spi);
        out.extend_from_slice(&self.data);
        out
    }
}

/// Delete payload (Section 3.11)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePayload {
    /// Protocol of the SAs being deleted
    pub protocol: ProtocolId,

    /// SPI size (0 for IKE, 4 for ESP)
    pub spi_size: u8,

    /// SPIs being deleted
    pub spis: Vec<Vec<u8>>,
}

impl DeletePayload {
    /// Delete the IKE SA itself (no SPIs carried)
    pub fn ike_sa() -> Self {
        DeletePayload {
            protocol: ProtocolId::Ike,
            spi_size: 0,
            spis: Vec::new(),
        }
    }

    /// Delete one or more Child SAs by 4-byte SPI
    pub fn child_sas(spis: &[u32]) -> Self {
        DeletePayload {
            protocol: ProtocolId::Esp,
            spi_size: 4,
            spis: spis.iter().map(|s| s.to_be_bytes().to_vec()).collect(),
        }
    }

    /// The Child SPIs listed in this payload
    pub fn child_spis(&self) -> Vec<u32> {
        self.spis
            .iter()
            .filter(|s| s.len() == 4)
            .map(|s| u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
            .collect()
    }

    /// Parse from payload body bytes
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(IkeError::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }
        let protocol = ProtocolId::from_u8(data[0]).ok_or_else(|| {
            IkeError::InvalidSyntax(format!("unknown delete protocol id: {}", data[0]))
        })?;
        let spi_size = data[1];
        let count = u16::from_be_bytes([data[2], data[3]]) as usize;

        let expected = 4 + count * spi_size as usize;
        if expected != data.len() {
            return Err(IkeError::InvalidSyntax(format!(
                "delete payload length mismatch: declared {} SPIs of {} bytes in {} bytes",
                count,
                spi_size,
                data.len() - 4
            )));
        }

        let mut spis = Vec::with_capacity(count);
        let mut offset = 4;
        for _ in 0..count {
            spis.push(data[offset..offset + spi_size as usize].to_vec());
            offset += spi_size as usize;
        }

        Ok(DeletePayload {
            protocol,
            spi_size,
            spis,
        })
    }

    /// Serialize to payload body bytes
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.spis.len() * self.spi_size as usize);
        out.push(self.protocol.to_u8());
        out.push(self.spi_size);
        out.extend_from_slice(&(self.spis.len() as u16).to_be_bytes());
        for spi in &self.spis {
            out.extend_from_slice(spi);
        }
        out
    }
}

/// Encrypted (SK) payload body, opaque until keys are applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkPayload {
    /// Raw body: IV | ciphertext | ICV
    pub body: Vec<u8>,

    /// First payload type inside the envelope
    pub first_payload: u8,
}

/// A decoded IKE payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IkePayload {
    /// Security Association
    SA(SaPayload),
    /// Key Exchange
    KE(KePayload),
    /// Nonce
    Nonce(NoncePayload),
    /// Identification - Initiator
    IDi(IdPayload),
    /// Identification - Responder
    IDr(IdPayload),
    /// Authentication
    AUTH(AuthPayload),
    /// Notify
    N(NotifyPayload),
    /// Delete
    D(DeletePayload),
    /// Vendor ID (opaque)
    V(Vec<u8>),
    /// Traffic Selectors - Initiator
    TSi(TrafficSelectorsPayload),
    /// Traffic Selectors - Responder
    TSr(TrafficSelectorsPayload),
    /// Extensible Authentication (raw EAP packet)
    EAP(Vec<u8>),
    /// Configuration (opaque)
    CP(Vec<u8>),
    /// Encrypted payload (undecrypted)
    SK(SkPayload),
    /// Unknown non-critical payload, skipped by handlers
    Unknown {
        /// Raw payload type
        payload_type: u8,
        /// Raw payload body
        data: Vec<u8>,
    },
}

impl IkePayload {
    /// Payload type of this payload
    pub fn payload_type(&self) -> u8 {
        match self {
            IkePayload::SA(_) => PayloadType::SA.to_u8(),
            IkePayload::KE(_) => PayloadType::KE.to_u8(),
            IkePayload::Nonce(_) => PayloadType::Nonce.to_u8(),
            IkePayload::IDi(_) => PayloadType::IDi.to_u8(),
            IkePayload::IDr(_) => PayloadType::IDr.to_u8(),
            IkePayload::AUTH(_) => PayloadType::AUTH.to_u8(),
            IkePayload::N(_) => PayloadType::N.to_u8(),
            IkePayload::D(_) => PayloadType::D.to_u8(),
            IkePayload::V(_) => PayloadType::V.to_u8(),
            IkePayload::TSi(_) => PayloadType::TSi.to_u8(),
            IkePayload::TSr(_) => PayloadType::TSr.to_u8(),
            IkePayload::EAP(_) => PayloadType::EAP.to_u8(),
            IkePayload::CP(_) => PayloadType::CP.to_u8(),
            IkePayload::SK(_) => PayloadType::SK.to_u8(),
            IkePayload::Unknown { payload_type, .. } => *payload_type,
        }
    }

    /// Serialize the payload body (without the generic header)
    pub fn to_payload_data(&self) -> Vec<u8> {
        match self {
            IkePayload::SA(p) => p.to_payload_data(),
            IkePayload::KE(p) => p.to_payload_data(),
            IkePayload::Nonce(p) => p.to_payload_data(),
            IkePayload::IDi(p) | IkePayload::IDr(p) => p.to_payload_data(),
            IkePayload::AUTH(p) => p.to_payload_data(),
            IkePayload::N(p) => p.to_payload_data(),
            IkePayload::D(p) => p.to_payload_data(),
            IkePayload::V(data) => data.clone(),
            IkePayload::TSi(p) | IkePayload::TSr(p) => p.to_payload_data(),
            IkePayload::EAP(data) => data.clone(),
            IkePayload::CP(data) => data.clone(),
            IkePayload::SK(p) => p.body.clone(),
            IkePayload::Unknown { data, .. } => data.clone(),
        }
    }

    fn from_typed_data(payload_type: u8, critical: bool, data: &[u8]) -> Result<Self> {
        let known = PayloadType::from_u8(payload_type);
        let payload = match known {
            Some(PayloadType::SA) => IkePayload::SA(SaPayload::from_payload_data(data)?),
            Some(PayloadType::KE) => IkePayload::KE(KePayload::from_payload_data(data)?),
            Some(PayloadType::Nonce) => {
                IkePayload::Nonce(NoncePayload::from_payload_data(data)?)
            }
            Some(PayloadType::IDi) => IkePayload::IDi(IdPayload::from_payload_data(data)?),
            Some(PayloadType::IDr) => IkePayload::IDr(IdPayload::from_payload_data(data)?),
            Some(PayloadType::AUTH) => IkePayload::AUTH(AuthPayload::from_payload_data(data)?),
            Some(PayloadType::N) => IkePayload::N(NotifyPayload::from_payload_data(data)?),
            Some(PayloadType::D) => IkePayload::D(DeletePayload::from_payload_data(data)?),
            Some(PayloadType::V) => IkePayload::V(data.to_vec()),
            Some(PayloadType::TSi) => {
                IkePayload::TSi(TrafficSelectorsPayload::from_payload_data(data)?)
            }
            Some(PayloadType::TSr) => {
                IkePayload::TSr(TrafficSelectorsPayload::from_payload_data(data)?)
            }
            Some(PayloadType::EAP) => IkePayload::EAP(data.to_vec()),
            Some(PayloadType::CP) => IkePayload::CP(data.to_vec()),
            Some(PayloadType::SKF) => {
                // Message fragmentation is not supported
                return Err(IkeError::InvalidSyntax(
                    "encrypted fragment payload not supported".into(),
                ));
            }
            Some(PayloadType::CERT) | Some(PayloadType::CERTREQ) => IkePayload::Unknown {
                payload_type,
                data: data.to_vec(),
            },
            Some(PayloadType::SK) | Some(PayloadType::None) => {
                return Err(IkeError::InvalidSyntax(format!(
                    "payload type {} not allowed inside a payload chain",
                    payload_type
                )));
            }
            None => {
                if critical {
                    return Err(IkeError::UnsupportedCriticalPayload(payload_type));
                }
                IkePayload::Unknown {
                    payload_type,
                    data: data.to_vec(),
                }
            }
        };
        Ok(payload)
    }
}

/// Decode a chain of payloads.
///
/// `first_payload` comes from the IKE header (or from the SK payload's
/// first-payload field for inner chains). The chain must exactly fill
/// `data`.
pub fn decode_payload_chain(first_payload: u8, data: &[u8]) -> Result<Vec<IkePayload>> {
    let mut payloads = Vec::new();
    let mut current_type = first_payload;
    let mut offset = 0;

    while current_type != PayloadType::None.to_u8() {
        if offset >= data.len() {
            return Err(IkeError::InvalidSyntax(
                "payload chain extends past message end".into(),
            ));
        }

        let header = PayloadHeader::from_bytes(&data[offset..])?;
        let end = offset + header.length as usize;
        if end > data.len() {
            return Err(IkeError::InvalidSyntax(
                "payload length extends past message end".into(),
            ));
        }

        let body = &data[offset + PayloadHeader::SIZE..end];
        payloads.push(IkePayload::from_typed_data(
            current_type,
            header.critical,
            body,
        )?);

        current_type = header.next_payload;
        offset = end;
    }

    if offset != data.len() {
        return Err(IkeError::InvalidSyntax(
            "trailing bytes after payload chain".into(),
        ));
    }

    Ok(payloads)
}

/// Encode a chain of payloads, linking `next_payload` fields.
///
/// Returns the type of the first payload (NONE for an empty chain).
pub fn encode_payload_chain(payloads: &[IkePayload], buf: &mut Vec<u8>) -> u8 {
    let first = payloads
        .first()
        .map(IkePayload::payload_type)
        .unwrap_or_else(|| PayloadType::None.to_u8());

    for (i, payload) in payloads.iter().enumerate() {
        let next = payloads
            .get(i + 1)
            .map(IkePayload::payload_type)
            .unwrap_or_else(|| PayloadType::None.to_u8());

        let body = payload.to_payload_data();
        let header = PayloadHeader {
            next_payload: next,
            critical: false,
            length: (PayloadHeader::SIZE + body.len()) as u16,
        };
        buf.extend_from_slice(&header.to_bytes());
        buf.extend_from_slice(&body);
    }

    first
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ike::crypto::{DhGroup, IkeCipher, IntegrityAlgorithm, PrfAlgorithm};
    use crate::ike::proposal::Transform;

    fn sample_proposal() -> Proposal {
        Proposal::new(1, ProtocolId::Ike)
            .add_transform(Transform::encr(IkeCipher::ENCR_AES_CBC, Some(128)))
            .add_transform(Transform::prf(PrfAlgorithm::HmacSha1))
            .add_transform(Transform::integ(IntegrityAlgorithm::HmacSha1_96))
            .add_transform(Transform::dh(DhGroup::Modp2048))
    }

    fn sample_chain() -> Vec<IkePayload> {
        vec![
            IkePayload::SA(SaPayload::new(vec![sample_proposal()])),
            IkePayload::Nonce(NoncePayload::new(vec![0xAB; 32]).unwrap()),
            IkePayload::KE(KePayload::new(14, vec![0xCD; 256])),
        ]
    }

    #[test]
    fn test_payload_header_roundtrip() {
        let header = PayloadHeader {
            next_payload: PayloadType::Nonce.to_u8(),
            critical: true,
            length: 100,
        };
        let bytes = header.to_bytes();
        let parsed = PayloadHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header, parsed);
    }

    #[test]
    fn test_payload_header_rejects_short_length() {
        let data = [33, 0, 0, 2]; // length 2 < 4
        let result = PayloadHeader::from_bytes(&data);
        assert!(matches!(result, Err(IkeError::InvalidSyntax(_))));
    }

    #[test]
    fn test_chain_roundtrip() {
        let payloads = sample_chain();
        let mut buf = Vec::new();
        let first = encode_payload_chain(&payloads, &mut buf);
        assert_eq!(first, PayloadType::SA.to_u8());

        let decoded = decode_payload_chain(first, &buf).unwrap();
        assert_eq!(decoded, payloads);
    }

    #[test]
    fn test_empty_chain() {
        let mut buf = Vec::new();
        let first = encode_payload_chain(&[], &mut buf);
        assert_eq!(first, 0);
        assert!(buf.is_empty());

        let decoded = decode_payload_chain(first, &buf).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_chain_rejects_overrun() {
        let payloads = sample_chain();
        let mut buf = Vec::new();
        let first = encode_payload_chain(&payloads, &mut buf);

        // Truncate the buffer mid-payload
        buf.truncate(buf.len() - 10);
        let result = decode_payload_chain(first, &buf);
        assert!(matches!(result, Err(IkeError::InvalidSyntax(_))));
    }

    #[test]
    fn test_chain_rejects_trailing_bytes() {
        let payloads = sample_chain();
        let mut buf = Vec::new();
        let first = encode_payload_chain(&payloads, &mut buf);
        buf.extend_from_slice(&[0u8; 4]);

        let result = decode_payload_chain(first, &buf);
        assert!(matches!(result, Err(IkeError::InvalidSyntax(_))));
    }

    #[test]
    fn test_unknown_critical_payload_rejected() {
        // Single payload of unknown type 200 with critical bit set
        let mut buf = Vec::new();
        buf.push(0); // next = NONE
        buf.push(0x80); // critical
        buf.extend_from_slice(&8u16.to_be_bytes());
        buf.extend_from_slice(&[1, 2, 3, 4]);

        let result = decode_payload_chain(200, &buf);
        assert!(matches!(
            result,
            Err(IkeError::UnsupportedCriticalPayload(200))
        ));
    }

    #[test]
    fn test_unknown_noncritical_payload_skipped() {
        let mut buf = Vec::new();
        buf.push(0); // next = NONE
        buf.push(0);
        buf.extend_from_slice(&8u16.to_be_bytes());
        buf.extend_from_slice(&[1, 2, 3, 4]);

        let decoded = decode_payload_chain(200, &buf).unwrap();
        assert_eq!(decoded.len(), 1);
        assert!(matches!(
            decoded[0],
            IkePayload::Unknown {
                payload_type: 200,
                ..
            }
        ));
    }

    #[test]
    fn test_notify_payload_roundtrip() {
        let notify = NotifyPayload::rekey_sa(0xCAFEBABE);
        let decoded = NotifyPayload::from_payload_data(&notify.to_payload_data()).unwrap();
        assert_eq!(decoded, notify);
        assert_eq!(decoded.typed(), Some(NotifyType::RekeySa));
        assert_eq!(decoded.child_spi(), Some(0xCAFEBABE));
        assert!(!decoded.is_error());
    }

    #[test]
    fn test_notify_unknown_status_type_tolerated() {
        let raw = NotifyPayload {
            protocol: ProtocolId::None,
            spi: Vec::new(),
            notify_type: 40000,
            data: Vec::new(),
        };
        let decoded = NotifyPayload::from_payload_data(&raw.to_payload_data()).unwrap();
        assert_eq!(decoded.typed(), None);
        assert!(!decoded.is_error());
    }

    #[test]
    fn test_delete_payload_ike() {
        let delete = DeletePayload::ike_sa();
        let decoded = DeletePayload::from_payload_data(&delete.to_payload_data()).unwrap();
        assert_eq!(decoded.protocol, ProtocolId::Ike);
        assert!(decoded.spis.is_empty());
    }

    #[test]
    fn test_delete_payload_children() {
        let delete = DeletePayload::child_sas(&[0x11111111, 0x22222222]);
        let decoded = DeletePayload::from_payload_data(&delete.to_payload_data()).unwrap();
        assert_eq!(decoded.child_spis(), vec![0x11111111, 0x22222222]);
    }

    #[test]
    fn test_delete_payload_count_mismatch() {
        let delete = DeletePayload::child_sas(&[1]);
        let mut encoded = delete.to_payload_data();
        encoded[3] = 3; // claim 3 SPIs
        assert!(DeletePayload::from_payload_data(&encoded).is_err());
    }

    #[test]
    fn test_nonce_size_bounds() {
        assert!(NoncePayload::new(vec![0; 15]).is_err());
        assert!(NoncePayload::new(vec![0; 16]).is_ok());
        assert!(NoncePayload::new(vec![0; 256]).is_ok());
        assert!(NoncePayload::new(vec![0; 257]).is_err());
    }

    #[test]
    fn test_id_payload_roundtrip() {
        let id = IdPayload::new(IdType::Rfc822Addr, b"0@wlan.mnc050.mcc501.3gppnetwork.org".to_vec());
        let decoded = IdPayload::from_payload_data(&id.to_payload_data()).unwrap();
        assert_eq!(decoded, id);
    }

    #[test]
    fn test_skf_rejected() {
        let mut buf = Vec::new();
        buf.push(0);
        buf.push(0);
        buf.extend_from_slice(&8u16.to_be_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0]);

        let result = decode_payload_chain(PayloadType::SKF.to_u8(), &buf);
        assert!(matches!(result, Err(IkeError::InvalidSyntax(_))));
    }
}
