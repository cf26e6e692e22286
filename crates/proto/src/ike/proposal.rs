//! IKEv2 Proposal and Transform structures
//!
//! Implements SA payload negotiation as defined in RFC 7296 Section 3.3,
//! including the bit-exact wire format of proposal and transform
//! substructures.
//!
//! # Structure
//!
//! ```text
//! SA Payload
//!   └── Proposal(s)        (protocol, SPI, transform list)
//!         └── Transform(s) (type, id, key-length attribute)
//! ```

use super::constants::ProtocolId;
use super::crypto::{DhGroup, IkeCipher, IntegrityAlgorithm, PrfAlgorithm};
use super::{IkeError, Result};

/// Transform Type (RFC 7296 Section 3.3.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransformType {
    /// Encryption Algorithm (ENCR)
    Encr = 1,
    /// Pseudo-random Function (PRF)
    Prf = 2,
    /// Integrity Algorithm (INTEG)
    Integ = 3,
    /// Diffie-Hellman Group (D-H)
    Dh = 4,
    /// Extended Sequence Numbers (ESN)
    Esn = 5,
}

impl TransformType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(TransformType::Encr),
            2 => Some(TransformType::Prf),
            3 => Some(TransformType::Integ),
            4 => Some(TransformType::Dh),
            5 => Some(TransformType::Esn),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Attribute type for key length (RFC 7296 Section 3.3.5)
const ATTR_KEY_LENGTH: u16 = 14;

/// AF bit marking a TV-format (fixed-size) attribute
const ATTR_FORMAT_TV: u16 = 0x8000;

/// A single cryptographic algorithm choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transform {
    /// Transform type
    pub transform_type: TransformType,

    /// IANA transform id
    pub id: u16,

    /// Key length attribute in bits (AES transforms)
    pub key_len_bits: Option<u16>,
}

impl Transform {
    /// Create a transform without attributes
    pub fn new(transform_type: TransformType, id: u16) -> Self {
        Transform {
            transform_type,
            id,
            key_len_bits: None,
        }
    }

    /// Encryption transform with an optional key-length attribute
    pub fn encr(id: u16, key_len_bits: Option<u16>) -> Self {
        Transform {
            transform_type: TransformType::Encr,
            id,
            key_len_bits,
        }
    }

    /// PRF transform
    pub fn prf(algo: PrfAlgorithm) -> Self {
        Transform::new(TransformType::Prf, algo.transform_id())
    }

    /// Integrity transform
    pub fn integ(algo: IntegrityAlgorithm) -> Self {
        Transform::new(TransformType::Integ, algo.transform_id())
    }

    /// Diffie-Hellman group transform
    pub fn dh(group: DhGroup) -> Self {
        Transform::new(TransformType::Dh, group.transform_id())
    }

    /// ESN transform with sequence numbers disabled
    pub fn esn_none() -> Self {
        Transform::new(TransformType::Esn, 0)
    }

    /// Exact match on type, id and key length
    pub fn matches(&self, other: &Transform) -> bool {
        self.transform_type == other.transform_type
            && self.id == other.id
            && self.key_len_bits == other.key_len_bits
    }

    fn encoded_len(&self) -> usize {
        8 + if self.key_len_bits.is_some() { 4 } else { 0 }
    }

    fn encode_to(&self, is_last: bool, buf: &mut Vec<u8>) {
        buf.push(if is_last { 0 } else { 3 });
        buf.push(0); // Reserved
        buf.extend_from_slice(&(self.encoded_len() as u16).to_be_bytes());
        buf.push(self.transform_type.to_u8());
        buf.push(0); // Reserved
        buf.extend_from_slice(&self.id.to_be_bytes());

        if let Some(bits) = self.key_len_bits {
            buf.extend_from_slice(&(ATTR_FORMAT_TV | ATTR_KEY_LENGTH).to_be_bytes());
            buf.extend_from_slice(&bits.to_be_bytes());
        }
    }

    fn decode(data: &[u8]) -> Result<(Transform, bool, usize)> {
        if data.len() < 8 {
            return Err(IkeError::BufferTooShort {
                required: 8,
                available: data.len(),
            });
        }

        let more = match data[0] {
            0 => false,
            3 => true,
            other => {
                return Err(IkeError::InvalidSyntax(format!(
                    "bad transform last/more octet: {}",
                    other
                )))
            }
        };

        let length = u16::from_be_bytes([data[2], data[3]]) as usize;
        if length < 8 || length > data.len() {
            return Err(IkeError::InvalidSyntax(format!(
                "bad transform length: {}",
                length
            )));
        }

        let transform_type = TransformType::from_u8(data[4]).ok_or_else(|| {
            IkeError::InvalidSyntax(format!("unknown transform type: {}", data[4]))
        })?;
        let id = u16::from_be_bytes([data[6], data[7]]);

        // Walk attributes; only the TV key-length attribute is understood
        let mut key_len_bits = None;
        let mut offset = 8;
        while offset < length {
            if offset + 4 > length {
                return Err(IkeError::InvalidSyntax("truncated transform attribute".into()));
            }
            let attr_head = u16::from_be_bytes([data[offset], data[offset + 1]]);
            if attr_head & ATTR_FORMAT_TV == 0 {
                // TLV format: length follows, value after
                let attr_len =
                    u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
                offset += 4 + attr_len;
                continue;
            }
            let attr_type = attr_head & !ATTR_FORMAT_TV;
            let value = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
            if attr_type == ATTR_KEY_LENGTH {
                key_len_bits = Some(value);
            }
            offset += 4;
        }
        if offset != length {
            return Err(IkeError::InvalidSyntax(
                "transform attributes overrun transform length".into(),
            ));
        }

        Ok((
            Transform {
                transform_type,
                id,
                key_len_bits,
            },
            more,
            length,
        ))
    }
}

/// One SA proposal: a protocol, an SPI and a set of transforms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    /// Proposal number (1-based)
    pub number: u8,

    /// Protocol this proposal negotiates
    pub protocol: ProtocolId,

    /// SPI (empty for initial IKE SA, 4 bytes for Child, 8 for rekeyed IKE)
    pub spi: Vec<u8>,

    /// Transform list
    pub transforms: Vec<Transform>,
}

impl Proposal {
    /// Create a proposal without an SPI
    pub fn new(number: u8, protocol: ProtocolId) -> Self {
        Proposal {
            number,
            protocol,
            spi: Vec::new(),
            transforms: Vec::new(),
        }
    }

    /// Add a transform
    pub fn add_transform(mut self, transform: Transform) -> Self {
        self.transforms.push(transform);
        self
    }

    /// Attach an SPI
    pub fn with_spi(mut self, spi: Vec<u8>) -> Self {
        self.spi = spi;
        self
    }

    /// The Child SPI carried by this proposal, when 4 bytes wide
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

    /// First transform of the given type
    pub fn get_transform(&self, transform_type: TransformType) -> Option<&Transform> {
        self.transforms
            .iter()
            .find(|t| t.transform_type == transform_type)
    }

    /// Negotiated cipher, built from ENCR transform and key-length attribute
    pub fn cipher(&self) -> Result<IkeCipher> {
        let transform = self
            .get_transform(TransformType::Encr)
            .ok_or_else(|| IkeError::InvalidSyntax("proposal has no ENCR transform".into()))?;
        IkeCipher::new(transform.id, transform.key_len_bits.unwrap_or(0) as usize)
    }

    /// Negotiated PRF (IKE proposals only)
    pub fn prf(&self) -> Result<PrfAlgorithm> {
        let transform = self
            .get_transform(TransformType::Prf)
            .ok_or_else(|| IkeError::InvalidSyntax("proposal has no PRF transform".into()))?;
        PrfAlgorithm::from_transform_id(transform.id)
            .ok_or_else(|| IkeError::InvalidSyntax(format!("unknown PRF id {}", transform.id)))
    }

    /// Negotiated integrity algorithm; `None` transform treated as absent
    pub fn integrity(&self) -> Result<IntegrityAlgorithm> {
        match self.get_transform(TransformType::Integ) {
            Some(transform) => IntegrityAlgorithm::from_transform_id(transform.id).ok_or_else(
                || IkeError::InvalidSyntax(format!("unknown INTEG id {}", transform.id)),
            ),
            None => Ok(IntegrityAlgorithm::None),
        }
    }

    /// Negotiated DH group; absent transform means NONE
    pub fn dh_group(&self) -> Result<DhGroup> {
        match self.get_transform(TransformType::Dh) {
            Some(transform) => DhGroup::from_transform_id(transform.id).ok_or_else(|| {
                IkeError::InvalidSyntax(format!("unknown DH group id {}", transform.id))
            }),
            None => Ok(DhGroup::None),
        }
    }

    /// Check if every transform in this proposal appears in `configured`.
    pub fn is_acceptable(&self, configured: &[Proposal]) -> bool {
        configured.iter().any(|config| {
            config.protocol == self.protocol
                && self.transforms.iter().all(|ours| {
                    config.transforms.iter().any(|theirs| ours.matches(theirs))
                })
        })
    }

    /// Encode this proposal substructure.
    pub(crate) fn encode_to(&self, is_last: bool, buf: &mut Vec<u8>) {
        let transforms_len: usize = self.transforms.iter().map(Transform::encoded_len).sum();
        let length = 8 + self.spi.len() + transforms_len;

        buf.push(if is_last { 0 } else { 2 });
        buf.push(0); // Reserved
        buf.extend_from_slice(&(length as u16).to_be_bytes());
        buf.push(self.number);
        buf.push(self.protocol.to_u8());
        buf.push(self.spi.len() as u8);
        buf.push(self.transforms.len() as u8);
        buf.extend_from_slice(&self.spi);

        let last_index = self.transforms.len().saturating_sub(1);
        for (i, transform) in self.transforms.iter().enumerate() {
            transform.encode_to(i == last_index, buf);
        }
    }

    fn decode(data: &[u8]) -> Result<(Proposal, bool, usize)> {
        if data.len() < 8 {
            return Err(IkeError::BufferTooShort {
                required: 8,
                available: data.len(),
            });
        }

        let more = match data[0] {
            0 => false,
            2 => true,
            other => {
                return Err(IkeError::InvalidSyntax(format!(
                    "bad proposal last/more octet: {}",
                    other
                )))
            }
        };

        let length = u16::from_be_bytes([data[2], data[3]]) as usize;
        if length < 8 || length > data.len() {
            return Err(IkeError::InvalidSyntax(format!(
                "bad proposal length: {}",
                length
            )));
        }

        let number = data[4];
        let protocol = ProtocolId::from_u8(data[5]).ok_or_else(|| {
            IkeError::InvalidSyntax(format!("unknown protocol id: {}", data[5]))
        })?;
        let spi_size = data[6] as usize;
        let transform_count = data[7] as usize;

        if 8 + spi_size > length {
            return Err(IkeError::InvalidSyntax("SPI overruns proposal".into()));
        }
        let spi = data[8..8 + spi_size].to_vec();

        let mut transforms = Vec::with_capacity(transform_count);
        let mut offset = 8 + spi_size;
        let mut expect_more = transform_count > 0;
        while expect_more {
            let (transform, more_transforms, consumed) = Transform::decode(&data[offset..length])?;
            transforms.push(transform);
            offset += consumed;
            expect_more = more_transforms;
        }

        if transforms.len() != transform_count {
            return Err(IkeError::InvalidSyntax(format!(
                "proposal declares {} transforms, found {}",
                transform_count,
                transforms.len()
            )));
        }
        if offset != length {
            return Err(IkeError::InvalidSyntax(
                "transform list does not fill proposal".into(),
            ));
        }

        Ok((
            Proposal {
                number,
                protocol,
                spi,
                transforms,
            },
            more,
            length,
        ))
    }
}

/// Encode a proposal list as SA payload body bytes.
pub fn encode_proposals(proposals: &[Proposal]) -> Vec<u8> {
    let mut buf = Vec::new();
    let last_index = proposals.len().saturating_sub(1);
    for (i, proposal) in proposals.iter().enumerate() {
        proposal.encode_to(i == last_index, &mut buf);
    }
    buf
}

/// Decode the body of an SA payload into its proposal list.
pub fn decode_proposals(data: &[u8]) -> Result<Vec<Proposal>> {
    let mut proposals = Vec::new();
    let mut offset = 0;
    let mut expect_more = true;

    while expect_more {
        let (proposal, more, consumed) = Proposal::decode(&data[offset..])?;
        proposals.push(proposal);
        offset += consumed;
        expect_more = more;
    }

    if offset != data.len() {
        return Err(IkeError::InvalidSyntax(
            "proposal list does not fill SA payload".into(),
        ));
    }
    Ok(proposals)
}

/// Select the first offered proposal acceptable under local configuration
/// (RFC 7296 Section 2.7).
pub fn select_proposal<'a>(
    offered: &'a [Proposal],
    configured: &[Proposal],
) -> Result<&'a Proposal> {
    offered
        .iter()
        .find(|p| p.is_acceptable(configured))
        .ok_or(IkeError::NoProposalChosen)
}

/// Validate a response SA payload: exactly one proposal, and it must be a
/// subset of what we offered.
pub fn validate_response_proposal<'a>(
    response: &'a [Proposal],
    offered: &[Proposal],
) -> Result<&'a Proposal> {
    if response.len() != 1 {
        return Err(IkeError::InvalidSyntax(format!(
            "response SA payload must carry exactly one proposal, got {}",
            response.len()
        )));
    }
    let chosen = &response[0];
    if !chosen.is_acceptable(offered) {
        return Err(IkeError::NoProposalChosen);
    }
    Ok(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ike_proposal() -> Proposal {
        Proposal::new(1, ProtocolId::Ike)
            .add_transform(Transform::encr(IkeCipher::ENCR_AES_CBC, Some(128)))
            .add_transform(Transform::prf(PrfAlgorithm::HmacSha1))
            .add_transform(Transform::integ(IntegrityAlgorithm::HmacSha1_96))
            .add_transform(Transform::dh(DhGroup::Modp2048))
    }

    fn esp_proposal(spi: u32) -> Proposal {
        Proposal::new(1, ProtocolId::Esp)
            .add_transform(Transform::encr(IkeCipher::ENCR_AES_CBC, Some(128)))
            .add_transform(Transform::integ(IntegrityAlgorithm::HmacSha1_96))
            .add_transform(Transform::esn_none())
            .with_spi(spi.to_be_bytes().to_vec())
    }

    #[test]
    fn test_proposal_roundtrip() {
        let proposals = vec![ike_proposal()];
        let encoded = encode_proposals(&proposals);
        let decoded = decode_proposals(&encoded).unwrap();
        assert_eq!(decoded, proposals);
    }

    #[test]
    fn test_multiple_proposals_roundtrip() {
        let second = Proposal::new(2, ProtocolId::Ike)
            .add_transform(Transform::encr(IkeCipher::ENCR_AES_GCM_16, Some(256)))
            .add_transform(Transform::prf(PrfAlgorithm::Aes128Xcbc))
            .add_transform(Transform::dh(DhGroup::Modp1024));

        let proposals = vec![ike_proposal(), second];
        let encoded = encode_proposals(&proposals);
        let decoded = decode_proposals(&encoded).unwrap();
        assert_eq!(decoded, proposals);
    }

    #[test]
    fn test_esp_proposal_spi_roundtrip() {
        let proposals = vec![esp_proposal(0xDEADBEEF)];
        let encoded = encode_proposals(&proposals);
        let decoded = decode_proposals(&encoded).unwrap();
        assert_eq!(decoded[0].child_spi(), Some(0xDEADBEEF));
    }

    #[test]
    fn test_key_length_attribute_encoding() {
        let proposals = vec![ike_proposal()];
        let encoded = encode_proposals(&proposals);

        // The ENCR transform carries exactly one TV key-length attribute
        let decoded = decode_proposals(&encoded).unwrap();
        let encr = decoded[0].get_transform(TransformType::Encr).unwrap();
        assert_eq!(encr.key_len_bits, Some(128));
    }

    #[test]
    fn test_negotiated_algorithms() {
        let proposal = ike_proposal();
        assert_eq!(proposal.cipher().unwrap().key_len(), 16);
        assert_eq!(proposal.prf().unwrap(), PrfAlgorithm::HmacSha1);
        assert_eq!(
            proposal.integrity().unwrap(),
            IntegrityAlgorithm::HmacSha1_96
        );
        assert_eq!(proposal.dh_group().unwrap(), DhGroup::Modp2048);
    }

    #[test]
    fn test_esp_proposal_defaults() {
        let proposal = esp_proposal(1);
        assert_eq!(proposal.dh_group().unwrap(), DhGroup::None);
        assert!(proposal.prf().is_err());
    }

    #[test]
    fn test_select_proposal() {
        let offered = vec![ike_proposal()];
        let configured = vec![ike_proposal()];
        let selected = select_proposal(&offered, &configured).unwrap();
        assert_eq!(selected.number, 1);
    }

    #[test]
    fn test_select_proposal_key_length_mismatch() {
        let offered = vec![Proposal::new(1, ProtocolId::Ike)
            .add_transform(Transform::encr(IkeCipher::ENCR_AES_CBC, Some(256)))];
        let configured = vec![Proposal::new(1, ProtocolId::Ike)
            .add_transform(Transform::encr(IkeCipher::ENCR_AES_CBC, Some(128)))];

        assert!(matches!(
            select_proposal(&offered, &configured),
            Err(IkeError::NoProposalChosen)
        ));
    }

    #[test]
    fn test_validate_response_single_proposal() {
        let offered = vec![ike_proposal()];
        let response = vec![ike_proposal()];
        assert!(validate_response_proposal(&response, &offered).is_ok());

        let two = vec![ike_proposal(), ike_proposal()];
        assert!(matches!(
            validate_response_proposal(&two, &offered),
            Err(IkeError::InvalidSyntax(_))
        ));
    }

    #[test]
    fn test_decode_rejects_bad_last_more() {
        let mut encoded = encode_proposals(&[ike_proposal()]);
        encoded[0] = 7;
        assert!(matches!(
            decode_proposals(&encoded),
            Err(IkeError::InvalidSyntax(_))
        ));
    }

    #[test]
    fn test_decode_rejects_transform_count_mismatch() {
        let mut encoded = encode_proposals(&[ike_proposal()]);
        encoded[7] = 2; // claims 2 transforms, chain carries 4
        assert!(decode_proposals(&encoded).is_err());
    }

    #[test]
    fn test_decode_rejects_trailing_garbage() {
        let mut encoded = encode_proposals(&[ike_proposal()]);
        encoded.extend_from_slice(&[0u8; 3]);
        assert!(matches!(
            decode_proposals(&encoded),
            Err(IkeError::InvalidSyntax(_))
        ));
    }
}
