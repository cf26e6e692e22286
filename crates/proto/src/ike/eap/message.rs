//! EAP packet codec (RFC 3748 Section 4)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Code      |  Identifier   |            Length             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Type      |  Type-Data ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Success and Failure packets are headers only; Request and Response
//! carry a type byte and type data.

use super::EapError;

/// EAP header length
pub const EAP_HEADER_LEN: usize = 4;

/// EAP message codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EapCode {
    /// Request (1)
    Request = 1,
    /// Response (2)
    Response = 2,
    /// Success (3)
    Success = 3,
    /// Failure (4)
    Failure = 4,
}

impl EapCode {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(EapCode::Request),
            2 => Some(EapCode::Response),
            3 => Some(EapCode::Success),
            4 => Some(EapCode::Failure),
            _ => None,
        }
    }
}

/// EAP method type: Identity (1)
pub const TYPE_IDENTITY: u8 = 1;
/// EAP method type: Notification (2)
pub const TYPE_NOTIFICATION: u8 = 2;
/// EAP method type: Legacy Nak (3)
pub const TYPE_NAK: u8 = 3;
/// EAP method type: EAP-SIM (18)
pub const TYPE_SIM: u8 = 18;
/// EAP method type: EAP-AKA (23)
pub const TYPE_AKA: u8 = 23;
/// EAP method type: EAP-AKA' (50)
pub const TYPE_AKA_PRIME: u8 = 50;

/// A decoded EAP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EapMessage {
    /// Packet code
    pub code: EapCode,

    /// Identifier matching requests with responses
    pub identifier: u8,

    /// Method type and type data (Request/Response only)
    pub type_data: Option<(u8, Vec<u8>)>,
}

impl EapMessage {
    /// Decode an EAP packet.
    pub fn decode(data: &[u8]) -> Result<Self, EapError> {
        if data.len() < EAP_HEADER_LEN {
            return Err(EapError::InvalidSyntax(format!(
                "EAP packet of {} bytes below header size",
                data.len()
            )));
        }

        let code = EapCode::from_u8(data[0])
            .ok_or_else(|| EapError::InvalidSyntax(format!("unknown EAP code: {}", data[0])))?;
        let identifier = data[1];
        let length = u16::from_be_bytes([data[2], data[3]]) as usize;

        if length != data.len() {
            return Err(EapError::InvalidSyntax(format!(
                "EAP length field {} != packet length {}",
                length,
                data.len()
            )));
        }

        let type_data = match code {
            EapCode::Request | EapCode::Response => {
                if length < EAP_HEADER_LEN + 1 {
                    return Err(EapError::InvalidSyntax(
                        "EAP request/response without type".into(),
                    ));
                }
                Some((data[4], data[5..].to_vec()))
            }
            EapCode::Success | EapCode::Failure => {
                if length != EAP_HEADER_LEN {
                    return Err(EapError::InvalidSyntax(
                        "EAP success/failure with a body".into(),
                    ));
                }
                None
            }
        };

        Ok(EapMessage {
            code,
            identifier,
            type_data,
        })
    }

    /// Encode this packet.
    pub fn encode(&self) -> Vec<u8> {
        let body_len = self
            .type_data
            .as_ref()
            .map(|(_, data)| 1 + data.len())
            .unwrap_or(0);
        let length = (EAP_HEADER_LEN + body_len) as u16;

        let mut out = Vec::with_capacity(length as usize);
        out.push(self.code as u8);
        out.push(self.identifier);
        out.extend_from_slice(&length.to_be_bytes());
        if let Some((method_type, data)) = &self.type_data {
            out.push(*method_type);
            out.extend_from_slice(data);
        }
        out
    }

    /// Build a Response packet.
    pub fn response(identifier: u8, method_type: u8, data: Vec<u8>) -> Self {
        EapMessage {
            code: EapCode::Response,
            identifier,
            type_data: Some((method_type, data)),
        }
    }

    /// The method type of a Request/Response
    pub fn method_type(&self) -> Option<u8> {
        self.type_data.as_ref().map(|(t, _)| *t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_identity_roundtrip() {
        // Request/Identity, id 16
        let raw = [0x01, 0x10, 0x00, 0x05, 0x01];
        let message = EapMessage::decode(&raw).unwrap();

        assert_eq!(message.code, EapCode::Request);
        assert_eq!(message.identifier, 0x10);
        assert_eq!(message.method_type(), Some(TYPE_IDENTITY));
        assert_eq!(message.encode(), raw);
    }

    #[test]
    fn test_success_roundtrip() {
        let raw = [0x03, 0x02, 0x00, 0x04];
        let message = EapMessage::decode(&raw).unwrap();
        assert_eq!(message.code, EapCode::Success);
        assert_eq!(message.type_data, None);
        assert_eq!(message.encode(), raw);
    }

    #[test]
    fn test_response_builder() {
        let response = EapMessage::response(7, TYPE_IDENTITY, b"user@realm".to_vec());
        let encoded = response.encode();
        assert_eq!(encoded[0], 0x02);
        assert_eq!(encoded[1], 7);
        assert_eq!(
            u16::from_be_bytes([encoded[2], encoded[3]]) as usize,
            encoded.len()
        );

        let decoded = EapMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let raw = [0x01, 0x10, 0x00, 0x06, 0x01]; // declares 6, is 5
        assert!(matches!(
            EapMessage::decode(&raw),
            Err(EapError::InvalidSyntax(_))
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_code() {
        let raw = [0x07, 0x10, 0x00, 0x04];
        assert!(matches!(
            EapMessage::decode(&raw),
            Err(EapError::InvalidSyntax(_))
        ));
    }

    #[test]
    fn test_decode_rejects_request_without_type() {
        let raw = [0x01, 0x10, 0x00, 0x04];
        assert!(matches!(
            EapMessage::decode(&raw),
            Err(EapError::InvalidSyntax(_))
        ));
    }

    #[test]
    fn test_decode_rejects_success_with_body() {
        let raw = [0x03, 0x10, 0x00, 0x05, 0x00];
        assert!(matches!(
            EapMessage::decode(&raw),
            Err(EapError::InvalidSyntax(_))
        ));
    }

    #[test]
    fn test_decode_rejects_truncated() {
        assert!(EapMessage::decode(&[0x01, 0x02]).is_err());
    }
}
