//! IKE message header (RFC 7296 Section 3.1)

use crate::ike::constants::*;
use crate::ike::{IkeError, Result};

/// IKE message header (28 bytes)
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       IKE SA Initiator's SPI                  |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       IKE SA Responder's SPI                  |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Next Payload | MjVer | MnVer | Exchange Type |     Flags     |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                          Message ID                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                            Length                             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IkeHeader {
    /// Initiator's Security Parameter Index (8 bytes)
    pub initiator_spi: [u8; 8],

    /// Responder's Security Parameter Index (8 bytes, zero in the first
    /// IKE_SA_INIT request)
    pub responder_spi: [u8; 8],

    /// Next payload type
    pub next_payload: PayloadType,

    /// Protocol version (must be 0x20 for IKEv2)
    pub version: u8,

    /// Exchange type
    pub exchange_type: ExchangeType,

    /// Message flags
    pub flags: IkeFlags,

    /// Message ID (request/response pairing and replay protection)
    pub message_id: u32,

    /// Total message length in bytes (including header)
    pub length: u32,
}

impl IkeHeader {
    /// Create a new IKE header
    pub fn new(
        initiator_spi: [u8; 8],
        responder_spi: [u8; 8],
        next_payload: PayloadType,
        exchange_type: ExchangeType,
        flags: IkeFlags,
        message_id: u32,
        length: u32,
    ) -> Self {
        IkeHeader {
            initiator_spi,
            responder_spi,
            next_payload,
            version: IKE_VERSION,
            exchange_type,
            flags,
            message_id,
            length,
        }
    }

    /// Parse an IKE header from bytes
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Buffer is too short (< 28 bytes)
    /// - Protocol version is not 2.0
    /// - Exchange type is unknown
    /// - Message length is invalid
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < IKE_HEADER_SIZE {
            return Err(IkeError::BufferTooShort {
                required: IKE_HEADER_SIZE,
                available: data.len(),
            });
        }

        let mut initiator_spi = [0u8; 8];
        let mut responder_spi = [0u8; 8];
        initiator_spi.copy_from_slice(&data[0..8]);
        responder_spi.copy_from_slice(&data[8..16]);

        let next_payload = PayloadType::from_u8(data[16]).ok_or_else(|| {
            IkeError::InvalidSyntax(format!("unknown first payload type: {}", data[16]))
        })?;

        let version = data[17];
        if version != IKE_VERSION {
            return Err(IkeError::UnsupportedVersion(version));
        }

        let exchange_type = ExchangeType::from_u8(data[18])
            .ok_or(IkeError::UnsupportedExchangeType(data[18]))?;

        let flags = IkeFlags::new(data[19]);

        let message_id = u32::from_be_bytes([data[20], data[21], data[22], data[23]]);
        let length = u32::from_be_bytes([data[24], data[25], data[26], data[27]]);

        if length > MAX_IKE_MESSAGE_SIZE {
            return Err(IkeError::MessageTooLarge(length));
        }
        if (length as usize) < IKE_HEADER_SIZE {
            return Err(IkeError::InvalidLength {
                expected: IKE_HEADER_SIZE,
                actual: length as usize,
            });
        }

        Ok(IkeHeader {
            initiator_spi,
            responder_spi,
            next_payload,
            version,
            exchange_type,
            flags,
            message_id,
            length,
        })
    }

    /// Serialize the header to its 28-byte wire form
    pub fn to_bytes(&self) -> [u8; IKE_HEADER_SIZE] {
        let mut bytes = [0u8; IKE_HEADER_SIZE];

        bytes[0..8].copy_from_slice(&self.initiator_spi);
        bytes[8..16].copy_from_slice(&self.responder_spi);
        bytes[16] = self.next_payload.to_u8();
        bytes[17] = self.version;
        bytes[18] = self.exchange_type.to_u8();
        bytes[19] = self.flags.value();
        bytes[20..24].copy_from_slice(&self.message_id.to_be_bytes());
        bytes[24..28].copy_from_slice(&self.length.to_be_bytes());

        bytes
    }
}
