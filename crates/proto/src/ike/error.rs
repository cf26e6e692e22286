//! Error types for the IKEv2 / EAP core
//!
//! One unified error type covers codec, crypto and state-machine failures.
//! Protocol-visible errors map to IKEv2 notify types for on-wire reporting.

use super::constants::NotifyType;
use std::fmt;

/// Result type for IKE operations
pub type Result<T> = std::result::Result<T, IkeError>;

/// IKEv2 protocol errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IkeError {
    /// Message or payload violates the wire format
    InvalidSyntax(String),

    /// Unknown payload received with the critical bit set
    UnsupportedCriticalPayload(u8),

    /// No acceptable proposal found during negotiation
    NoProposalChosen,

    /// KE payload carried the wrong DH group
    InvalidKe {
        /// Group we require
        expected: u16,
        /// Group the peer sent
        received: u16,
    },

    /// Peer authentication failed
    AuthenticationFailed(String),

    /// Peer's traffic selectors are not a subset of what we offered
    TsUnacceptable,

    /// Peer signalled a transient condition; retry later
    TemporaryFailure,

    /// Request referenced a Child SA we do not own
    ChildSaNotFound(u32),

    /// Message ID outside the expected window
    InvalidMessageId {
        /// ID we expected
        expected: u32,
        /// ID the peer sent
        received: u32,
    },

    /// Integrity checksum on an encrypted message did not verify
    IntegrityCheckFailed,

    /// Retransmission limit reached without a response
    Timeout,

    /// Unsupported protocol version
    UnsupportedVersion(u8),

    /// Unsupported exchange type
    UnsupportedExchangeType(u8),

    /// Buffer too short for operation
    BufferTooShort {
        /// Required length
        required: usize,
        /// Available length
        available: usize,
    },

    /// Declared length disagrees with actual data
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Message exceeds the 64 KiB IKE limit
    MessageTooLarge(u32),

    /// Operation not legal in the current state
    InvalidState(String),

    /// Invalid caller-supplied parameter
    InvalidParameter(String),

    /// Cryptographic operation failed
    CryptoError(String),

    /// I/O error from the datagram transport
    Io(String),

    /// Internal error (runtime fault caught in a state handler)
    Internal(String),
}

impl IkeError {
    /// Notify type to report this error to the peer, if any.
    pub fn to_notify_type(&self) -> Option<NotifyType> {
        match self {
            IkeError::InvalidSyntax(_) => Some(NotifyType::InvalidSyntax),
            IkeError::UnsupportedCriticalPayload(_) => {
                Some(NotifyType::UnsupportedCriticalPayload)
            }
            IkeError::NoProposalChosen => Some(NotifyType::NoProposalChosen),
            IkeError::InvalidKe { .. } => Some(NotifyType::InvalidKePayload),
            IkeError::AuthenticationFailed(_) => Some(NotifyType::AuthenticationFailed),
            IkeError::TsUnacceptable => Some(NotifyType::TsUnacceptable),
            IkeError::TemporaryFailure => Some(NotifyType::TemporaryFailure),
            IkeError::ChildSaNotFound(_) => Some(NotifyType::ChildSaNotFound),
            IkeError::InvalidMessageId { .. } => Some(NotifyType::InvalidMessageId),
            _ => None,
        }
    }

    /// Build the error corresponding to a received error notification.
    pub fn from_notify_type(notify: NotifyType) -> Option<IkeError> {
        match notify {
            NotifyType::InvalidSyntax => {
                Some(IkeError::InvalidSyntax("peer reported INVALID_SYNTAX".into()))
            }
            NotifyType::UnsupportedCriticalPayload => {
                Some(IkeError::UnsupportedCriticalPayload(0))
            }
            NotifyType::NoProposalChosen => Some(IkeError::NoProposalChosen),
            NotifyType::InvalidKePayload => Some(IkeError::InvalidKe {
                expected: 0,
                received: 0,
            }),
            NotifyType::AuthenticationFailed => Some(IkeError::AuthenticationFailed(
                "peer reported AUTHENTICATION_FAILED".into(),
            )),
            NotifyType::TsUnacceptable => Some(IkeError::TsUnacceptable),
            NotifyType::TemporaryFailure => Some(IkeError::TemporaryFailure),
            NotifyType::ChildSaNotFound => Some(IkeError::ChildSaNotFound(0)),
            NotifyType::InvalidMessageId => Some(IkeError::InvalidMessageId {
                expected: 0,
                received: 0,
            }),
            _ => None,
        }
    }

    /// Whether this error tears down the whole IKE SA.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IkeError::InvalidSyntax(_)
                | IkeError::UnsupportedCriticalPayload(_)
                | IkeError::AuthenticationFailed(_)
                | IkeError::IntegrityCheckFailed
                | IkeError::Timeout
                | IkeError::Internal(_)
        )
    }
}

impl fmt::Display for IkeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IkeError::InvalidSyntax(msg) => write!(f, "Invalid syntax: {}", msg),
            IkeError::UnsupportedCriticalPayload(t) => {
                write!(f, "Unsupported critical payload: {}", t)
            }
            IkeError::NoProposalChosen => {
                write!(f, "No acceptable proposal found in negotiation")
            }
            IkeError::InvalidKe { expected, received } => {
                write!(f, "Invalid KE payload: expected group {}, got {}", expected, received)
            }
            IkeError::AuthenticationFailed(msg) => {
                write!(f, "Authentication failed: {}", msg)
            }
            IkeError::TsUnacceptable => write!(f, "Traffic selectors unacceptable"),
            IkeError::TemporaryFailure => write!(f, "Peer reported temporary failure"),
            IkeError::ChildSaNotFound(spi) => {
                write!(f, "Child SA not found: 0x{:08x}", spi)
            }
            IkeError::InvalidMessageId { expected, received } => {
                write!(f, "Invalid message ID: expected {}, got {}", expected, received)
            }
            IkeError::IntegrityCheckFailed => write!(f, "Integrity check failed"),
            IkeError::Timeout => write!(f, "Exchange timed out"),
            IkeError::UnsupportedVersion(v) => {
                write!(f, "Unsupported IKE version: 0x{:02x}", v)
            }
            IkeError::UnsupportedExchangeType(t) => {
                write!(f, "Unsupported exchange type: {}", t)
            }
            IkeError::BufferTooShort {
                required,
                available,
            } => {
                write!(f, "Buffer too short: need {} bytes, have {}", required, available)
            }
            IkeError::InvalidLength { expected, actual } => {
                write!(f, "Invalid length: expected {}, got {}", expected, actual)
            }
            IkeError::MessageTooLarge(size) => {
                write!(f, "IKE message too large: {} bytes", size)
            }
            IkeError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            IkeError::InvalidParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            IkeError::CryptoError(msg) => write!(f, "Cryptographic error: {}", msg),
            IkeError::Io(msg) => write!(f, "I/O error: {}", msg),
            IkeError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for IkeError {}

impl From<std::io::Error> for IkeError {
    fn from(err: std::io::Error) -> Self {
        IkeError::Io(err.to_string())
    }
}

impl From<krait_platform::KraitError> for IkeError {
    fn from(err: krait_platform::KraitError) -> Self {
        match err {
            krait_platform::KraitError::Io(e) => IkeError::Io(e.to_string()),
            other => IkeError::Internal(other.to_string()),
        }
    }
}
