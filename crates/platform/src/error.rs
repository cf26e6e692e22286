//! Error types for Krait

use std::fmt;

/// Unified error type for all Krait platform operations
#[derive(Debug)]
pub enum KraitError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol error
    Protocol(String),

    /// Security error (authentication, key handling, etc.)
    Security(String),

    /// Kernel resource error (SPI allocation, transform installation)
    Resource(String),

    /// SIM / credential access error
    Sim(String),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for KraitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KraitError::Io(e) => write!(f, "IO error: {}", e),
            KraitError::Config(msg) => write!(f, "Configuration error: {}", msg),
            KraitError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            KraitError::Security(msg) => write!(f, "Security error: {}", msg),
            KraitError::Resource(msg) => write!(f, "Resource error: {}", msg),
            KraitError::Sim(msg) => write!(f, "SIM error: {}", msg),
            KraitError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for KraitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KraitError::Io(e) => Some(e),
            KraitError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KraitError {
    fn from(err: std::io::Error) -> Self {
        KraitError::Io(err)
    }
}

/// Result type for Krait platform operations
pub type KraitResult<T> = Result<T, KraitError>;
