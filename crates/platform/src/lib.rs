//! # Krait Platform
//!
//! Core platform types and collaborator traits for the Krait security stack.
//!
//! This crate provides:
//! - Unified error types (`KraitError`, `KraitResult`)
//! - Abstract collaborators consumed by the protocol core
//!   (`IpsecTransformInstaller`, `SimAuthProvider`, `DatagramSocket`,
//!   `Clock`, `CallbackExecutor`)
//!
//! # Examples
//!
//! ```
//! use krait_platform::{KraitError, KraitResult};
//!
//! fn example_function() -> KraitResult<String> {
//!     Ok("Hello, Krait!".to_string())
//! }
//!
//! # fn main() -> KraitResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, Krait!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod traits;

pub use error::{KraitError, KraitResult};
pub use traits::{
    CallbackExecutor, Clock, DatagramSocket, InlineExecutor, IpsecTransformInstaller,
    MonotonicClock, OwnedSpi, OwnedTransform, SimAppType, SimAuthProvider, SimAuthResponse,
    SimChallenge, TransformDirection, TransformRequest,
};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
