//! Cryptographic primitives for the IKEv2 core
//!
//! Algorithm objects are keyed by IANA transform id and expose block,
//! key and checksum sizes plus their single operation (encrypt/decrypt,
//! MAC, PRF, key exchange).

pub mod cipher;
pub mod dh;
pub mod integrity;
pub mod prf;
pub(crate) mod xcbc;

pub use cipher::IkeCipher;
pub use dh::{DhGroup, DhKeyPair};
pub use integrity::IntegrityAlgorithm;
pub use prf::PrfAlgorithm;
