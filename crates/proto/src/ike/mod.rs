//! IKEv2 / EAP authentication core (RFC 7296)
//!
//! This module implements the control-plane core used on a mobile
//! endpoint to establish and maintain IPsec security associations:
//!
//! - **IKEv2** session and child state machines - RFC 7296
//! - **EAP** authentication inside IKE_AUTH - RFC 3748
//! - **EAP-SIM / EAP-AKA / EAP-AKA'** - RFC 4186 / 4187 / 5448
//! - **NAT-T** detection and UDP encapsulation framing - RFC 3948
//!
//! # Architecture
//!
//! ```text
//! IkeSession (one event loop per session)
//!   ├── IKE_SA_INIT  (DH, nonces, NAT detection)
//!   ├── IKE_AUTH     (EAP loop -> MSK -> AUTH, first Child SA)
//!   └── established  (request queue, window size 1)
//!         ├── ChildSession xN  (create / rekey / delete)
//!         ├── Rekey-IKE        (local / remote / simultaneous)
//!         └── INFORMATIONAL    (delete, liveness)
//! ```
//!
//! Inbound datagrams flow through header parse, integrity check and
//! decryption, payload chain decode, then session dispatch; outbound
//! payload lists are enveloped, encrypted and tracked for
//! retransmission. Platform facilities (kernel transforms, SIM access,
//! sockets, time, user callbacks) are reached through the traits in
//! `krait-platform`.
//!
//! # Security
//!
//! - No unsafe code
//! - Constant-time checksum comparison
//! - Key material zeroized on release, never logged

pub mod config;
pub mod constants;
pub mod crypto;
pub mod eap;
pub mod error;
pub mod logging;
pub mod message;
pub mod nat;
pub mod proposal;
pub mod sa_record;
pub mod session;
pub mod ts;

pub use config::{ChildSessionConfig, IkeSessionConfig};
pub use error::{IkeError, Result};
pub use session::{ChildSessionCallback, IkeSession, IkeSessionCallback, IkeSessionCore};
