//! Protocol implementations for the Krait security ecosystem.
//!
//! This crate provides the IKEv2 / EAP authentication core used to
//! establish and maintain IPsec security associations on a mobile
//! endpoint:
//!
//! - **IKEv2** (Internet Key Exchange v2) - RFC 7296
//! - **EAP-in-IKE** - RFC 3748, with EAP-SIM/AKA/AKA' methods
//! - **NAT-T** framing - RFC 3948
//!
//! # Example
//!
//! ```rust,no_run
//! use krait_proto::ike::config::IkeSessionConfig;
//! use krait_proto::ike::constants::ProtocolId;
//! use krait_proto::ike::crypto::{DhGroup, IkeCipher, IntegrityAlgorithm, PrfAlgorithm};
//! use krait_proto::ike::eap::{EapMethodType, EapSessionConfig};
//! use krait_proto::ike::message::IdType;
//! use krait_proto::ike::proposal::{Proposal, Transform};
//!
//! let proposal = Proposal::new(1, ProtocolId::Ike)
//!     .add_transform(Transform::encr(IkeCipher::ENCR_AES_CBC, Some(128)))
//!     .add_transform(Transform::prf(PrfAlgorithm::HmacSha1))
//!     .add_transform(Transform::integ(IntegrityAlgorithm::HmacSha1_96))
//!     .add_transform(Transform::dh(DhGroup::Modp2048));
//!
//! let config = IkeSessionConfig::builder()
//!     .local_addr("192.0.2.200:500".parse().unwrap())
//!     .remote_addr("192.0.2.100:500".parse().unwrap())
//!     .add_proposal(proposal)
//!     .local_identity(IdType::Rfc822Addr, b"0@example.org".to_vec())
//!     .eap(EapSessionConfig {
//!         method: EapMethodType::Aka,
//!         eap_identity: None,
//!     })
//!     .build()
//!     .unwrap();
//! # let _ = config;
//! ```
//!
//! # Security
//!
//! This crate follows OpenSSF Best Practices:
//! - All cryptographic operations use vetted libraries
//! - Constant-time operations for authentication
//! - Secure memory handling with `zeroize`
//! - Comprehensive testing of codec and state machines
//!
//! # References
//!
//! - [RFC 7296](https://datatracker.ietf.org/doc/html/rfc7296) - IKEv2 Protocol
//! - [RFC 3748](https://datatracker.ietf.org/doc/html/rfc3748) - EAP
//! - [RFC 4186](https://datatracker.ietf.org/doc/html/rfc4186) - EAP-SIM
//! - [RFC 4187](https://datatracker.ietf.org/doc/html/rfc4187) - EAP-AKA
//! - [RFC 5448](https://datatracker.ietf.org/doc/html/rfc5448) - EAP-AKA'

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod ike;
