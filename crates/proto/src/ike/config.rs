//! Session configuration
//!
//! Builder-style configuration for IKE sessions and their Child Sessions.
//! Lifetime bounds follow the validated ranges: hard lifetime within
//! 300..=14400 seconds, soft lifetime at least 120 seconds and at least
//! 60 seconds below the hard lifetime.

use super::eap::EapSessionConfig;
use super::message::{IdPayload, IdType};
use super::proposal::Proposal;
use super::ts::TrafficSelectorsPayload;
use super::{IkeError, Result};
use std::net::SocketAddr;
use std::time::Duration;

/// Default soft lifetime (seconds)
pub const DEFAULT_SOFT_LIFETIME_SECS: u32 = 3600;
/// Default hard lifetime (seconds)
pub const DEFAULT_HARD_LIFETIME_SECS: u32 = 7200;
/// Minimum hard lifetime (seconds)
pub const MIN_HARD_LIFETIME_SECS: u32 = 300;
/// Maximum hard lifetime (seconds)
pub const MAX_HARD_LIFETIME_SECS: u32 = 14400;
/// Minimum soft lifetime (seconds)
pub const MIN_SOFT_LIFETIME_SECS: u32 = 120;
/// Minimum gap between soft and hard lifetime (seconds)
pub const MIN_LIFETIME_MARGIN_SECS: u32 = 60;

/// Configuration for one IKE Session.
#[derive(Debug, Clone)]
pub struct IkeSessionConfig {
    /// Local address (source of IKE datagrams)
    pub local_addr: SocketAddr,

    /// Remote IKE peer address
    pub remote_addr: SocketAddr,

    /// IKE SA proposals, most preferred first
    pub ike_proposals: Vec<Proposal>,

    /// Local identification
    pub local_identity: IdPayload,

    /// Expected remote identification (request only, not enforced)
    pub remote_identity: Option<IdPayload>,

    /// EAP method selection
    pub eap: EapSessionConfig,
}

impl IkeSessionConfig {
    /// Create a builder
    pub fn builder() -> IkeSessionConfigBuilder {
        IkeSessionConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.ike_proposals.is_empty() {
            return Err(IkeError::InvalidParameter(
                "at least one IKE proposal required".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`IkeSessionConfig`]
#[derive(Debug, Default)]
pub struct IkeSessionConfigBuilder {
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    ike_proposals: Vec<Proposal>,
    local_identity: Option<IdPayload>,
    remote_identity: Option<IdPayload>,
    eap: Option<EapSessionConfig>,
}

impl IkeSessionConfigBuilder {
    /// Set the local address
    pub fn local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    /// Set the remote peer address
    pub fn remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Add an IKE proposal
    pub fn add_proposal(mut self, proposal: Proposal) -> Self {
        self.ike_proposals.push(proposal);
        self
    }

    /// Set the local identity
    pub fn local_identity(mut self, id_type: IdType, data: Vec<u8>) -> Self {
        self.local_identity = Some(IdPayload::new(id_type, data));
        self
    }

    /// Request a specific remote identity
    pub fn remote_identity(mut self, id_type: IdType, data: Vec<u8>) -> Self {
        self.remote_identity = Some(IdPayload::new(id_type, data));
        self
    }

    /// Set the EAP configuration
    pub fn eap(mut self, eap: EapSessionConfig) -> Self {
        self.eap = Some(eap);
        self
    }

    /// Build, validating required fields
    pub fn build(self) -> Result<IkeSessionConfig> {
        let config = IkeSessionConfig {
            local_addr: self
                .local_addr
                .ok_or_else(|| IkeError::InvalidParameter("local_addr is required".into()))?,
            remote_addr: self
                .remote_addr
                .ok_or_else(|| IkeError::InvalidParameter("remote_addr is required".into()))?,
            ike_proposals: self.ike_proposals,
            local_identity: self
                .local_identity
                .ok_or_else(|| IkeError::InvalidParameter("local_identity is required".into()))?,
            remote_identity: self.remote_identity,
            eap: self
                .eap
                .ok_or_else(|| IkeError::InvalidParameter("eap configuration is required".into()))?,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Configuration for one Child Session.
#[derive(Debug, Clone)]
pub struct ChildSessionConfig {
    /// Child SA proposals, most preferred first
    pub proposals: Vec<Proposal>,

    /// Local traffic selectors (default: all IPv4)
    pub local_ts: TrafficSelectorsPayload,

    /// Remote traffic selectors (default: all IPv4)
    pub remote_ts: TrafficSelectorsPayload,

    /// Transport mode instead of tunnel mode
    pub is_transport: bool,

    /// Soft lifetime: rekey is scheduled here
    pub soft_lifetime: Duration,

    /// Hard lifetime
    pub hard_lifetime: Duration,
}

impl ChildSessionConfig {
    /// Create a builder
    pub fn builder() -> ChildSessionConfigBuilder {
        ChildSessionConfigBuilder::default()
    }

    /// Validate lifetime bounds and proposal presence
    pub fn validate(&self) -> Result<()> {
        if self.proposals.is_empty() {
            return Err(IkeError::InvalidParameter(
                "at least one Child SA proposal required".into(),
            ));
        }

        let hard = self.hard_lifetime.as_secs() as u32;
        let soft = self.soft_lifetime.as_secs() as u32;

        if !(MIN_HARD_LIFETIME_SECS..=MAX_HARD_LIFETIME_SECS).contains(&hard) {
            return Err(IkeError::InvalidParameter(format!(
                "hard lifetime {}s outside {}..={}s",
                hard, MIN_HARD_LIFETIME_SECS, MAX_HARD_LIFETIME_SECS
            )));
        }
        if soft < MIN_SOFT_LIFETIME_SECS {
            return Err(IkeError::InvalidParameter(format!(
                "soft lifetime {}s below minimum {}s",
                soft, MIN_SOFT_LIFETIME_SECS
            )));
        }
        if soft + MIN_LIFETIME_MARGIN_SECS > hard {
            return Err(IkeError::InvalidParameter(format!(
                "soft lifetime {}s must be at least {}s below hard lifetime {}s",
                soft, MIN_LIFETIME_MARGIN_SECS, hard
            )));
        }
        Ok(())
    }
}

/// Builder for [`ChildSessionConfig`]
#[derive(Debug, Default)]
pub struct ChildSessionConfigBuilder {
    proposals: Vec<Proposal>,
    local_ts: Option<TrafficSelectorsPayload>,
    remote_ts: Option<TrafficSelectorsPayload>,
    is_transport: bool,
    soft_lifetime: Option<Duration>,
    hard_lifetime: Option<Duration>,
}

impl ChildSessionConfigBuilder {
    /// Add a Child SA proposal
    pub fn add_proposal(mut self, proposal: Proposal) -> Self {
        self.proposals.push(proposal);
        self
    }

    /// Set local traffic selectors
    pub fn local_ts(mut self, ts: TrafficSelectorsPayload) -> Self {
        self.local_ts = Some(ts);
        self
    }

    /// Set remote traffic selectors
    pub fn remote_ts(mut self, ts: TrafficSelectorsPayload) -> Self {
        self.remote_ts = Some(ts);
        self
    }

    /// Use transport mode
    pub fn transport_mode(mut self) -> Self {
        self.is_transport = true;
        self
    }

    /// Set soft and hard lifetimes
    pub fn lifetimes(mut self, soft: Duration, hard: Duration) -> Self {
        self.soft_lifetime = Some(soft);
        self.hard_lifetime = Some(hard);
        self
    }

    /// Build, validating lifetimes
    pub fn build(self) -> Result<ChildSessionConfig> {
        let config = ChildSessionConfig {
            proposals: self.proposals,
            local_ts: self.local_ts.unwrap_or_else(TrafficSelectorsPayload::all_v4),
            remote_ts: self
                .remote_ts
                .unwrap_or_else(TrafficSelectorsPayload::all_v4),
            is_transport: self.is_transport,
            soft_lifetime: self
                .soft_lifetime
                .unwrap_or(Duration::from_secs(DEFAULT_SOFT_LIFETIME_SECS as u64)),
            hard_lifetime: self
                .hard_lifetime
                .unwrap_or(Duration::from_secs(DEFAULT_HARD_LIFETIME_SECS as u64)),
        };
        config.validate()?;
        Ok(config)
    }
}
