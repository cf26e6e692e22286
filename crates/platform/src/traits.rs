//! Collaborator traits for the Krait IPsec stack
//!
//! The protocol core never touches the kernel, the cellular modem or user
//! threads directly. Everything platform-specific is reached through the
//! traits in this module, so the core stays testable with in-memory fakes.

use crate::KraitResult;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Direction of an IPsec transform relative to this endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformDirection {
    /// Transform applied to traffic received from the peer
    Inbound,
    /// Transform applied to traffic sent to the peer
    Outbound,
}

/// An allocated Child SA SPI.
///
/// Allocation reserves kernel state; dropping the handle is the only legal
/// release path. The release hook is invoked exactly once.
pub struct OwnedSpi {
    spi: u32,
    releaser: Option<Box<dyn FnOnce(u32) + Send>>,
}

impl OwnedSpi {
    /// Create an owned SPI with a release hook.
    pub fn new(spi: u32, releaser: Box<dyn FnOnce(u32) + Send>) -> Self {
        OwnedSpi {
            spi,
            releaser: Some(releaser),
        }
    }

    /// Create an owned SPI without kernel backing (tests, provisional state).
    pub fn unmanaged(spi: u32) -> Self {
        OwnedSpi {
            spi,
            releaser: None,
        }
    }

    /// The raw 4-byte SPI value.
    pub fn spi(&self) -> u32 {
        self.spi
    }
}

impl Drop for OwnedSpi {
    fn drop(&mut self) {
        if let Some(release) = self.releaser.take() {
            release(self.spi);
        }
    }
}

impl fmt::Debug for OwnedSpi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedSpi").field("spi", &self.spi).finish()
    }
}

/// An installed IPsec transform.
///
/// Dropping the handle releases the kernel transform. Key material passed
/// at installation is owned by the platform after `install_transform`
/// returns; the core zeroizes its own copies.
pub struct OwnedTransform {
    id: u64,
    direction: TransformDirection,
    releaser: Option<Box<dyn FnOnce(u64) + Send>>,
}

impl OwnedTransform {
    /// Create an owned transform with a release hook.
    pub fn new(id: u64, direction: TransformDirection, releaser: Box<dyn FnOnce(u64) + Send>) -> Self {
        OwnedTransform {
            id,
            direction,
            releaser: Some(releaser),
        }
    }

    /// Create an owned transform without kernel backing (tests).
    pub fn unmanaged(id: u64, direction: TransformDirection) -> Self {
        OwnedTransform {
            id,
            direction,
            releaser: None,
        }
    }

    /// Opaque platform identifier of the installed transform.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Direction this transform was installed for.
    pub fn direction(&self) -> TransformDirection {
        self.direction
    }
}

impl Drop for OwnedTransform {
    fn drop(&mut self) {
        if let Some(release) = self.releaser.take() {
            release(self.id);
        }
    }
}

impl fmt::Debug for OwnedTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedTransform")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .finish()
    }
}

/// Parameters for installing a single IPsec transform.
///
/// Algorithm identifiers are IANA IKEv2 transform ids; the platform maps
/// them onto its own cipher suite names.
pub struct TransformRequest<'a> {
    /// Direction of the transform
    pub direction: TransformDirection,
    /// Child SA SPI the transform is keyed under
    pub spi: u32,
    /// Remote tunnel address
    pub remote_addr: IpAddr,
    /// Encryption algorithm (IANA ENCR transform id)
    pub encryption_algo: u16,
    /// Encryption key
    pub encryption_key: &'a [u8],
    /// Integrity algorithm (IANA INTEG transform id, 0 for AEAD)
    pub integrity_algo: u16,
    /// Integrity key (empty for AEAD)
    pub integrity_key: &'a [u8],
    /// Transport mode instead of tunnel mode
    pub is_transport: bool,
    /// UDP-encapsulation socket identifier when NAT-T is active
    pub encap_socket: Option<u32>,
}

/// Kernel IPsec transform installation facility.
pub trait IpsecTransformInstaller: Send + Sync {
    /// Reserve an inbound SPI for a new Child SA.
    fn allocate_spi(&self, remote_addr: IpAddr) -> KraitResult<OwnedSpi>;

    /// Install a transform for one direction of a Child SA.
    fn install_transform(&self, request: TransformRequest<'_>) -> KraitResult<OwnedTransform>;
}

/// Type of SIM application used for EAP credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimAppType {
    /// GSM SIM application (EAP-SIM)
    Sim,
    /// UMTS USIM application (EAP-AKA, EAP-AKA')
    Usim,
}

/// Challenge handed to the SIM for authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimChallenge<'a> {
    /// GSM RAND (EAP-SIM)
    Gsm {
        /// 16-byte RAND
        rand: &'a [u8; 16],
    },
    /// UMTS RAND + AUTN (EAP-AKA, EAP-AKA')
    Umts {
        /// 16-byte RAND
        rand: &'a [u8; 16],
        /// 16-byte AUTN
        autn: &'a [u8; 16],
    },
}

/// Result of a SIM authentication round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimAuthResponse {
    /// GSM triplet result
    Gsm {
        /// 4-byte signed response
        sres: [u8; 4],
        /// 8-byte cipher key
        kc: [u8; 8],
    },
    /// Successful UMTS authentication
    Umts {
        /// RES (4..=16 bytes)
        res: Vec<u8>,
        /// Cipher key
        ck: [u8; 16],
        /// Integrity key
        ik: [u8; 16],
    },
    /// UMTS sequence-number resynchronization
    UmtsSyncFailure {
        /// 14-byte AUTS token
        auts: [u8; 14],
    },
}

/// Cellular SIM access for EAP-SIM/AKA identity and authentication vectors.
pub trait SimAuthProvider: Send + Sync {
    /// Permanent identity for the given application (IMSI-derived NAI bytes).
    fn identity(&self, app_type: SimAppType) -> KraitResult<Vec<u8>>;

    /// Run one authentication round on the SIM.
    fn authenticate(
        &self,
        app_type: SimAppType,
        challenge: SimChallenge<'_>,
    ) -> KraitResult<SimAuthResponse>;
}

/// Raw datagram transport (UDP 500 / 4500).
///
/// Inbound datagrams are delivered to the owning session's event loop by
/// the transport implementation; this trait only covers the send side.
#[async_trait::async_trait]
pub trait DatagramSocket: Send + Sync {
    /// Send one datagram to the peer.
    async fn send(&self, addr: SocketAddr, data: &[u8]) -> KraitResult<()>;
}

/// Monotonic time source.
///
/// All protocol timers (retransmission backoff, rekey lifetimes,
/// watchdogs) read this clock so tests can drive time.
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary fixed origin.
    fn now_millis(&self) -> u64;
}

/// `Clock` backed by `std::time::Instant`.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: std::time::Instant,
}

impl MonotonicClock {
    /// Create a clock anchored at construction time.
    pub fn new() -> Self {
        MonotonicClock {
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Executor for user callbacks.
///
/// Client code never runs on the protocol loop; every user-visible
/// callback is posted through this trait.
pub trait CallbackExecutor: Send + Sync {
    /// Run the job on a user thread.
    fn execute(&self, job: Box<dyn FnOnce() + Send>);
}

/// `CallbackExecutor` that runs jobs inline on the calling thread.
///
/// Intended for tests; production clients supply their own executor.
#[derive(Debug, Default)]
pub struct InlineExecutor;

impl CallbackExecutor for InlineExecutor {
    fn execute(&self, job: Box<dyn FnOnce() + Send>) {
        job();
    }
}
