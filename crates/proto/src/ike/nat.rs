//! NAT traversal detection (RFC 7296 Section 2.23, RFC 3948)
//!
//! Each side sends `NAT_DETECTION_SOURCE_IP` / `NAT_DETECTION_DESTINATION_IP`
//! notifies carrying `SHA1(SPIi | SPIr | IP | Port)`. A received source
//! hash that matches none of the sender's apparent addresses means the
//! peer is behind a NAT; a destination hash that does not match our own
//! address means we are.
//!
//! Once NAT is detected both sides float to port 4500 and prefix every
//! IKE datagram with the four-byte non-ESP marker.

use super::constants::NotifyType;
use super::message::NotifyPayload;
use sha1::{Digest, Sha1};
use std::net::SocketAddr;

/// NAT detection outcome for one IKE_SA_INIT exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NatDetectionResult {
    /// The local endpoint sits behind a NAT
    pub local_behind_nat: bool,

    /// The remote endpoint sits behind a NAT
    pub remote_behind_nat: bool,
}

impl NatDetectionResult {
    /// Whether UDP encapsulation (port 4500 + non-ESP marker) is needed
    pub fn needs_encapsulation(self) -> bool {
        self.local_behind_nat || self.remote_behind_nat
    }
}

/// Compute the NAT detection hash for one address.
pub fn nat_detection_hash(
    initiator_spi: &[u8; 8],
    responder_spi: &[u8; 8],
    addr: SocketAddr,
) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(initiator_spi);
    hasher.update(responder_spi);
    match addr.ip() {
        std::net::IpAddr::V4(ip) => hasher.update(ip.octets()),
        std::net::IpAddr::V6(ip) => hasher.update(ip.octets()),
    }
    hasher.update(addr.port().to_be_bytes());
    hasher.finalize().to_vec()
}

/// Build the source/destination notify pair for an outbound message.
pub fn build_nat_detection_notifies(
    initiator_spi: &[u8; 8],
    responder_spi: &[u8; 8],
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
) -> (NotifyPayload, NotifyPayload) {
    (
        NotifyPayload::with_data(
            NotifyType::NatDetectionSourceIp,
            nat_detection_hash(initiator_spi, responder_spi, local_addr),
        ),
        NotifyPayload::with_data(
            NotifyType::NatDetectionDestinationIp,
            nat_detection_hash(initiator_spi, responder_spi, remote_addr),
        ),
    )
}

/// Evaluate the peer's NAT detection notifies.
///
/// # Arguments
///
/// * `initiator_spi` / `responder_spi` - SPIs of the exchange
/// * `remote_addr` - Address the peer's message actually came from
/// * `local_addr` - Our own address as we know it
/// * `source_hashes` - Data of every received `NAT_DETECTION_SOURCE_IP`
/// * `destination_hashes` - Data of every received `NAT_DETECTION_DESTINATION_IP`
///
/// Absent notifies mean the peer does not support NAT-T; no NAT is
/// assumed in that case.
pub fn detect_nat(
    initiator_spi: &[u8; 8],
    responder_spi: &[u8; 8],
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    source_hashes: &[&[u8]],
    destination_hashes: &[&[u8]],
) -> NatDetectionResult {
    let mut result = NatDetectionResult::default();

    if !source_hashes.is_empty() {
        let expected = nat_detection_hash(initiator_spi, responder_spi, remote_addr);
        result.remote_behind_nat = !source_hashes.iter().any(|h| *h == expected.as_slice());
    }
    if !destination_hashes.is_empty() {
        let expected = nat_detection_hash(initiator_spi, responder_spi, local_addr);
        result.local_behind_nat = !destination_hashes
            .iter()
            .any(|h| *h == expected.as_slice());
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPI_I: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];
    const SPI_R: [u8; 8] = [9, 10, 11, 12, 13, 14, 15, 16];

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_hash_is_deterministic_and_keyed() {
        let a = nat_detection_hash(&SPI_I, &SPI_R, addr("192.0.2.1:500"));
        let b = nat_detection_hash(&SPI_I, &SPI_R, addr("192.0.2.1:500"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 20);

        // Different port or address changes the hash
        let c = nat_detection_hash(&SPI_I, &SPI_R, addr("192.0.2.1:4500"));
        assert_ne!(a, c);
        let d = nat_detection_hash(&SPI_I, &SPI_R, addr("192.0.2.2:500"));
        assert_ne!(a, d);
    }

    #[test]
    fn test_no_nat_detected() {
        let remote = addr("192.0.2.100:500");
        let local = addr("192.0.2.200:500");
        let source = nat_detection_hash(&SPI_I, &SPI_R, remote);
        let dest = nat_detection_hash(&SPI_I, &SPI_R, local);

        let result = detect_nat(
            &SPI_I,
            &SPI_R,
            remote,
            local,
            &[&source],
            &[&dest],
        );
        assert!(!result.local_behind_nat);
        assert!(!result.remote_behind_nat);
        assert!(!result.needs_encapsulation());
    }

    #[test]
    fn test_remote_nat_detected() {
        let remote = addr("192.0.2.100:500");
        let local = addr("192.0.2.200:500");
        // Peer computed its hash over its private address
        let source = nat_detection_hash(&SPI_I, &SPI_R, addr("10.0.0.1:500"));
        let dest = nat_detection_hash(&SPI_I, &SPI_R, local);

        let result = detect_nat(&SPI_I, &SPI_R, remote, local, &[&source], &[&dest]);
        assert!(result.remote_behind_nat);
        assert!(!result.local_behind_nat);
        assert!(result.needs_encapsulation());
    }

    #[test]
    fn test_local_nat_detected() {
        let remote = addr("192.0.2.100:500");
        let local = addr("10.0.0.2:500");
        let source = nat_detection_hash(&SPI_I, &SPI_R, remote);
        // Peer saw our NAT'd public address
        let dest = nat_detection_hash(&SPI_I, &SPI_R, addr("203.0.113.7:4500"));

        let result = detect_nat(&SPI_I, &SPI_R, remote, local, &[&source], &[&dest]);
        assert!(result.local_behind_nat);
        assert!(!result.remote_behind_nat);
    }

    #[test]
    fn test_multiple_source_hashes_any_match() {
        let remote = addr("192.0.2.100:500");
        let local = addr("192.0.2.200:500");
        let wrong = nat_detection_hash(&SPI_I, &SPI_R, addr("10.9.9.9:500"));
        let right = nat_detection_hash(&SPI_I, &SPI_R, remote);

        let result = detect_nat(
            &SPI_I,
            &SPI_R,
            remote,
            local,
            &[&wrong, &right],
            &[],
        );
        assert!(!result.remote_behind_nat);
    }

    #[test]
    fn test_absent_notifies_mean_no_nat() {
        let result = detect_nat(
            &SPI_I,
            &SPI_R,
            addr("192.0.2.100:500"),
            addr("192.0.2.200:500"),
            &[],
            &[],
        );
        assert!(!result.needs_encapsulation());
    }

    #[test]
    fn test_notify_pair_builder() {
        let (source, dest) = build_nat_detection_notifies(
            &SPI_I,
            &SPI_R,
            addr("192.0.2.200:500"),
            addr("192.0.2.100:500"),
        );
        assert_eq!(source.typed(), Some(NotifyType::NatDetectionSourceIp));
        assert_eq!(dest.typed(), Some(NotifyType::NatDetectionDestinationIp));
        assert_eq!(source.data.len(), 20);
        assert_ne!(source.data, dest.data);
    }
}
