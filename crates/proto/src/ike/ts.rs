//! Traffic Selector payloads (RFC 7296 Section 3.13)
//!
//! Traffic selectors scope which flows a Child SA protects. The core
//! supports IPv4 address-range selectors (TS_IPV4_ADDR_RANGE); a response
//! is accepted only when its selectors narrow the ones we offered.

use super::{IkeError, Result};
use std::net::Ipv4Addr;

/// TS_IPV4_ADDR_RANGE selector type
pub const TS_TYPE_IPV4_ADDR_RANGE: u8 = 7;

/// Encoded size of one IPv4 selector
const IPV4_SELECTOR_LEN: usize = 16;

/// One traffic selector: an address range, port range and IP protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficSelector {
    /// IP protocol id (0 = any)
    pub ip_protocol: u8,
    /// First port of the range
    pub start_port: u16,
    /// Last port of the range
    pub end_port: u16,
    /// First address of the range
    pub start_addr: Ipv4Addr,
    /// Last address of the range
    pub end_addr: Ipv4Addr,
}

impl TrafficSelector {
    /// Selector matching all IPv4 traffic on all ports.
    pub fn all_v4() -> Self {
        TrafficSelector {
            ip_protocol: 0,
            start_port: 0,
            end_port: 65535,
            start_addr: Ipv4Addr::new(0, 0, 0, 0),
            end_addr: Ipv4Addr::new(255, 255, 255, 255),
        }
    }

    /// Whether `other` describes a sub-range of this selector.
    pub fn contains(&self, other: &TrafficSelector) -> bool {
        let protocol_ok = self.ip_protocol == 0 || self.ip_protocol == other.ip_protocol;
        protocol_ok
            && self.start_port <= other.start_port
            && other.end_port <= self.end_port
            && u32::from(self.start_addr) <= u32::from(other.start_addr)
            && u32::from(other.end_addr) <= u32::from(self.end_addr)
    }

    fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.push(TS_TYPE_IPV4_ADDR_RANGE);
        buf.push(self.ip_protocol);
        buf.extend_from_slice(&(IPV4_SELECTOR_LEN as u16).to_be_bytes());
        buf.extend_from_slice(&self.start_port.to_be_bytes());
        buf.extend_from_slice(&self.end_port.to_be_bytes());
        buf.extend_from_slice(&self.start_addr.octets());
        buf.extend_from_slice(&self.end_addr.octets());
    }

    fn decode(data: &[u8]) -> Result<(TrafficSelector, usize)> {
        if data.len() < 4 {
            return Err(IkeError::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }

        let ts_type = data[0];
        if ts_type != TS_TYPE_IPV4_ADDR_RANGE {
            return Err(IkeError::InvalidSyntax(format!(
                "unsupported traffic selector type: {}",
                ts_type
            )));
        }

        let length = u16::from_be_bytes([data[2], data[3]]) as usize;
        if length != IPV4_SELECTOR_LEN || data.len() < length {
            return Err(IkeError::InvalidSyntax(format!(
                "bad IPv4 selector length: {}",
                length
            )));
        }

        let start_port = u16::from_be_bytes([data[4], data[5]]);
        let end_port = u16::from_be_bytes([data[6], data[7]]);
        let start_addr = Ipv4Addr::new(data[8], data[9], data[10], data[11]);
        let end_addr = Ipv4Addr::new(data[12], data[13], data[14], data[15]);

        if start_port > end_port || u32::from(start_addr) > u32::from(end_addr) {
            return Err(IkeError::InvalidSyntax("inverted selector range".into()));
        }

        Ok((
            TrafficSelector {
                ip_protocol: data[1],
                start_port,
                end_port,
                start_addr,
                end_addr,
            },
            length,
        ))
    }
}

/// Body of a TSi/TSr payload: one or more selectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficSelectorsPayload {
    /// Selector list (at least one)
    pub selectors: Vec<TrafficSelector>,
}

impl TrafficSelectorsPayload {
    /// Payload containing the default all-IPv4 selector.
    pub fn all_v4() -> Self {
        TrafficSelectorsPayload {
            selectors: vec![TrafficSelector::all_v4()],
        }
    }

    /// Whether every selector here fits inside some selector of `wider`.
    pub fn is_subset_of(&self, wider: &TrafficSelectorsPayload) -> bool {
        !self.selectors.is_empty()
            && self.selectors.iter().all(|narrow| {
                wider.selectors.iter().any(|wide| wide.contains(narrow))
            })
    }

    /// Serialize to payload body bytes.
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.selectors.len() * IPV4_SELECTOR_LEN);
        buf.push(self.selectors.len() as u8);
        buf.extend_from_slice(&[0u8; 3]); // Reserved
        for selector in &self.selectors {
            selector.encode_to(&mut buf);
        }
        buf
    }

    /// Parse from payload body bytes.
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(IkeError::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }

        let count = data[0] as usize;
        if count == 0 {
            return Err(IkeError::InvalidSyntax("TS payload with no selectors".into()));
        }

        let mut selectors = Vec::with_capacity(count);
        let mut offset = 4;
        for _ in 0..count {
            let (selector, consumed) = TrafficSelector::decode(&data[offset..])?;
            selectors.push(selector);
            offset += consumed;
        }

        if offset != data.len() {
            return Err(IkeError::InvalidSyntax(
                "selector list does not fill TS payload".into(),
            ));
        }

        Ok(TrafficSelectorsPayload { selectors })
    }
}
