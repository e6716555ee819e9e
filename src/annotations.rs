//! Persisted annotation formats
//!
//! Per-node address state is carried as JSON annotations on the node
//! object. These types define the wire form exactly; the cached serialized
//! strings held next to them in [`crate::state`] are compared byte-for-byte
//! to decide whether a node needs rewriting.

use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ipam::IpRange;

/// Annotation carrying the node's owned pod address ranges.
pub const POD_NETWORK_RANGE_ANNOTATION: &str = "podnet.io/pod-network-ranges";

/// Annotation carrying the node's service endpoint (MAC + IPs).
pub const SERVICE_EP_ANNOTATION: &str = "podnet.io/service-endpoint";

// =============================================================================
// Pod network ranges
// =============================================================================

/// Address ranges owned by a node, per family.
///
/// Serialized as `{"V4":[{"start":"..","end":".."}],"V6":null}`. A family
/// with no ranges is `null`, not an empty list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetIps {
    #[serde(rename = "V4", default)]
    pub v4: Option<Vec<IpRange<Ipv4Addr>>>,
    #[serde(rename = "V6", default)]
    pub v6: Option<Vec<IpRange<Ipv6Addr>>>,
}

impl NetIps {
    /// Ranges for the v4 family, empty slice when unset.
    pub fn v4_ranges(&self) -> &[IpRange<Ipv4Addr>] {
        self.v4.as_deref().unwrap_or(&[])
    }

    /// Ranges for the v6 family, empty slice when unset.
    pub fn v6_ranges(&self) -> &[IpRange<Ipv6Addr>] {
        self.v6.as_deref().unwrap_or(&[])
    }

    /// Store a family's ranges, mapping an empty set back to `None`.
    pub fn set_v4(&mut self, ranges: Vec<IpRange<Ipv4Addr>>) {
        self.v4 = if ranges.is_empty() { None } else { Some(ranges) };
    }

    pub fn set_v6(&mut self, ranges: Vec<IpRange<Ipv6Addr>>) {
        self.v6 = if ranges.is_empty() { None } else { Some(ranges) };
    }
}

// =============================================================================
// Service endpoint
// =============================================================================

/// A node's externally reachable service endpoint.
///
/// Serialized as `{"Mac":"xx:xx:xx:xx:xx:xx","Ipv4":"a.b.c.d","Ipv6":null}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    #[serde(rename = "Mac", default)]
    pub mac: String,
    #[serde(rename = "Ipv4", default)]
    pub ipv4: Option<Ipv4Addr>,
    #[serde(rename = "Ipv6", default)]
    pub ipv6: Option<Ipv6Addr>,
}

// =============================================================================
// MAC helpers
// =============================================================================

/// Parse a `xx:xx:xx:xx:xx:xx` hardware address.
pub fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut parts = s.split(':');
    for byte in out.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

/// Generate a random locally-administered, unicast hardware address.
///
/// The local bit of the first octet is forced on and the multicast bit
/// forced off, so generated addresses never collide with vendor-assigned
/// or group addresses.
pub fn generate_mac() -> String {
    let bytes = *Uuid::new_v4().as_bytes();
    let mut mac = [bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]];
    mac[0] = (mac[0] & 0xfe) | 0x02;
    format_mac(&mac)
}

fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_ips_wire_format() {
        let mut ips = NetIps::default();
        ips.set_v4(vec![IpRange::new(
            "10.0.0.0".parse().unwrap(),
            "10.0.0.3".parse().unwrap(),
        )]);
        let raw = serde_json::to_string(&ips).unwrap();
        assert_eq!(
            raw,
            r#"{"V4":[{"start":"10.0.0.0","end":"10.0.0.3"}],"V6":null}"#
        );

        let parsed: NetIps = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, ips);
    }

    #[test]
    fn test_net_ips_empty_family_is_null() {
        let mut ips = NetIps::default();
        ips.set_v4(vec![]);
        assert_eq!(serde_json::to_string(&ips).unwrap(), r#"{"V4":null,"V6":null}"#);
    }

    #[test]
    fn test_service_endpoint_wire_format() {
        let ep = ServiceEndpoint {
            mac: "02:11:22:33:44:55".to_string(),
            ipv4: Some("10.1.0.5".parse().unwrap()),
            ipv6: None,
        };
        let raw = serde_json::to_string(&ep).unwrap();
        assert_eq!(
            raw,
            r#"{"Mac":"02:11:22:33:44:55","Ipv4":"10.1.0.5","Ipv6":null}"#
        );
        assert_eq!(serde_json::from_str::<ServiceEndpoint>(&raw).unwrap(), ep);
    }

    #[test]
    fn test_service_endpoint_missing_fields_default() {
        let ep: ServiceEndpoint = serde_json::from_str("{}").unwrap();
        assert_eq!(ep, ServiceEndpoint::default());
    }

    #[test]
    fn test_parse_mac() {
        assert_eq!(
            parse_mac("02:11:22:33:44:55"),
            Some([0x02, 0x11, 0x22, 0x33, 0x44, 0x55])
        );
        assert_eq!(parse_mac(""), None);
        assert_eq!(parse_mac("02:11:22:33:44"), None);
        assert_eq!(parse_mac("02:11:22:33:44:55:66"), None);
        assert_eq!(parse_mac("zz:11:22:33:44:55"), None);
    }

    #[test]
    fn test_generate_mac_is_local_unicast() {
        for _ in 0..32 {
            let mac = generate_mac();
            let bytes = parse_mac(&mac).expect("generated MAC must parse");
            assert_eq!(bytes[0] & 0x02, 0x02, "local bit must be set: {}", mac);
            assert_eq!(bytes[0] & 0x01, 0x00, "multicast bit must be clear: {}", mac);
        }
    }
}
