//! Controller configuration
//!
//! The configured address space is administrator-declared and consumed by
//! the controller, never mutated by it. CIDRs expand into the inclusive
//! ranges seeded into the free pools at startup.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;

use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ipam::IpRange;

fn default_chunk_size() -> u64 {
    32
}

/// Network configuration for the node IPAM controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetConfig {
    /// Supernets eligible for IPv4 pod addressing.
    #[serde(default)]
    pub pod_subnets: Vec<Ipv4Net>,

    /// Supernets eligible for IPv6 pod addressing.
    #[serde(default)]
    pub pod_subnets_v6: Vec<Ipv6Net>,

    /// Subnets for per-node IPv4 service endpoints.
    #[serde(default)]
    pub service_subnets: Vec<Ipv4Net>,

    /// Subnets for per-node IPv6 service endpoints.
    #[serde(default)]
    pub service_subnets_v6: Vec<Ipv6Net>,

    /// Number of pod addresses granted to a node per allocation. Larger
    /// chunks mean fewer annotation writes under pod churn.
    #[serde(default = "default_chunk_size")]
    pub pod_ip_pool_chunk_size: u64,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            pod_subnets: Vec::new(),
            pod_subnets_v6: Vec::new(),
            service_subnets: Vec::new(),
            service_subnets_v6: Vec::new(),
            pod_ip_pool_chunk_size: default_chunk_size(),
        }
    }
}

impl NetConfig {
    /// Load and validate configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: NetConfig =
            serde_yaml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pod_subnets.is_empty() && self.pod_subnets_v6.is_empty() {
            return Err(Error::Config(
                "at least one pod subnet must be configured".to_string(),
            ));
        }
        if self.pod_ip_pool_chunk_size == 0 {
            return Err(Error::Config(
                "pod_ip_pool_chunk_size must be nonzero".to_string(),
            ));
        }
        Ok(())
    }

    /// Configured IPv4 pod address space as inclusive ranges.
    pub fn pod_ranges_v4(&self) -> Vec<IpRange<Ipv4Addr>> {
        self.pod_subnets.iter().map(v4_net_range).collect()
    }

    /// Configured IPv6 pod address space as inclusive ranges.
    pub fn pod_ranges_v6(&self) -> Vec<IpRange<Ipv6Addr>> {
        self.pod_subnets_v6.iter().map(v6_net_range).collect()
    }

    /// Configured IPv4 service endpoint space as inclusive ranges.
    pub fn service_ranges_v4(&self) -> Vec<IpRange<Ipv4Addr>> {
        self.service_subnets.iter().map(v4_net_range).collect()
    }

    /// Configured IPv6 service endpoint space as inclusive ranges.
    pub fn service_ranges_v6(&self) -> Vec<IpRange<Ipv6Addr>> {
        self.service_subnets_v6.iter().map(v6_net_range).collect()
    }
}

fn v4_net_range(net: &Ipv4Net) -> IpRange<Ipv4Addr> {
    IpRange::new(net.network(), net.broadcast())
}

fn v6_net_range(net: &Ipv6Net) -> IpRange<Ipv6Addr> {
    IpRange::new(net.network(), net.broadcast())
}

// =============================================================================
// Tests
// =============================================================================
