//! Shared in-memory state for node reconciliation
//!
//! [`ClusterState`] owns every piece of mutable state the engine touches:
//! the global pod free pools, the service endpoint free pools, the
//! configured-address-space snapshot, and both per-node caches. It is an
//! explicit dependency passed by shared reference, guarded by one
//! `parking_lot::Mutex`. Coarse locking is intentional: allocation across
//! nodes must serialize against a single shared free pool.
//!
//! Every method takes `&mut self`, so holding the global lock is enforced
//! by the borrow rather than by convention. The lock is only ever held
//! across in-memory work; persistence happens outside it.

use std::collections::{HashMap, HashSet};

use tracing::{debug, error};

use crate::annotations::{NetIps, ServiceEndpoint};
use crate::config::NetConfig;
use crate::error::{Error, Result};
use crate::ipam::{IpPool, IpRange, PoolPair};

// =============================================================================
// Per-node records
// =============================================================================

/// Per-node pod network state: the ranges the node currently owns, the pod
/// keys scheduled on it, and the cached serialized annotation used to
/// detect drift against the persisted form.
#[derive(Debug, Clone, Default)]
pub struct NodePodNet {
    pub pod_net_ips: NetIps,
    pub pod_net_annotation: String,
    pub pods: HashSet<String>,
}

impl NodePodNet {
    fn recompute_annotation(&mut self) {
        match serde_json::to_string(&self.pod_net_ips) {
            Ok(raw) => self.pod_net_annotation = raw,
            Err(e) => error!(error = %e, "could not serialize pod network annotation"),
        }
    }
}

/// Per-node service endpoint state plus its cached serialized form.
#[derive(Debug, Clone)]
pub struct NodeServiceMeta {
    pub endpoint: ServiceEndpoint,
    pub annotation: String,
}

// =============================================================================
// ClusterState
// =============================================================================

/// All mutable controller state, protected by a single external lock.
#[derive(Debug)]
pub struct ClusterState {
    /// Administrator-declared pod address space snapshot.
    configured_pod_network: PoolPair,

    /// Global free pool for pod addressing.
    pub pod_network_ips: PoolPair,

    /// Free pool for node service endpoint addresses.
    pub node_service_ips: PoolPair,

    node_pod_net_cache: HashMap<String, NodePodNet>,
    node_service_meta_cache: HashMap<String, NodeServiceMeta>,

    chunk_size: u64,
}

impl ClusterState {
    /// Build state from configuration: the free pools start out covering
    /// the full configured spaces.
    pub fn new(config: &NetConfig) -> Self {
        let configured = PoolPair::new(
            IpPool::from_ranges(config.pod_ranges_v4()),
            IpPool::from_ranges(config.pod_ranges_v6()),
        );
        Self {
            pod_network_ips: configured.clone(),
            configured_pod_network: configured,
            node_service_ips: PoolPair::new(
                IpPool::from_ranges(config.service_ranges_v4()),
                IpPool::from_ranges(config.service_ranges_v6()),
            ),
            node_pod_net_cache: HashMap::new(),
            node_service_meta_cache: HashMap::new(),
            chunk_size: config.pod_ip_pool_chunk_size,
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn configured_pod_network(&self) -> &PoolPair {
        &self.configured_pod_network
    }

    /// Replace the configured pod address space and rebuild the global free
    /// pool as the new space minus every node's owned ranges. Each node's
    /// cached annotation string is invalidated so its next event re-merges
    /// (and clips) its owned ranges against the new space.
    pub fn set_configured_pod_network(
        &mut self,
        v4: Vec<IpRange<std::net::Ipv4Addr>>,
        v6: Vec<IpRange<std::net::Ipv6Addr>>,
    ) {
        self.configured_pod_network = PoolPair::new(IpPool::from_ranges(v4), IpPool::from_ranges(v6));
        let mut free = self.configured_pod_network.clone();
        for podnet in self.node_pod_net_cache.values_mut() {
            free.v4.remove_ranges(podnet.pod_net_ips.v4_ranges());
            free.v6.remove_ranges(podnet.pod_net_ips.v6_ranges());
            podnet.pod_net_annotation.clear();
        }
        self.pod_network_ips = free;
    }

    // =========================================================================
    // Per-node cache access
    // =========================================================================

    pub fn node_pod_net(&self, name: &str) -> Option<&NodePodNet> {
        self.node_pod_net_cache.get(name)
    }

    pub fn node_names(&self) -> impl Iterator<Item = &String> {
        self.node_pod_net_cache.keys()
    }

    /// Create the node's pod network record if absent (first observation).
    pub fn ensure_node_pod_net(&mut self, name: &str) {
        self.node_pod_net_cache.entry(name.to_string()).or_default();
    }

    pub fn service_meta(&self, name: &str) -> Option<&NodeServiceMeta> {
        self.node_service_meta_cache.get(name)
    }

    pub fn insert_service_meta(&mut self, name: &str, endpoint: ServiceEndpoint, annotation: String) {
        self.node_service_meta_cache.insert(
            name.to_string(),
            NodeServiceMeta {
                endpoint,
                annotation,
            },
        );
    }

    // =========================================================================
    // Service endpoint assignment
    // =========================================================================

    /// Fill in a service endpoint so it is usable: generate a MAC when the
    /// recorded one does not parse, and per family either re-claim the
    /// recorded address out of the free pool or allocate a fresh one. A
    /// family whose pool is exhausted is left unset. Fails only when both
    /// families end up unset.
    pub fn create_service_endpoint(&mut self, ep: &mut ServiceEndpoint) -> Result<()> {
        if crate::annotations::parse_mac(&ep.mac).is_none() {
            ep.mac = crate::annotations::generate_mac();
        }

        // A recorded address still present in the free pool was never truly
        // reserved; removing it here reserves it. Otherwise allocate fresh.
        match ep.ipv4 {
            Some(ip) if self.node_service_ips.v4.remove_ip(ip) => {}
            _ => ep.ipv4 = self.node_service_ips.v4.get_ip().ok(),
        }
        match ep.ipv6 {
            Some(ip) if self.node_service_ips.v6.remove_ip(ip) => {}
            _ => ep.ipv6 = self.node_service_ips.v6.get_ip().ok(),
        }

        if ep.ipv4.is_none() && ep.ipv6.is_none() {
            return Err(Error::NoServiceEndpointAddress);
        }
        Ok(())
    }

    /// Return a deleted node's service endpoint addresses to the free pool
    /// and drop its cache entry. Idempotent: a second delete for the same
    /// node finds no entry and releases nothing.
    pub fn release_service_endpoint(&mut self, name: &str) {
        if let Some(meta) = self.node_service_meta_cache.remove(name) {
            if let Some(ip) = meta.endpoint.ipv4 {
                self.node_service_ips.v4.add_ip(ip);
            }
            if let Some(ip) = meta.endpoint.ipv6 {
                self.node_service_ips.v6.add_ip(ip);
            }
        }
    }

    // =========================================================================
    // Pod network merge and sizing
    // =========================================================================

    /// Merge ranges parsed from the persisted annotation into the node's
    /// owned set: union with what is already owned, clip to the configured
    /// address space, and claim the persisted ranges out of the global free
    /// pool. Level-triggered: safe under repeated or stale deliveries.
    pub fn merge_pod_net(&mut self, name: &str, persisted: &NetIps) {
        let owned = self
            .node_pod_net_cache
            .get(name)
            .map(|p| p.pod_net_ips.clone())
            .unwrap_or_default();

        let mut v4 = IpPool::from_ranges(owned.v4_ranges().to_vec());
        v4.add_ranges(persisted.v4_ranges());
        let v4 = v4.intersect(&self.configured_pod_network.v4);
        self.pod_network_ips.v4.remove_ranges(persisted.v4_ranges());

        let mut v6 = IpPool::from_ranges(owned.v6_ranges().to_vec());
        v6.add_ranges(persisted.v6_ranges());
        let v6 = v6.intersect(&self.configured_pod_network.v6);
        self.pod_network_ips.v6.remove_ranges(persisted.v6_ranges());

        let podnet = self.node_pod_net_cache.entry(name.to_string()).or_default();
        podnet.pod_net_ips.set_v4(v4.into_ranges());
        podnet.pod_net_ips.set_v6(v6.into_ranges());
        podnet.recompute_annotation();
    }

    /// Capacity check: when the node's pod count is within half a chunk of
    /// its owned IPv4 capacity, grant it another chunk from the global free
    /// pool. Returns whether the owned set grew, which drives the deferred
    /// persist. Sizing is IPv4-only.
    pub fn check_node_pod_net(&mut self, name: &str) -> bool {
        let (owned_size, pods) = match self.node_pod_net_cache.get(name) {
            Some(podnet) => {
                let size: u128 = podnet.pod_net_ips.v4_ranges().iter().map(IpRange::size).sum();
                (size, podnet.pods.len())
            }
            None => return false,
        };

        let threshold = owned_size as i128 - (self.chunk_size / 2) as i128;
        if pods as i128 <= threshold {
            return false;
        }

        match self.pod_network_ips.v4.get_ip_chunk(self.chunk_size as u128) {
            Ok(ranges) => {
                debug!(node = name, ?ranges, "granting pod address chunk");
                let podnet = self.node_pod_net_cache.entry(name.to_string()).or_default();
                let mut owned = IpPool::from_ranges(podnet.pod_net_ips.v4_ranges().to_vec());
                owned.add_ranges(&ranges);
                podnet.pod_net_ips.set_v4(owned.into_ranges());
                podnet.recompute_annotation();
                true
            }
            Err(e) => {
                error!(node = name, error = %e, "could not allocate IPv4 address chunk");
                false
            }
        }
    }

    /// Record a pod scheduled to a node and re-run the capacity check.
    /// Returns whether the node's owned ranges grew.
    pub fn add_pod_to_node(&mut self, nodename: &str, key: &str) -> bool {
        let podnet = self.node_pod_net_cache.entry(nodename.to_string()).or_default();
        if !podnet.pods.insert(key.to_string()) {
            return false;
        }
        self.check_node_pod_net(nodename)
    }

    /// Remove a pod from a node and re-run the capacity check. Returns
    /// whether the node's owned ranges grew.
    pub fn remove_pod_from_node(&mut self, nodename: &str, key: &str) -> bool {
        match self.node_pod_net_cache.get_mut(nodename) {
            Some(podnet) => {
                podnet.pods.remove(key);
                self.check_node_pod_net(nodename)
            }
            None => false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    use assert_matches::assert_matches;

    fn test_config() -> NetConfig {
        serde_yaml::from_str(
            r#"
pod_subnets: [10.0.0.0/28]
service_subnets: [10.1.0.0/30]
service_subnets_v6: ["fd00::/126"]
pod_ip_pool_chunk_size: 4
"#,
        )
        .unwrap()
    }

    fn r4(start: &str, end: &str) -> IpRange<Ipv4Addr> {
        IpRange::new(start.parse().unwrap(), end.parse().unwrap())
    }

    fn r6(start: &str, end: &str) -> IpRange<Ipv6Addr> {
        IpRange::new(start.parse().unwrap(), end.parse().unwrap())
    }

    #[test]
    fn test_fresh_node_gets_initial_chunk() {
        let mut st = ClusterState::new(&test_config());
        st.ensure_node_pod_net("node-1");

        // 0 pods > 0 - chunk/2 triggers the first chunk.
        assert!(st.check_node_pod_net("node-1"));
        let podnet = st.node_pod_net("node-1").unwrap();
        assert_eq!(
            podnet.pod_net_ips.v4_ranges(),
            &[r4("10.0.0.0", "10.0.0.3")]
        );
        assert_eq!(
            podnet.pod_net_annotation,
            r#"{"V4":[{"start":"10.0.0.0","end":"10.0.0.3"}],"V6":null}"#
        );
        assert_eq!(st.pod_network_ips.v4.size(), 12);

        // Under capacity now; no further growth.
        assert!(!st.check_node_pod_net("node-1"));
    }

    #[test]
    fn test_pod_pressure_grows_owned_ranges() {
        let mut st = ClusterState::new(&test_config());
        st.ensure_node_pod_net("node-1");
        assert!(st.check_node_pod_net("node-1"));
        assert_eq!(st.pod_network_ips.v4.size(), 12);

        // 4 owned, chunk 4: growth triggers once pods > 4 - 2.
        assert!(!st.add_pod_to_node("node-1", "ns/pod-1"));
        assert!(!st.add_pod_to_node("node-1", "ns/pod-2"));
        assert!(st.add_pod_to_node("node-1", "ns/pod-3"));

        let podnet = st.node_pod_net("node-1").unwrap();
        assert_eq!(
            podnet.pod_net_ips.v4_ranges(),
            &[r4("10.0.0.0", "10.0.0.7")]
        );
        assert_eq!(st.pod_network_ips.v4.size(), 8);

        // Re-adding the same pod key is a no-op.
        assert!(!st.add_pod_to_node("node-1", "ns/pod-3"));
        assert_eq!(st.node_pod_net("node-1").unwrap().pods.len(), 3);
    }

    #[test]
    fn test_remove_pod_from_unknown_node_is_noop() {
        let mut st = ClusterState::new(&test_config());
        assert!(!st.remove_pod_from_node("ghost", "ns/pod-1"));
    }

    #[test]
    fn test_merge_claims_persisted_ranges() {
        let mut st = ClusterState::new(&test_config());
        st.ensure_node_pod_net("node-1");

        let mut persisted = NetIps::default();
        persisted.set_v4(vec![r4("10.0.0.4", "10.0.0.7")]);
        st.merge_pod_net("node-1", &persisted);

        let podnet = st.node_pod_net("node-1").unwrap();
        assert_eq!(
            podnet.pod_net_ips.v4_ranges(),
            &[r4("10.0.0.4", "10.0.0.7")]
        );
        // The persisted ranges were claimed out of the free pool.
        assert_eq!(st.pod_network_ips.v4.size(), 12);
        assert_eq!(
            st.pod_network_ips.v4.free_list(),
            &[r4("10.0.0.0", "10.0.0.3"), r4("10.0.0.8", "10.0.0.15")]
        );
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut st = ClusterState::new(&test_config());
        let mut persisted = NetIps::default();
        persisted.set_v4(vec![r4("10.0.0.4", "10.0.0.7")]);

        st.merge_pod_net("node-1", &persisted);
        let owned_once = st.node_pod_net("node-1").unwrap().pod_net_ips.clone();
        let free_once = st.pod_network_ips.v4.clone();

        st.merge_pod_net("node-1", &persisted);
        assert_eq!(st.node_pod_net("node-1").unwrap().pod_net_ips, owned_once);
        assert_eq!(st.pod_network_ips.v4, free_once);
    }

    #[test]
    fn test_merge_clips_to_configured_space() {
        let mut st = ClusterState::new(&test_config());
        // Annotation claims ranges partly outside 10.0.0.0/28.
        let mut persisted = NetIps::default();
        persisted.set_v4(vec![r4("10.0.0.12", "10.0.0.19")]);
        st.merge_pod_net("node-1", &persisted);

        assert_eq!(
            st.node_pod_net("node-1").unwrap().pod_net_ips.v4_ranges(),
            &[r4("10.0.0.12", "10.0.0.15")]
        );
        assert_eq!(st.pod_network_ips.v4.free_list(), &[r4("10.0.0.0", "10.0.0.11")]);
    }

    #[test]
    fn test_merge_v6_claims_and_clips_without_growth() {
        let config: NetConfig = serde_yaml::from_str(
            r#"
pod_subnets: [10.0.0.0/28]
pod_subnets_v6: ["fd00::/120"]
pod_ip_pool_chunk_size: 4
"#,
        )
        .unwrap();
        let mut st = ClusterState::new(&config);

        // One range inside fd00::/120, one reaching past it.
        let mut persisted = NetIps::default();
        persisted.set_v6(vec![r6("fd00::10", "fd00::1f"), r6("fd00::f0", "fd00::1ff")]);
        st.merge_pod_net("node-1", &persisted);

        let podnet = st.node_pod_net("node-1").unwrap();
        assert_eq!(
            podnet.pod_net_ips.v6_ranges(),
            &[r6("fd00::10", "fd00::1f"), r6("fd00::f0", "fd00::ff")]
        );
        // Claimed out of the v6 free pool, clipped to the configured space.
        assert_eq!(
            st.pod_network_ips.v6.free_list(),
            &[r6("fd00::", "fd00::f"), r6("fd00::20", "fd00::ef")]
        );
        assert!(podnet
            .pod_net_annotation
            .contains(r#""V6":[{"start":"fd00::10","end":"fd00::1f"}"#));

        // The sizing check grants an IPv4 chunk only; v6 stays as merged.
        assert!(st.check_node_pod_net("node-1"));
        let podnet = st.node_pod_net("node-1").unwrap();
        assert_eq!(podnet.pod_net_ips.v4_ranges(), &[r4("10.0.0.0", "10.0.0.3")]);
        assert_eq!(
            podnet.pod_net_ips.v6_ranges(),
            &[r6("fd00::10", "fd00::1f"), r6("fd00::f0", "fd00::ff")]
        );
        assert_eq!(st.pod_network_ips.v6.size(), 224);

        // Re-merging the same annotation is a no-op for v6 as well.
        let owned_once = podnet.pod_net_ips.clone();
        st.merge_pod_net("node-1", &persisted);
        assert_eq!(st.node_pod_net("node-1").unwrap().pod_net_ips.v6_ranges(), owned_once.v6_ranges());
        assert_eq!(st.pod_network_ips.v6.size(), 224);
    }

    #[test]
    fn test_configured_space_shrink_reclaims_on_next_merge() {
        let mut st = ClusterState::new(&test_config());
        st.ensure_node_pod_net("node-1");
        assert!(st.check_node_pod_net("node-1"));
        let persisted = st.node_pod_net("node-1").unwrap().pod_net_ips.clone();
        assert_eq!(persisted.v4_ranges(), &[r4("10.0.0.0", "10.0.0.3")]);

        // Admin shrinks the space to exclude the node's first two addresses.
        st.set_configured_pod_network(vec![r4("10.0.0.2", "10.0.0.15")], vec![]);
        assert_eq!(st.pod_network_ips.v4.free_list(), &[r4("10.0.0.4", "10.0.0.15")]);

        // Next merge clips the owned set down to the new space.
        st.merge_pod_net("node-1", &persisted);
        assert_eq!(
            st.node_pod_net("node-1").unwrap().pod_net_ips.v4_ranges(),
            &[r4("10.0.0.2", "10.0.0.3")]
        );
        // Invariant: owned ∪ free == configured.
        let mut accounted = st.pod_network_ips.v4.clone();
        accounted.add_ranges(st.node_pod_net("node-1").unwrap().pod_net_ips.v4_ranges());
        assert_eq!(accounted, st.configured_pod_network().v4);
    }

    #[test]
    fn test_chunk_exhaustion_leaves_node_under_provisioned() {
        let mut st = ClusterState::new(&test_config());
        // Drain the free pool.
        let drained = st.pod_network_ips.v4.get_ip_chunk(16).unwrap();
        assert_eq!(drained.len(), 1);

        st.ensure_node_pod_net("node-1");
        assert!(!st.check_node_pod_net("node-1"));
        assert!(st.node_pod_net("node-1").unwrap().pod_net_ips.v4_ranges().is_empty());
    }

    #[test]
    fn test_create_service_endpoint_assigns_mac_and_ips() {
        let mut st = ClusterState::new(&test_config());
        let mut ep = ServiceEndpoint::default();
        st.create_service_endpoint(&mut ep).unwrap();

        assert!(crate::annotations::parse_mac(&ep.mac).is_some());
        assert_eq!(ep.ipv4, Some("10.1.0.0".parse().unwrap()));
        assert_eq!(ep.ipv6, Some("fd00::".parse().unwrap()));
        assert_eq!(st.node_service_ips.v4.size(), 3);
    }

    #[test]
    fn test_create_service_endpoint_reclaims_recorded_ip() {
        let mut st = ClusterState::new(&test_config());
        let mut ep = ServiceEndpoint {
            mac: "02:aa:bb:cc:dd:ee".to_string(),
            ipv4: Some("10.1.0.2".parse().unwrap()),
            ipv6: None,
        };
        st.create_service_endpoint(&mut ep).unwrap();

        // The recorded address was honored, not replaced.
        assert_eq!(ep.ipv4, Some("10.1.0.2".parse().unwrap()));
        assert_eq!(ep.mac, "02:aa:bb:cc:dd:ee");
        assert!(!st.node_service_ips.v4.remove_ip("10.1.0.2".parse().unwrap()));
    }

    #[test]
    fn test_create_service_endpoint_replaces_unreserved_ip() {
        let mut st = ClusterState::new(&test_config());
        // Address outside the service pool: stale annotation.
        let mut ep = ServiceEndpoint {
            mac: String::new(),
            ipv4: Some("192.168.0.1".parse().unwrap()),
            ipv6: None,
        };
        st.create_service_endpoint(&mut ep).unwrap();
        assert_eq!(ep.ipv4, Some("10.1.0.0".parse().unwrap()));
    }

    #[test]
    fn test_create_service_endpoint_fails_when_both_families_unset() {
        let config: NetConfig = serde_yaml::from_str("pod_subnets: [10.0.0.0/28]").unwrap();
        let mut st = ClusterState::new(&config);
        let mut ep = ServiceEndpoint::default();
        assert_matches!(
            st.create_service_endpoint(&mut ep),
            Err(Error::NoServiceEndpointAddress)
        );
        // MAC is still assigned so a later retry keeps it stable.
        assert!(crate::annotations::parse_mac(&ep.mac).is_some());
    }

    #[test]
    fn test_release_service_endpoint_is_idempotent() {
        let mut st = ClusterState::new(&test_config());
        let mut ep = ServiceEndpoint::default();
        st.create_service_endpoint(&mut ep).unwrap();
        let v4_after_alloc = st.node_service_ips.v4.size();
        st.insert_service_meta("node-1", ep, String::new());

        st.release_service_endpoint("node-1");
        assert_eq!(st.node_service_ips.v4.size(), v4_after_alloc + 1);
        assert!(st.service_meta("node-1").is_none());

        // Second delete finds no entry; pool unchanged.
        st.release_service_endpoint("node-1");
        assert_eq!(st.node_service_ips.v4.size(), v4_after_alloc + 1);
    }
}
