//! Prometheus metrics for the node IPAM controller

use once_cell::sync::Lazy;
use prometheus::{register_int_counter, register_int_gauge, IntCounter, IntGauge};

use crate::state::ClusterState;

pub static NODE_RECONCILES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "podnet_node_reconciles_total",
        "Total node change events processed"
    )
    .unwrap()
});

pub static PERSIST_CONFLICTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "podnet_node_persist_conflicts_total",
        "Node updates dropped due to optimistic-concurrency conflicts"
    )
    .unwrap()
});

pub static PERSIST_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "podnet_node_persist_failures_total",
        "Node updates that failed for reasons other than a conflict"
    )
    .unwrap()
});

pub static POD_FREE_V4: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "podnet_pod_free_addresses_v4",
        "Unassigned IPv4 pod addresses in the global free pool"
    )
    .unwrap()
});

pub static POD_FREE_V6: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "podnet_pod_free_addresses_v6",
        "Unassigned IPv6 pod addresses in the global free pool"
    )
    .unwrap()
});

pub static SERVICE_FREE_V4: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "podnet_service_free_addresses_v4",
        "Unassigned IPv4 service endpoint addresses"
    )
    .unwrap()
});

pub static SERVICE_FREE_V6: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "podnet_service_free_addresses_v6",
        "Unassigned IPv6 service endpoint addresses"
    )
    .unwrap()
});

/// Refresh the free-pool gauges from current state. Called with the state
/// lock held, so it must stay cheap.
pub fn update_pool_gauges(state: &ClusterState) {
    POD_FREE_V4.set(saturating_i64(state.pod_network_ips.v4.size()));
    POD_FREE_V6.set(saturating_i64(state.pod_network_ips.v6.size()));
    SERVICE_FREE_V4.set(saturating_i64(state.node_service_ips.v4.size()));
    SERVICE_FREE_V6.set(saturating_i64(state.node_service_ips.v6.size()));
}

fn saturating_i64(n: u128) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturating_i64() {
        assert_eq!(saturating_i64(0), 0);
        assert_eq!(saturating_i64(42), 42);
        assert_eq!(saturating_i64(u128::MAX), i64::MAX);
    }
}
