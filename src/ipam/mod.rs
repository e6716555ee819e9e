//! IP address pool management
//!
//! Range-based free-list allocation for pod networking and node service
//! endpoints. Pools are kept per address family; [`PoolPair`] bundles the
//! v4 and v6 pools for one scope (global pod space, service space, or the
//! configured snapshot).

mod pool;
#[cfg(test)]
mod proptest;

pub use pool::{IpPool, IpRange, Ipv4Pool, Ipv6Pool, PoolAddr};

/// The v4 and v6 pools for one allocation scope.
#[derive(Debug, Clone, Default)]
pub struct PoolPair {
    pub v4: Ipv4Pool,
    pub v6: Ipv6Pool,
}

impl PoolPair {
    pub fn new(v4: Ipv4Pool, v6: Ipv6Pool) -> Self {
        Self { v4, v6 }
    }
}
