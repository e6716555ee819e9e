//! Property-Based Tests for the Range Pool
//!
//! Uses proptest to verify the allocator's structural invariants across
//! arbitrary operation sequences.
//!
//! # Test Properties
//!
//! 1. **Canonical Form**: the free list stays sorted, disjoint, and
//!    coalesced after every mutation
//! 2. **Chunk Roundtrip**: get_ip_chunk followed by add_ranges of the same
//!    ranges restores the prior pool
//! 3. **Intersection**: content-commutative and idempotent
//! 4. **Conservation**: add/remove of the same address set is a no-op

#![cfg(test)]

use std::net::Ipv4Addr;

use proptest::prelude::*;

use super::pool::{IpPool, IpRange, PoolAddr};

// =============================================================================
// Property Strategies
// =============================================================================

/// Strategy for a single v4 range within a small window so overlaps and
/// adjacency actually occur.
fn range_strategy() -> impl Strategy<Value = IpRange<Ipv4Addr>> {
    (0u32..2048, 0u32..64).prop_map(|(start, len)| {
        let base = 0x0a00_0000u32; // 10.0.0.0
        IpRange::new(
            Ipv4Addr::from(base + start),
            Ipv4Addr::from(base + start + len),
        )
    })
}

fn ranges_strategy() -> impl Strategy<Value = Vec<IpRange<Ipv4Addr>>> {
    prop::collection::vec(range_strategy(), 0..16)
}

/// A mixed sequence of pool mutations.
#[derive(Debug, Clone)]
enum PoolOp {
    AddRange(IpRange<Ipv4Addr>),
    RemoveRange(IpRange<Ipv4Addr>),
    AddIp(Ipv4Addr),
    RemoveIp(Ipv4Addr),
    GetIp,
}

fn op_strategy() -> impl Strategy<Value = PoolOp> {
    prop_oneof![
        range_strategy().prop_map(PoolOp::AddRange),
        range_strategy().prop_map(PoolOp::RemoveRange),
        (0u32..2048).prop_map(|o| PoolOp::AddIp(Ipv4Addr::from(0x0a00_0000 + o))),
        (0u32..2048).prop_map(|o| PoolOp::RemoveIp(Ipv4Addr::from(0x0a00_0000 + o))),
        Just(PoolOp::GetIp),
    ]
}

fn assert_canonical(pool: &IpPool<Ipv4Addr>) -> std::result::Result<(), TestCaseError> {
    for r in pool.free_list() {
        prop_assert!(r.start <= r.end, "inverted range {:?}", r);
    }
    for w in pool.free_list().windows(2) {
        prop_assert!(
            w[0].end.succ().map(|s| s < w[1].start).unwrap_or(false),
            "non-canonical neighbors {:?} / {:?}",
            w[0],
            w[1]
        );
    }
    Ok(())
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Property: any sequence of mutations leaves the free list canonical.
    #[test]
    fn prop_pool_stays_canonical(ops in prop::collection::vec(op_strategy(), 0..64)) {
        let mut pool = IpPool::new();
        for op in ops {
            match op {
                PoolOp::AddRange(r) => pool.add_ranges(&[r]),
                PoolOp::RemoveRange(r) => pool.remove_ranges(&[r]),
                PoolOp::AddIp(a) => pool.add_ip(a),
                PoolOp::RemoveIp(a) => {
                    pool.remove_ip(a);
                }
                PoolOp::GetIp => {
                    let _ = pool.get_ip();
                }
            }
            assert_canonical(&pool)?;
        }
    }

    /// Property: a chunk returned to the pool restores the prior state.
    #[test]
    fn prop_chunk_roundtrip(ranges in ranges_strategy(), chunk in 1u128..64) {
        let mut pool = IpPool::from_ranges(ranges);
        let before = pool.clone();
        match pool.get_ip_chunk(chunk) {
            Ok(taken) => {
                let total: u128 = taken.iter().map(IpRange::size).sum();
                prop_assert_eq!(total, chunk);
                prop_assert_eq!(pool.size() + chunk, before.size());
                pool.add_ranges(&taken);
                prop_assert_eq!(pool, before);
            }
            Err(_) => {
                // Failure must leave the pool untouched.
                prop_assert_eq!(pool, before);
            }
        }
    }

    /// Property: intersection is content-commutative and idempotent.
    #[test]
    fn prop_intersect_commutative_idempotent(a in ranges_strategy(), b in ranges_strategy()) {
        let a = IpPool::from_ranges(a);
        let b = IpPool::from_ranges(b);
        prop_assert_eq!(a.intersect(&b), b.intersect(&a));
        prop_assert_eq!(a.intersect(&a), a.clone());
    }

    /// Property: intersection never exceeds either input.
    #[test]
    fn prop_intersect_bounded(a in ranges_strategy(), b in ranges_strategy()) {
        let a = IpPool::from_ranges(a);
        let b = IpPool::from_ranges(b);
        let i = a.intersect(&b);
        prop_assert!(i.size() <= a.size());
        prop_assert!(i.size() <= b.size());
        // Every intersected address is in both inputs.
        prop_assert_eq!(i.intersect(&a), i.clone());
        prop_assert_eq!(i.intersect(&b), i);
    }

    /// Property: removing exactly what was added returns to the start.
    #[test]
    fn prop_add_remove_conserves(base in ranges_strategy(), extra in ranges_strategy()) {
        let base_pool = IpPool::from_ranges(base);
        let mut pool = base_pool.clone();
        // Only add addresses not already present, then take them back out.
        let mut disjoint_extra = IpPool::from_ranges(extra);
        for r in base_pool.free_list() {
            disjoint_extra.remove_ranges(&[*r]);
        }
        let disjoint: Vec<_> = disjoint_extra.free_list().to_vec();
        pool.add_ranges(&disjoint);
        pool.remove_ranges(&disjoint);
        prop_assert_eq!(pool, base_pool);
    }
}
