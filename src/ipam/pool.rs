//! Range-based IP address pool.
//!
//! An [`IpPool`] holds the currently-unassigned addresses of one address
//! family as a sorted list of disjoint inclusive ranges. Every operation
//! leaves the free list in canonical form: sorted, non-overlapping, with
//! adjacent ranges coalesced.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Address family abstraction
// =============================================================================

/// An address type usable in a range pool.
///
/// Implemented for [`Ipv4Addr`] and [`Ipv6Addr`]. Ranges are inclusive, so
/// successor/predecessor are fallible at the ends of the address space.
pub trait PoolAddr: Copy + Ord + fmt::Display + fmt::Debug {
    /// The next address, or `None` at the top of the address space.
    fn succ(self) -> Option<Self>;

    /// The previous address, or `None` at the bottom of the address space.
    fn pred(self) -> Option<Self>;

    /// The address `n` steps above `self`, or `None` on overflow.
    fn checked_add(self, n: u128) -> Option<Self>;

    /// Number of addresses in the inclusive interval `[start, end]`.
    fn span(start: Self, end: Self) -> u128;
}

impl PoolAddr for Ipv4Addr {
    fn succ(self) -> Option<Self> {
        u32::from(self).checked_add(1).map(Ipv4Addr::from)
    }

    fn pred(self) -> Option<Self> {
        u32::from(self).checked_sub(1).map(Ipv4Addr::from)
    }

    fn checked_add(self, n: u128) -> Option<Self> {
        let n = u32::try_from(n).ok()?;
        u32::from(self).checked_add(n).map(Ipv4Addr::from)
    }

    fn span(start: Self, end: Self) -> u128 {
        u128::from(u32::from(end)) - u128::from(u32::from(start)) + 1
    }
}

impl PoolAddr for Ipv6Addr {
    fn succ(self) -> Option<Self> {
        u128::from(self).checked_add(1).map(Ipv6Addr::from)
    }

    fn pred(self) -> Option<Self> {
        u128::from(self).checked_sub(1).map(Ipv6Addr::from)
    }

    fn checked_add(self, n: u128) -> Option<Self> {
        u128::from(self).checked_add(n).map(Ipv6Addr::from)
    }

    fn span(start: Self, end: Self) -> u128 {
        // The full v6 space overflows u128 by one; saturate rather than wrap.
        (u128::from(end) - u128::from(start)).saturating_add(1)
    }
}

// =============================================================================
// IpRange
// =============================================================================

/// An inclusive interval of addresses within one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRange<A> {
    pub start: A,
    pub end: A,
}

impl<A: PoolAddr> IpRange<A> {
    pub fn new(start: A, end: A) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    /// Range covering a single address.
    pub fn single(addr: A) -> Self {
        Self {
            start: addr,
            end: addr,
        }
    }

    /// Number of addresses covered.
    pub fn size(&self) -> u128 {
        A::span(self.start, self.end)
    }

    pub fn contains(&self, addr: A) -> bool {
        self.start <= addr && addr <= self.end
    }
}

// =============================================================================
// IpPool
// =============================================================================

/// A free list of disjoint, sorted address ranges for one address family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpPool<A> {
    free_list: Vec<IpRange<A>>,
}

impl<A> Default for IpPool<A> {
    fn default() -> Self {
        Self {
            free_list: Vec::new(),
        }
    }
}

pub type Ipv4Pool = IpPool<Ipv4Addr>;
pub type Ipv6Pool = IpPool<Ipv6Addr>;

impl<A: PoolAddr> IpPool<A> {
    /// An empty pool.
    pub fn new() -> Self {
        Self {
            free_list: Vec::new(),
        }
    }

    /// Build a pool from an arbitrary set of ranges, normalizing them into
    /// canonical form. Used to re-derive working pools from persisted
    /// per-node state during reconciliation.
    pub fn from_ranges(ranges: Vec<IpRange<A>>) -> Self {
        let mut pool = Self::new();
        pool.add_ranges(&ranges);
        pool
    }

    /// The current free list, sorted and disjoint.
    pub fn free_list(&self) -> &[IpRange<A>] {
        &self.free_list
    }

    /// Consume the pool, returning its free list.
    pub fn into_ranges(self) -> Vec<IpRange<A>> {
        self.free_list
    }

    pub fn is_empty(&self) -> bool {
        self.free_list.is_empty()
    }

    /// Total number of addresses across all ranges.
    pub fn size(&self) -> u128 {
        self.free_list.iter().map(IpRange::size).sum()
    }

    /// Remove and return the lowest available address.
    pub fn get_ip(&mut self) -> Result<A> {
        let first = self.free_list.first().copied().ok_or(Error::PoolExhausted)?;
        let addr = first.start;
        match first.start.succ() {
            Some(next) if next <= first.end => self.free_list[0].start = next,
            _ => {
                self.free_list.remove(0);
            }
        }
        Ok(addr)
    }

    /// Insert a single address back into the pool, coalescing with
    /// neighbors.
    pub fn add_ip(&mut self, addr: A) {
        self.add_range(IpRange::single(addr));
    }

    /// Remove a specific address from the pool if present, splitting the
    /// containing range as needed. Returns whether it was present, which
    /// lets idempotent reconciliation re-claim addresses already recorded
    /// elsewhere.
    pub fn remove_ip(&mut self, addr: A) -> bool {
        let idx = match self.free_list.iter().position(|r| r.contains(addr)) {
            Some(idx) => idx,
            None => return false,
        };
        let range = self.free_list[idx];
        match (range.start == addr, range.end == addr) {
            (true, true) => {
                self.free_list.remove(idx);
            }
            (true, false) => {
                // Start of the range is always below its end here, so succ
                // cannot overflow.
                self.free_list[idx].start = addr.succ().unwrap();
            }
            (false, true) => {
                self.free_list[idx].end = addr.pred().unwrap();
            }
            (false, false) => {
                let upper = IpRange::new(addr.succ().unwrap(), range.end);
                self.free_list[idx].end = addr.pred().unwrap();
                self.free_list.insert(idx + 1, upper);
            }
        }
        true
    }

    /// Union a set of ranges into the pool.
    pub fn add_ranges(&mut self, ranges: &[IpRange<A>]) {
        for r in ranges {
            self.add_range(*r);
        }
    }

    /// Subtract a set of ranges from the pool.
    pub fn remove_ranges(&mut self, ranges: &[IpRange<A>]) {
        for r in ranges {
            self.remove_range(*r);
        }
    }

    /// Atomically remove and return a set of ranges covering exactly
    /// `chunk` addresses, taken from the front of the free list with the
    /// last range split if it overshoots. Fails with no side effect when
    /// total capacity is insufficient.
    pub fn get_ip_chunk(&mut self, chunk: u128) -> Result<Vec<IpRange<A>>> {
        let available = self.size();
        if available < chunk {
            return Err(Error::InsufficientCapacity {
                requested: chunk,
                available,
            });
        }

        let mut taken = Vec::new();
        let mut remaining = chunk;
        while remaining > 0 {
            let first = self.free_list[0];
            let size = first.size();
            if size <= remaining {
                taken.push(first);
                self.free_list.remove(0);
                remaining -= size;
            } else {
                // Split: keep the tail of the range in the pool. The offset
                // is strictly inside the range, so neither add can overflow.
                let split_end = first.start.checked_add(remaining - 1).unwrap();
                taken.push(IpRange::new(first.start, split_end));
                self.free_list[0].start = split_end.succ().unwrap();
                remaining = 0;
            }
        }
        Ok(taken)
    }

    /// A new pool containing exactly the addresses present in both inputs.
    /// Used to clip a node's claimed ranges down to the currently configured
    /// address space, so configuration shrinkage is honored even for
    /// previously-granted ranges.
    pub fn intersect(&self, other: &IpPool<A>) -> IpPool<A> {
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.free_list.len() && j < other.free_list.len() {
            let a = self.free_list[i];
            let b = other.free_list[j];
            let start = a.start.max(b.start);
            let end = a.end.min(b.end);
            if start <= end {
                out.push(IpRange::new(start, end));
            }
            if a.end <= b.end {
                i += 1;
            } else {
                j += 1;
            }
        }
        IpPool { free_list: out }
    }

    fn add_range(&mut self, range: IpRange<A>) {
        // Index of the first existing range that could touch or overlap the
        // new one (its end reaches at least one address below range.start).
        let lo = self
            .free_list
            .partition_point(|r| r.end.succ().map(|s| s < range.start).unwrap_or(false));
        // One past the last range that could touch or overlap it.
        let hi = self
            .free_list
            .partition_point(|r| r.start <= range.end.succ().unwrap_or(range.end));

        if lo == hi {
            self.free_list.insert(lo, range);
            return;
        }

        let start = self.free_list[lo].start.min(range.start);
        let end = self.free_list[hi - 1].end.max(range.end);
        self.free_list.drain(lo..hi);
        self.free_list.insert(lo, IpRange::new(start, end));
    }

    fn remove_range(&mut self, range: IpRange<A>) {
        let mut out = Vec::with_capacity(self.free_list.len() + 1);
        for r in self.free_list.drain(..) {
            if r.end < range.start || r.start > range.end {
                out.push(r);
                continue;
            }
            if r.start < range.start {
                out.push(IpRange::new(r.start, range.start.pred().unwrap()));
            }
            if r.end > range.end {
                out.push(IpRange::new(range.end.succ().unwrap(), r.end));
            }
        }
        self.free_list = out;
    }
}

// =============================================================================
// Tests
// =============================================================================
