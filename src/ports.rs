//! Ports for the capability boundary
//!
//! The cluster object store is consumed as a capability, not reimplemented.
//! The engine only ever needs two things from it: a read of the most
//! recently observed node object, and a conditional write of an updated
//! one. Keeping this behind a trait lets tests drive the full
//! reconciliation cycle against an in-memory store, including fabricated
//! optimistic-concurrency conflicts.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;

use crate::error::Result;

/// Read/write access to node objects.
#[async_trait]
pub trait NodeStore: Send + Sync + 'static {
    /// The most recently observed node object by name, from local cache.
    /// Must not block on a network round-trip.
    async fn latest(&self, name: &str) -> Result<Option<Node>>;

    /// Conditionally update a node. A concurrent modification since the
    /// object was read surfaces as an error classified by
    /// [`crate::error::Error::is_conflict`].
    async fn persist(&self, node: &Node) -> Result<Node>;
}
