//! Node IPAM controller for CNI pod networking
//!
//! Assigns, persists, and reclaims IP address ranges for pod networking
//! and per-node service endpoints across a cluster, using the cluster's
//! node objects as both the trigger source and the persistence layer
//! (via annotations).
//!
//! # Architecture
//!
//! ```text
//! node watch events → NodeController → ClusterState (one lock)
//!                          │                │
//!                          │        free pools + per-node caches
//!                          ▼
//!            annotation writes back to the node object
//! ```
//!
//! Reconciliation is level-triggered: each event re-merges the node's
//! persisted ranges against the configured address space, runs the
//! chunk-sizing check, and rewrites the annotations only when their cached
//! serialized forms drift.
//!
//! # Modules
//!
//! - [`adapters`] - Infrastructure adapters implementing the ports
//! - [`annotations`] - Persisted annotation wire formats
//! - [`config`] - Configured address space and chunk sizing
//! - [`controller`] - Node reconciliation engine
//! - [`error`] - Error types
//! - [`ipam`] - Range-based IP address pools
//! - [`metrics`] - Prometheus metrics
//! - [`ports`] - Capability boundary traits
//! - [`state`] - Shared in-memory state holder

pub mod adapters;
pub mod annotations;
pub mod config;
pub mod controller;
pub mod error;
pub mod ipam;
pub mod metrics;
pub mod ports;
pub mod state;

// Re-export commonly used types
pub use annotations::{NetIps, ServiceEndpoint};
pub use config::NetConfig;
pub use controller::NodeController;
pub use error::{Error, Result};
pub use ipam::{IpPool, IpRange, PoolPair};
pub use ports::NodeStore;
pub use state::ClusterState;
