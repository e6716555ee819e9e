//! Controller module
//!
//! Event-driven reconciliation of per-node address state against the
//! global configured address space.

mod nodes;

pub use nodes::NodeController;
