//! Error types for the node IPAM controller

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the node IPAM controller
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Free pool has no addresses left for a single allocation
    #[error("no IP addresses available in pool")]
    PoolExhausted,

    /// Free pool cannot satisfy a chunk request
    #[error("insufficient pool capacity: requested {requested}, available {available}")]
    InsufficientCapacity { requested: u128, available: u128 },

    /// Service endpoint ended up with no address in either family
    #[error("no IP addresses available for service endpoint")]
    NoServiceEndpointAddress,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this is an optimistic-concurrency conflict from the API
    /// server. Conflicts are expected under concurrent writers and are
    /// resolved by the next watch event rather than retried.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ae)) if ae.code == 409)
    }
}
