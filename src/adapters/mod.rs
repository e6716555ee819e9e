//! Infrastructure adapters implementing the capability ports

mod kubernetes;

pub use kubernetes::KubeNodeStore;
