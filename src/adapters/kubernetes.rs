//! Kubernetes node store adapter
//!
//! Implements the [`NodeStore`] port against the API server. Reads come
//! from the watch reflector's local cache; writes go through `replace`, so
//! a stale `resourceVersion` yields the HTTP 409 conflict the engine
//! treats as benign.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, PostParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;

use crate::error::{Error, Result};
use crate::ports::NodeStore;

/// Node store backed by the API server and the watch reflector cache.
#[derive(Clone)]
pub struct KubeNodeStore {
    api: Api<Node>,
    cache: Store<Node>,
}

impl KubeNodeStore {
    pub fn new(api: Api<Node>, cache: Store<Node>) -> Self {
        Self { api, cache }
    }
}

#[async_trait]
impl NodeStore for KubeNodeStore {
    async fn latest(&self, name: &str) -> Result<Option<Node>> {
        let node = self.cache.get(&ObjectRef::new(name));
        Ok(node.map(|n| Arc::unwrap_or_clone(n)))
    }

    async fn persist(&self, node: &Node) -> Result<Node> {
        let name = node.name_any();
        if node.resource_version().is_none() {
            return Err(Error::Internal(format!(
                "refusing unconditional update of node {}: missing resourceVersion",
                name
            )));
        }
        let updated = self
            .api
            .replace(&name, &PostParams::default(), node)
            .await?;
        Ok(updated)
    }
}
