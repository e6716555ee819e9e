//! Handlers for node updates.
//!
//! The engine is level-triggered: every observed change is re-merged
//! against current global pool state rather than diffed incrementally, so
//! it converges under repeated or stale event delivery. The global state
//! lock is held only across in-memory computation; reads and writes of the
//! node object happen strictly outside the critical section.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::Api;
use kube::runtime::reflector::store::Writer;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::ResourceExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::annotations::{
    NetIps, ServiceEndpoint, POD_NETWORK_RANGE_ANNOTATION, SERVICE_EP_ANNOTATION,
};
use crate::metrics;
use crate::ports::NodeStore;
use crate::state::ClusterState;

/// Node reconciliation engine.
///
/// One instance serves the whole cluster: every event handler runs against
/// the same [`ClusterState`] behind one lock, because address allocation
/// across nodes must serialize against the shared free pools.
pub struct NodeController {
    state: Arc<Mutex<ClusterState>>,
    store: Arc<dyn NodeStore>,
    resync_tx: mpsc::UnboundedSender<String>,
}

impl NodeController {
    /// Create the controller and the receiving end of its resync queue.
    /// The receiver must be passed to [`NodeController::run_resync`].
    pub fn new(
        state: Arc<Mutex<ClusterState>>,
        store: Arc<dyn NodeStore>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (resync_tx, resync_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                state,
                store,
                resync_tx,
            }),
            resync_rx,
        )
    }

    pub fn state(&self) -> &Arc<Mutex<ClusterState>> {
        &self.state
    }

    /// Watch nodes and dispatch change/delete handlers, one task per
    /// event. Runs until the watch stream ends.
    pub async fn run(self: Arc<Self>, api: Api<Node>, writer: Writer<Node>) {
        info!("starting node controller");
        let stream = reflector(writer, watcher(api, watcher::Config::default()).default_backoff());
        let mut stream = Box::pin(stream);

        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Apply(node)) | Ok(watcher::Event::InitApply(node)) => {
                    let ctrl = self.clone();
                    tokio::spawn(async move {
                        ctrl.node_changed(&node).await;
                    });
                }
                Ok(watcher::Event::Delete(node)) => {
                    self.node_deleted(&node);
                }
                Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => {}
                Err(e) => warn!(error = %e, "node watch stream error"),
            }
        }
        info!("node controller shutdown complete");
    }

    /// Drain the resync queue: for each node whose owned ranges grew under
    /// the lock, re-read the object from local cache and re-run the full
    /// cycle. This is the second phase of chunk growth; the first phase
    /// (deciding and mutating the pools) always runs lock-held and must
    /// not persist inline.
    pub async fn run_resync(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<String>) {
        while let Some(name) = rx.recv().await {
            match self.store.latest(&name).await {
                Ok(Some(node)) => self.node_changed(&node).await,
                Ok(None) => debug!(node = %name, "node not in cache; skipping resync"),
                Err(e) => error!(node = %name, error = %e, "could not look up node for resync"),
            }
        }
    }

    /// Handler for node add and update events.
    pub async fn node_changed(&self, node: &Node) {
        metrics::NODE_RECONCILES.inc();
        let name = node.name_any();
        let mut annotations = node.annotations().clone();
        let mut node_updated = false;

        {
            let mut st = self.state.lock();
            node_updated |= self.reconcile_service_endpoint(&mut st, &name, &mut annotations);
            node_updated |= self.reconcile_pod_network(&mut st, &name, &mut annotations);
            metrics::update_pool_gauges(&st);
        }

        if node_updated {
            self.persist_node(node, annotations).await;
        }
    }

    /// Handler for node delete events. Service endpoint addresses go back
    /// to the service free pool; pod network state is intentionally left in
    /// place so a reappearing node keeps its ranges.
    pub fn node_deleted(&self, node: &Node) {
        let name = node.name_any();
        let mut st = self.state.lock();
        st.release_service_endpoint(&name);
        metrics::update_pool_gauges(&st);
        debug!(node = %name, "released service endpoint state");
    }

    /// Record a pod scheduled to a node and re-run the capacity check.
    /// The caller must hold the global state lock and pass its guard's
    /// target in.
    pub fn add_pod_to_node(&self, st: &mut ClusterState, nodename: &str, key: &str) {
        if st.add_pod_to_node(nodename, key) {
            self.request_resync(nodename);
        }
    }

    /// Remove a pod from a node and re-run the capacity check. Same
    /// locking contract as [`Self::add_pod_to_node`].
    pub fn remove_pod_from_node(&self, st: &mut ClusterState, nodename: &str, key: &str) {
        if st.remove_pod_from_node(nodename, key) {
            self.request_resync(nodename);
        }
    }

    fn request_resync(&self, nodename: &str) {
        if self.resync_tx.send(nodename.to_string()).is_err() {
            warn!(node = nodename, "resync queue closed; dropping persist request");
        }
    }

    /// Service endpoint branch. Once a node has cached endpoint state the
    /// cache wins over any drifted annotation; otherwise the persisted
    /// value is parsed (malformed falls back to fresh state) and a usable
    /// endpoint assigned. Returns whether the annotation changed.
    fn reconcile_service_endpoint(
        &self,
        st: &mut ClusterState,
        name: &str,
        annotations: &mut BTreeMap<String, String>,
    ) -> bool {
        let epval = annotations.get(SERVICE_EP_ANNOTATION).cloned();

        if let Some(existing) = st.service_meta(name) {
            if epval.as_deref() != Some(existing.annotation.as_str()) {
                let cached = existing.annotation.clone();
                annotations.insert(SERVICE_EP_ANNOTATION.to_string(), cached);
                return true;
            }
            return false;
        }

        let mut ep = ServiceEndpoint::default();
        if let Some(raw) = &epval {
            match serde_json::from_str::<ServiceEndpoint>(raw) {
                Ok(parsed) => ep = parsed,
                Err(e) => warn!(
                    node = name,
                    value = %raw,
                    error = %e,
                    "could not parse existing node service endpoint annotation"
                ),
            }
        }

        if let Err(e) = st.create_service_endpoint(&mut ep) {
            // Left unusable until a later event finds capacity.
            warn!(node = name, error = %e, "could not assign service endpoint addresses");
        }

        match serde_json::to_string(&ep) {
            Ok(raw) => {
                let changed = epval.as_deref() != Some(raw.as_str());
                if changed {
                    annotations.insert(SERVICE_EP_ANNOTATION.to_string(), raw.clone());
                }
                st.insert_service_meta(name, ep, raw);
                changed
            }
            Err(e) => {
                error!(node = name, error = %e, "could not create node service endpoint annotation");
                false
            }
        }
    }

    /// Pod network branch: merge on annotation drift, run the sizing
    /// check, and rewrite the annotation if the cached serialized form
    /// differs from what the node carries. Returns whether it changed.
    fn reconcile_pod_network(
        &self,
        st: &mut ClusterState,
        name: &str,
        annotations: &mut BTreeMap<String, String>,
    ) -> bool {
        st.ensure_node_pod_net(name);

        let netval = annotations
            .get(POD_NETWORK_RANGE_ANNOTATION)
            .cloned()
            .unwrap_or_default();
        let cached = st
            .node_pod_net(name)
            .map(|p| p.pod_net_annotation.clone())
            .unwrap_or_default();

        if !netval.is_empty() && netval != cached {
            match serde_json::from_str::<NetIps>(&netval) {
                Ok(persisted) => {
                    debug!(node = name, annotation = %netval, "merging persisted pod network");
                    st.merge_pod_net(name, &persisted);
                }
                Err(e) => warn!(
                    node = name,
                    error = %e,
                    "could not parse existing pod network annotation"
                ),
            }
        }

        if st.check_node_pod_net(name) {
            self.request_resync(name);
        }

        let current = st
            .node_pod_net(name)
            .map(|p| p.pod_net_annotation.clone())
            .unwrap_or_default();
        if netval != current {
            annotations.insert(POD_NETWORK_RANGE_ANNOTATION.to_string(), current);
            true
        } else {
            false
        }
    }

    /// Phase two of an update: write the changed annotations back. A
    /// conflict means the object changed concurrently; the watch will
    /// redeliver it, so the update is dropped rather than retried.
    async fn persist_node(&self, node: &Node, annotations: BTreeMap<String, String>) {
        let name = node.name_any();
        let service_ep = annotations.get(SERVICE_EP_ANNOTATION).cloned();
        let pod_network = annotations.get(POD_NETWORK_RANGE_ANNOTATION).cloned();

        let mut updated = node.clone();
        updated.metadata.annotations = Some(annotations);

        match self.store.persist(&updated).await {
            Ok(_) => info!(
                node = %name,
                service_endpoint = service_ep.as_deref().unwrap_or(""),
                pod_network = pod_network.as_deref().unwrap_or(""),
                "updated node annotations"
            ),
            Err(e) if e.is_conflict() => {
                metrics::PERSIST_CONFLICTS.inc();
                debug!(node = %name, "conflict updating node; will retry on next update");
            }
            Err(e) => {
                metrics::PERSIST_FAILURES.inc();
                error!(node = %name, error = %e, "failed to update node");
            }
        }
    }
}
