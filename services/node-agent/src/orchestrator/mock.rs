//! In-memory orchestrator for tests and local development.
//!
//! Pods get a global, increasing resource version on every write, and every
//! write is published to the open watch streams, the way an API server
//! would. Status patches are checked against the stored resource version.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::{
    ConfigMap, Node, NodeSpec, NodeStatus, Pod, PodStatus, Secret, Taint,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::info;

use super::{EventRecord, Orchestrator, PodEvent, PodEventStream, PodList};
use crate::context::OpContext;
use crate::error::{Error, Result};
use crate::pod::{self, PodKey};

/// Orchestrator operation, used to script failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    ListPods,
    WatchPods,
    PatchPodStatus,
    RemoveFinalizers,
    CreateEvent,
    GetConfigMap,
    GetSecret,
    CreateNode,
    PatchNodeStatus,
    CordonNode,
    DeleteNode,
    RenewLease,
}

/// A pod status patch accepted by the mock.
#[derive(Debug, Clone)]
pub struct StatusPatch {
    pub key: PodKey,
    pub uid: Option<String>,
    /// Resource version the patch was guarded by.
    pub resource_version: Option<String>,
    pub status: PodStatus,
    pub at: Instant,
}

#[derive(Default)]
struct State {
    pods: BTreeMap<PodKey, Pod>,
    next_version: u64,
    watchers: Vec<mpsc::UnboundedSender<Result<PodEvent>>>,
    status_patches: Vec<StatusPatch>,
    finalized: Vec<(PodKey, Option<String>)>,
    events: Vec<(PodKey, EventRecord)>,
    config_maps: BTreeMap<PodKey, ConfigMap>,
    secrets: BTreeMap<PodKey, Secret>,
    node: Option<Node>,
    node_patches: Vec<(Instant, NodeStatus)>,
    cordoned: Option<Taint>,
    node_deleted: bool,
    lease_renewals: usize,
    tokens: HashMap<String, String>,
    failures: HashMap<MockOp, VecDeque<Error>>,
}

impl State {
    fn bump(&mut self, pod: &mut Pod) {
        self.next_version += 1;
        pod.metadata.resource_version = Some(self.next_version.to_string());
    }

    fn publish(&mut self, event: PodEvent) {
        self.watchers.retain(|tx| tx.send(Ok(event.clone())).is_ok());
    }

    fn fail(&mut self, op: MockOp) -> Result<()> {
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// In-memory orchestrator.
#[derive(Default)]
pub struct MockOrchestrator {
    state: Mutex<State>,
}

impl MockOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: MockOp, error: Error) {
        self.state().failures.entry(op).or_default().push_back(error);
    }

    /// Create or replace a pod, publishing `Added` or `Modified`.
    pub fn apply_pod(&self, mut pod: Pod) -> Pod {
        let mut state = self.state();
        let key = PodKey::of(&pod);
        state.bump(&mut pod);
        let existed = state.pods.insert(key, pod.clone()).is_some();
        let event = if existed {
            PodEvent::Modified(pod.clone())
        } else {
            PodEvent::Added(pod.clone())
        };
        state.publish(event);
        pod
    }

    /// Set the deletion timestamp on a pod, publishing `Modified`.
    pub fn mark_deleting(&self, key: &PodKey) -> Option<Pod> {
        let mut state = self.state();
        let mut pod = state.pods.get(key)?.clone();
        pod.metadata.deletion_timestamp = Some(Time(Utc::now()));
        state.bump(&mut pod);
        state.pods.insert(key.clone(), pod.clone());
        state.publish(PodEvent::Modified(pod.clone()));
        Some(pod)
    }

    /// Remove a pod outright, publishing `Deleted`.
    pub fn remove_pod(&self, key: &PodKey) -> Option<Pod> {
        let mut state = self.state();
        let mut pod = state.pods.remove(key)?;
        state.bump(&mut pod);
        state.publish(PodEvent::Deleted(pod.clone()));
        Some(pod)
    }

    /// Remove a pod without telling the watchers, as if the event was lost.
    pub fn remove_pod_silently(&self, key: &PodKey) -> Option<Pod> {
        self.state().pods.remove(key)
    }

    /// Publish a bookmark at the current resource version.
    pub fn bookmark(&self) {
        let mut state = self.state();
        let version = state.next_version.to_string();
        state.publish(PodEvent::Bookmark(version));
    }

    /// Fail every open watch stream, forcing watchers to reconnect.
    pub fn break_watches(&self) {
        let mut state = self.state();
        for tx in state.watchers.drain(..) {
            let _ = tx.send(Err(Error::Retryable("watch stream reset".into())));
        }
    }

    pub fn watcher_count(&self) -> usize {
        let mut state = self.state();
        state.watchers.retain(|tx| !tx.is_closed());
        state.watchers.len()
    }

    pub fn pod(&self, key: &PodKey) -> Option<Pod> {
        self.state().pods.get(key).cloned()
    }

    pub fn status_patches(&self) -> Vec<StatusPatch> {
        self.state().status_patches.clone()
    }

    /// Keys and UIDs whose finalizers were removed, in order.
    pub fn finalized(&self) -> Vec<(PodKey, Option<String>)> {
        self.state().finalized.clone()
    }

    pub fn events(&self) -> Vec<(PodKey, EventRecord)> {
        self.state().events.clone()
    }

    /// Events with `reason`.
    pub fn events_with_reason(&self, reason: &str) -> Vec<(PodKey, EventRecord)> {
        self.state()
            .events
            .iter()
            .filter(|(_, e)| e.reason == reason)
            .cloned()
            .collect()
    }

    pub fn node(&self) -> Option<Node> {
        self.state().node.clone()
    }

    /// Insert a node as if registered by a previous run.
    pub fn insert_node(&self, node: Node) {
        self.state().node = Some(node);
    }

    pub fn node_patches(&self) -> Vec<(Instant, NodeStatus)> {
        self.state().node_patches.clone()
    }

    pub fn cordon_taint(&self) -> Option<Taint> {
        self.state().cordoned.clone()
    }

    pub fn node_deleted(&self) -> bool {
        self.state().node_deleted
    }

    pub fn lease_renewals(&self) -> usize {
        self.state().lease_renewals
    }

    /// Accept `token` in token reviews as `user`.
    pub fn allow_token(&self, token: &str, user: &str) {
        self.state().tokens.insert(token.to_string(), user.to_string());
    }

    /// Store a config map under its namespace and name.
    pub fn insert_config_map(&self, config_map: ConfigMap) {
        let key = object_key(&config_map.metadata);
        self.state().config_maps.insert(key, config_map);
    }

    /// Store a secret under its namespace and name.
    pub fn insert_secret(&self, secret: Secret) {
        let key = object_key(&secret.metadata);
        self.state().secrets.insert(key, secret);
    }
}

fn object_key(meta: &ObjectMeta) -> PodKey {
    PodKey::new(
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default(),
    )
}

fn not_found(what: impl std::fmt::Display) -> Error {
    Error::NotFound(format!("{what} not found"))
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    async fn list_pods(&self, _ctx: &OpContext, node: &str) -> Result<PodList> {
        let mut state = self.state();
        state.fail(MockOp::ListPods)?;
        let pods = state
            .pods
            .values()
            .filter(|p| p.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node))
            .cloned()
            .collect();
        Ok(PodList {
            pods,
            resource_version: Some(state.next_version.to_string()),
        })
    }

    async fn watch_pods(
        &self,
        _ctx: &OpContext,
        node: &str,
        _resource_version: &str,
    ) -> Result<PodEventStream> {
        let mut state = self.state();
        state.fail(MockOp::WatchPods)?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.watchers.push(tx);

        let node = node.to_string();
        Ok(UnboundedReceiverStream::new(rx)
            .filter(move |event| {
                let keep = match event {
                    Ok(PodEvent::Added(p) | PodEvent::Modified(p) | PodEvent::Deleted(p)) => {
                        p.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node.as_str())
                    }
                    _ => true,
                };
                std::future::ready(keep)
            })
            .boxed())
    }

    async fn get_pod(&self, _ctx: &OpContext, key: &PodKey) -> Result<Pod> {
        self.pod(key).ok_or_else(|| not_found(format!("pod {key}")))
    }

    async fn patch_pod_status(&self, _ctx: &OpContext, pod: &Pod, status: &PodStatus) -> Result<Pod> {
        let key = PodKey::of(pod);
        let mut state = self.state();
        state.fail(MockOp::PatchPodStatus)?;

        let mut stored = state
            .pods
            .get(&key)
            .cloned()
            .ok_or_else(|| not_found(format!("pod {key}")))?;
        if stored.metadata.resource_version != pod.metadata.resource_version {
            return Err(Error::Conflict(format!(
                "pod {key} has resource version {:?}, patch expected {:?}",
                stored.metadata.resource_version, pod.metadata.resource_version
            )));
        }

        state.status_patches.push(StatusPatch {
            key: key.clone(),
            uid: pod::uid(&stored).map(str::to_string),
            resource_version: pod.metadata.resource_version.clone(),
            status: status.clone(),
            at: Instant::now(),
        });
        stored.status = Some(status.clone());
        state.bump(&mut stored);
        state.pods.insert(key, stored.clone());
        state.publish(PodEvent::Modified(stored.clone()));
        Ok(stored)
    }

    async fn remove_pod_finalizers_and_delete(&self, _ctx: &OpContext, pod: &Pod) -> Result<()> {
        let key = PodKey::of(pod);
        let mut state = self.state();
        state.fail(MockOp::RemoveFinalizers)?;

        let Some(stored) = state.pods.get(&key) else {
            return Ok(());
        };
        if pod::uid(stored) != pod::uid(pod) {
            return Err(Error::Conflict(format!("pod {key} was replaced")));
        }

        let uid = pod::uid(pod).map(str::to_string);
        info!(pod = %key, "[MOCK] Removing finalizers and deleting pod");
        state.finalized.push((key.clone(), uid));
        if let Some(mut removed) = state.pods.remove(&key) {
            removed.metadata.finalizers = None;
            state.bump(&mut removed);
            state.publish(PodEvent::Deleted(removed));
        }
        Ok(())
    }

    async fn create_event(&self, _ctx: &OpContext, pod: &Pod, event: &EventRecord) -> Result<()> {
        let mut state = self.state();
        state.fail(MockOp::CreateEvent)?;
        info!(pod = %PodKey::of(pod), reason = %event.reason, "[MOCK] Recording event");
        state.events.push((PodKey::of(pod), event.clone()));
        Ok(())
    }

    async fn get_config_map(&self, _ctx: &OpContext, namespace: &str, name: &str) -> Result<ConfigMap> {
        let mut state = self.state();
        state.fail(MockOp::GetConfigMap)?;
        let key = PodKey::new(namespace, name);
        state
            .config_maps
            .get(&key)
            .cloned()
            .ok_or_else(|| not_found(format!("configmap {key}")))
    }

    async fn get_secret(&self, _ctx: &OpContext, namespace: &str, name: &str) -> Result<Secret> {
        let mut state = self.state();
        state.fail(MockOp::GetSecret)?;
        let key = PodKey::new(namespace, name);
        state
            .secrets
            .get(&key)
            .cloned()
            .ok_or_else(|| not_found(format!("secret {key}")))
    }

    async fn create_node(&self, _ctx: &OpContext, node: &Node) -> Result<Node> {
        let mut state = self.state();
        state.fail(MockOp::CreateNode)?;
        if state.node.is_some() {
            return Err(Error::AlreadyExists(format!(
                "node {:?} already exists",
                node.metadata.name
            )));
        }
        let mut created = node.clone();
        created.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        state.node = Some(created.clone());
        state.node_deleted = false;
        Ok(created)
    }

    async fn get_node(&self, _ctx: &OpContext, name: &str) -> Result<Node> {
        self.node().ok_or_else(|| not_found(format!("node {name}")))
    }

    async fn patch_node_status(&self, _ctx: &OpContext, name: &str, status: &NodeStatus) -> Result<Node> {
        let mut state = self.state();
        state.fail(MockOp::PatchNodeStatus)?;
        state.node_patches.push((Instant::now(), status.clone()));
        let node = state
            .node
            .as_mut()
            .ok_or_else(|| not_found(format!("node {name}")))?;
        node.status = Some(status.clone());
        Ok(node.clone())
    }

    async fn cordon_node(&self, _ctx: &OpContext, name: &str, taint: &Taint) -> Result<()> {
        let mut state = self.state();
        state.fail(MockOp::CordonNode)?;
        let node = state
            .node
            .as_mut()
            .ok_or_else(|| not_found(format!("node {name}")))?;
        let spec = node.spec.get_or_insert_with(NodeSpec::default);
        spec.unschedulable = Some(true);
        spec.taints.get_or_insert_with(Vec::new).push(taint.clone());
        state.cordoned = Some(taint.clone());
        Ok(())
    }

    async fn delete_node(&self, _ctx: &OpContext, _name: &str) -> Result<()> {
        let mut state = self.state();
        state.fail(MockOp::DeleteNode)?;
        state.node = None;
        state.node_deleted = true;
        Ok(())
    }

    async fn renew_lease(&self, _ctx: &OpContext, _name: &str, _duration_secs: i32) -> Result<()> {
        let mut state = self.state();
        state.fail(MockOp::RenewLease)?;
        state.lease_renewals += 1;
        Ok(())
    }

    async fn review_token(&self, _ctx: &OpContext, token: &str) -> Result<Option<String>> {
        Ok(self.state().tokens.get(token).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::fixtures::pod;

    #[tokio::test]
    async fn test_status_patch_requires_current_version() {
        let orchestrator = MockOrchestrator::new();
        let ctx = OpContext::background();
        let stored = orchestrator.apply_pod(pod("a", "p1", "U1", 1, ""));

        let patched = orchestrator
            .patch_pod_status(&ctx, &stored, &PodStatus::default())
            .await
            .unwrap();
        assert_ne!(patched.metadata.resource_version, stored.metadata.resource_version);

        let err = orchestrator
            .patch_pod_status(&ctx, &stored, &PodStatus::default())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(orchestrator.status_patches().len(), 1);
    }

    #[tokio::test]
    async fn test_watch_receives_changes_for_node() {
        let orchestrator = MockOrchestrator::new();
        let ctx = OpContext::background();
        let mut events = orchestrator.watch_pods(&ctx, "vn-1", "0").await.unwrap();

        let mut other = pod("a", "elsewhere", "U9", 1, "");
        other.spec.as_mut().unwrap().node_name = Some("vn-2".into());
        orchestrator.apply_pod(other);
        orchestrator.apply_pod(pod("a", "p1", "U1", 1, ""));

        match events.next().await.unwrap().unwrap() {
            PodEvent::Added(p) => assert_eq!(PodKey::of(&p), PodKey::new("a", "p1")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_node_twice_is_already_exists() {
        let orchestrator = MockOrchestrator::new();
        let ctx = OpContext::background();
        orchestrator.create_node(&ctx, &Node::default()).await.unwrap();
        let err = orchestrator.create_node(&ctx, &Node::default()).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }
}
