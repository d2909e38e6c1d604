//! Orchestrator interface.
//!
//! The agent consumes a small slice of the cluster API:
//! - List and watch the pods bound to this node
//! - Patch pod status, drop finalizers, record events
//! - Read the config maps and secrets pod environments refer to
//! - Create, patch, cordon and delete the node object
//! - Renew the node lease and review bearer tokens
//!
//! [`KubeOrchestrator`] talks to a real API server; [`MockOrchestrator`]
//! keeps everything in memory for tests and local development.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use k8s_openapi::api::core::v1::{ConfigMap, Node, NodeStatus, Pod, PodStatus, Secret, Taint};

use crate::context::OpContext;
use crate::error::Result;
use crate::pod::PodKey;

mod kubernetes;
mod mock;

pub use kubernetes::KubeOrchestrator;
pub use mock::{MockOp, MockOrchestrator, StatusPatch};

/// Namespace holding node leases.
pub const LEASE_NAMESPACE: &str = "kube-node-lease";

/// One change to the set of pods bound to this node.
#[derive(Debug, Clone)]
pub enum PodEvent {
    Added(Pod),
    Modified(Pod),
    Deleted(Pod),
    /// Progress marker carrying the latest resource version.
    Bookmark(String),
}

pub type PodEventStream = BoxStream<'static, Result<PodEvent>>;

/// Result of a full list: the baseline for a subsequent watch.
#[derive(Debug, Clone, Default)]
pub struct PodList {
    pub pods: Vec<Pod>,
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
        }
    }
}

/// Event recorded against a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

impl EventRecord {
    pub fn warning(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Warning,
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn normal(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Normal,
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Cluster API operations used by the agent.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Pods with `spec.nodeName == node`.
    async fn list_pods(&self, ctx: &OpContext, node: &str) -> Result<PodList>;

    /// Changes to the pods bound to `node` since `resource_version`.
    async fn watch_pods(
        &self,
        ctx: &OpContext,
        node: &str,
        resource_version: &str,
    ) -> Result<PodEventStream>;

    async fn get_pod(&self, ctx: &OpContext, key: &PodKey) -> Result<Pod>;

    /// Merge `status` into the pod, guarded by the pod's resource version.
    ///
    /// Returns the updated pod; `Conflict` when the stored version moved on.
    async fn patch_pod_status(&self, ctx: &OpContext, pod: &Pod, status: &PodStatus) -> Result<Pod>;

    /// Clear finalizers and delete with a zero grace period.
    async fn remove_pod_finalizers_and_delete(&self, ctx: &OpContext, pod: &Pod) -> Result<()>;

    async fn create_event(&self, ctx: &OpContext, pod: &Pod, event: &EventRecord) -> Result<()>;

    async fn get_config_map(&self, ctx: &OpContext, namespace: &str, name: &str) -> Result<ConfigMap>;

    async fn get_secret(&self, ctx: &OpContext, namespace: &str, name: &str) -> Result<Secret>;

    async fn create_node(&self, ctx: &OpContext, node: &Node) -> Result<Node>;

    async fn get_node(&self, ctx: &OpContext, name: &str) -> Result<Node>;

    async fn patch_node_status(&self, ctx: &OpContext, name: &str, status: &NodeStatus) -> Result<Node>;

    /// Mark the node unschedulable and add `taint`.
    async fn cordon_node(&self, ctx: &OpContext, name: &str, taint: &Taint) -> Result<()>;

    async fn delete_node(&self, ctx: &OpContext, name: &str) -> Result<()>;

    /// Create or renew the node lease.
    async fn renew_lease(&self, ctx: &OpContext, name: &str, duration_secs: i32) -> Result<()>;

    /// Validate a bearer token. Returns the authenticated user name.
    async fn review_token(&self, ctx: &OpContext, token: &str) -> Result<Option<String>>;
}
