//! Provider interface.
//!
//! The provider is the remote service that actually runs pods. The agent
//! talks to it over a small JSON/HTTP protocol:
//!
//! - Pod lifecycle: create, update, delete, get, status, list
//! - Streaming: container logs and exec
//! - Node facts: capacity, conditions, addresses, daemon endpoints, stats
//!
//! [`HttpProvider`] speaks the wire protocol; [`MockProvider`] is an
//! in-memory implementation for tests and local development.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use k8s_openapi::api::core::v1::{NodeAddress, NodeCondition, NodeDaemonEndpoints, Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::context::OpContext;
use crate::error::Result;
use crate::pod::PodKey;

mod http;
mod mock;
mod types;

pub use http::HttpProvider;
pub use mock::{MockProvider, Operation, ProviderCall, RecordedCall};
pub use types::{
    ContainerStats, CpuStats, ErrorBody, ExecRequest, LogOptions, MemoryStats, NodeStats,
    PodReference, PodStats, StatsSummary,
};

/// Stream of raw bytes from or to the provider.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Provider operations. Implementations must be safe for concurrent use.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Create a pod. Idempotent by UID; `AlreadyExists` on 409.
    async fn create_pod(&self, ctx: &OpContext, pod: &Pod) -> Result<()>;

    /// Push a new spec for an existing pod.
    async fn update_pod(&self, ctx: &OpContext, pod: &Pod) -> Result<()>;

    /// Delete a pod. A pod that is already gone counts as success.
    async fn delete_pod(&self, ctx: &OpContext, pod: &Pod) -> Result<()>;

    /// Observed pod, `NotFound` when the provider has no such pod.
    async fn get_pod(&self, ctx: &OpContext, key: &PodKey) -> Result<Pod>;

    async fn get_pod_status(&self, ctx: &OpContext, key: &PodKey) -> Result<PodStatus>;

    async fn get_pods(&self, ctx: &OpContext) -> Result<Vec<Pod>>;

    /// Container log stream. The body has no read deadline.
    async fn get_container_logs(
        &self,
        ctx: &OpContext,
        key: &PodKey,
        container: &str,
        options: &LogOptions,
    ) -> Result<ByteStream>;

    /// Run a command in a container: `stdin` is forwarded, output streamed back.
    async fn run_in_container(
        &self,
        ctx: &OpContext,
        request: &ExecRequest,
        stdin: ByteStream,
    ) -> Result<ByteStream>;

    async fn capacity(&self, ctx: &OpContext) -> Result<BTreeMap<String, Quantity>>;

    async fn node_conditions(&self, ctx: &OpContext) -> Result<Vec<NodeCondition>>;

    async fn node_addresses(&self, ctx: &OpContext) -> Result<Vec<NodeAddress>>;

    async fn node_daemon_endpoints(&self, ctx: &OpContext) -> Result<NodeDaemonEndpoints>;

    async fn get_stats_summary(&self, ctx: &OpContext) -> Result<StatsSummary>;
}
