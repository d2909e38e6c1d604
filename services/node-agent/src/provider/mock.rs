//! In-memory provider for tests and local development.
//!
//! Records every call with a timestamp, keeps pods in a map keyed by pod
//! key, and can be scripted to fail specific operations or to hold
//! mutating calls for a while to expose overlapping transitions.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use k8s_openapi::api::core::v1::{
    DaemonEndpoint, NodeAddress, NodeCondition, NodeDaemonEndpoints, Pod, PodStatus,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tokio::time::Instant;
use tracing::info;

use super::{ByteStream, ExecRequest, LogOptions, Provider, StatsSummary};
use crate::context::OpContext;
use crate::error::{Error, Result};
use crate::pod::{self, PodKey};

/// Provider operation, used to script failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreatePod,
    UpdatePod,
    DeletePod,
    GetPod,
    GetPodStatus,
    GetPods,
    GetContainerLogs,
    RunInContainer,
    Capacity,
    NodeConditions,
    NodeAddresses,
    NodeDaemonEndpoints,
    GetStatsSummary,
}

/// A call observed by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    CreatePod { key: PodKey, uid: Option<String>, generation: i64 },
    UpdatePod { key: PodKey, uid: Option<String>, generation: i64 },
    DeletePod { key: PodKey, uid: Option<String> },
    GetPod(PodKey),
    GetPodStatus(PodKey),
    GetPods,
    GetContainerLogs { key: PodKey, container: String },
    RunInContainer { key: PodKey, command: Vec<String> },
    Capacity,
    NodeConditions,
    NodeAddresses,
    NodeDaemonEndpoints,
    GetStatsSummary,
}

impl ProviderCall {
    pub fn operation(&self) -> Operation {
        match self {
            Self::CreatePod { .. } => Operation::CreatePod,
            Self::UpdatePod { .. } => Operation::UpdatePod,
            Self::DeletePod { .. } => Operation::DeletePod,
            Self::GetPod(_) => Operation::GetPod,
            Self::GetPodStatus(_) => Operation::GetPodStatus,
            Self::GetPods => Operation::GetPods,
            Self::GetContainerLogs { .. } => Operation::GetContainerLogs,
            Self::RunInContainer { .. } => Operation::RunInContainer,
            Self::Capacity => Operation::Capacity,
            Self::NodeConditions => Operation::NodeConditions,
            Self::NodeAddresses => Operation::NodeAddresses,
            Self::NodeDaemonEndpoints => Operation::NodeDaemonEndpoints,
            Self::GetStatsSummary => Operation::GetStatsSummary,
        }
    }

    /// Pod key the call refers to, if any.
    pub fn key(&self) -> Option<&PodKey> {
        match self {
            Self::CreatePod { key, .. }
            | Self::UpdatePod { key, .. }
            | Self::DeletePod { key, .. }
            | Self::GetPod(key)
            | Self::GetPodStatus(key)
            | Self::GetContainerLogs { key, .. }
            | Self::RunInContainer { key, .. } => Some(key),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub call: ProviderCall,
    pub at: Instant,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock provider for testing and development.
pub struct MockProvider {
    pods: Mutex<BTreeMap<PodKey, Pod>>,
    calls: Mutex<Vec<RecordedCall>>,
    failures: Mutex<HashMap<Operation, VecDeque<Error>>>,
    capacity: Mutex<BTreeMap<String, Quantity>>,
    stats: Mutex<Option<StatsSummary>>,
    logs: Mutex<HashMap<(PodKey, String), Bytes>>,
    running_phase: Mutex<String>,
    mutation_delay: Mutex<Duration>,
    in_flight: Mutex<HashMap<PodKey, usize>>,
    max_in_flight_per_key: AtomicUsize,
}

impl MockProvider {
    /// Create a new mock provider with a small fixed capacity.
    pub fn new() -> Self {
        let capacity = [("cpu", "20"), ("memory", "100Gi"), ("pods", "110"), ("ephemeral-storage", "500Gi")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
            .collect();

        Self {
            pods: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            capacity: Mutex::new(capacity),
            stats: Mutex::new(None),
            logs: Mutex::new(HashMap::new()),
            running_phase: Mutex::new("Running".to_string()),
            mutation_delay: Mutex::new(Duration::ZERO),
            in_flight: Mutex::new(HashMap::new()),
            max_in_flight_per_key: AtomicUsize::new(0),
        }
    }

    /// Make the next call of `operation` fail with `error`. Failures queue up.
    pub fn fail_next(&self, operation: Operation, error: Error) {
        lock(&self.failures).entry(operation).or_default().push_back(error);
    }

    /// Hold every mutating call for `delay` before applying it.
    pub fn set_mutation_delay(&self, delay: Duration) {
        *lock(&self.mutation_delay) = delay;
    }

    /// Phase reported for pods after creation.
    pub fn set_running_phase(&self, phase: &str) {
        *lock(&self.running_phase) = phase.to_string();
    }

    pub fn set_capacity(&self, capacity: BTreeMap<String, Quantity>) {
        *lock(&self.capacity) = capacity;
    }

    pub fn set_stats(&self, stats: StatsSummary) {
        *lock(&self.stats) = Some(stats);
    }

    pub fn set_logs(&self, key: &PodKey, container: &str, logs: impl Into<Bytes>) {
        lock(&self.logs).insert((key.clone(), container.to_string()), logs.into());
    }

    /// Insert a pod directly, bypassing call recording.
    pub fn insert_pod(&self, pod: Pod) {
        lock(&self.pods).insert(PodKey::of(&pod), pod);
    }

    /// Remove a pod directly, bypassing call recording.
    pub fn remove_pod(&self, key: &PodKey) -> Option<Pod> {
        lock(&self.pods).remove(key)
    }

    pub fn pod(&self, key: &PodKey) -> Option<Pod> {
        lock(&self.pods).get(key).cloned()
    }

    pub fn pod_count(&self) -> usize {
        lock(&self.pods).len()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    /// Recorded calls of one operation, in order.
    pub fn calls_of(&self, operation: Operation) -> Vec<RecordedCall> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.call.operation() == operation)
            .cloned()
            .collect()
    }

    pub fn count(&self, operation: Operation) -> usize {
        self.calls_of(operation).len()
    }

    /// Mutating calls (create, update, delete), in order.
    pub fn mutations(&self) -> Vec<ProviderCall> {
        lock(&self.calls)
            .iter()
            .filter(|c| {
                matches!(
                    c.call.operation(),
                    Operation::CreatePod | Operation::UpdatePod | Operation::DeletePod
                )
            })
            .map(|c| c.call.clone())
            .collect()
    }

    /// Highest number of calls observed in flight for a single pod key.
    pub fn max_in_flight_per_key(&self) -> usize {
        self.max_in_flight_per_key.load(Ordering::SeqCst)
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    fn record(&self, call: ProviderCall) -> Result<()> {
        let operation = call.operation();
        lock(&self.calls).push(RecordedCall {
            call,
            at: Instant::now(),
        });
        match lock(&self.failures).get_mut(&operation).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Track a mutating call for `key` while it is held.
    async fn hold(&self, ctx: &OpContext, key: &PodKey) -> Result<()> {
        let delay = *lock(&self.mutation_delay);
        let current = {
            let mut in_flight = lock(&self.in_flight);
            let count = in_flight.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        self.max_in_flight_per_key.fetch_max(current, Ordering::SeqCst);

        let result = if delay.is_zero() {
            Ok(())
        } else {
            ctx.run(None, async {
                tokio::time::sleep(delay).await;
                Ok(())
            })
            .await
        };

        if let Some(count) = lock(&self.in_flight).get_mut(key) {
            *count -= 1;
        }
        result
    }

    fn stored_with_status(&self, pod: &Pod) -> Pod {
        let mut stored = pod.clone();
        stored.status = Some(PodStatus {
            phase: Some(lock(&self.running_phase).clone()),
            ..Default::default()
        });
        stored
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn create_pod(&self, ctx: &OpContext, pod: &Pod) -> Result<()> {
        let key = PodKey::of(pod);
        info!(pod = %key, uid = ?pod::uid(pod), "[MOCK] Creating pod");
        self.hold(ctx, &key).await?;
        self.record(ProviderCall::CreatePod {
            key: key.clone(),
            uid: pod::uid(pod).map(str::to_string),
            generation: pod::generation(pod),
        })?;

        let mut pods = lock(&self.pods);
        if let Some(existing) = pods.get(&key) {
            if pod::uid(existing) == pod::uid(pod) {
                return Err(Error::AlreadyExists(format!("pod {key} already exists")));
            }
        }
        pods.insert(key, self.stored_with_status(pod));
        Ok(())
    }

    async fn update_pod(&self, ctx: &OpContext, pod: &Pod) -> Result<()> {
        let key = PodKey::of(pod);
        info!(pod = %key, generation = pod::generation(pod), "[MOCK] Updating pod");
        self.hold(ctx, &key).await?;
        self.record(ProviderCall::UpdatePod {
            key: key.clone(),
            uid: pod::uid(pod).map(str::to_string),
            generation: pod::generation(pod),
        })?;

        let mut pods = lock(&self.pods);
        let Some(existing) = pods.get_mut(&key) else {
            return Err(Error::NotFound(format!("pod {key} not found")));
        };
        let status = existing.status.take();
        *existing = pod.clone();
        existing.status = status;
        Ok(())
    }

    async fn delete_pod(&self, ctx: &OpContext, pod: &Pod) -> Result<()> {
        let key = PodKey::of(pod);
        info!(pod = %key, "[MOCK] Deleting pod");
        self.hold(ctx, &key).await?;
        self.record(ProviderCall::DeletePod {
            key: key.clone(),
            uid: pod::uid(pod).map(str::to_string),
        })?;
        lock(&self.pods).remove(&key);
        Ok(())
    }

    async fn get_pod(&self, _ctx: &OpContext, key: &PodKey) -> Result<Pod> {
        self.record(ProviderCall::GetPod(key.clone()))?;
        self.pod(key)
            .ok_or_else(|| Error::NotFound(format!("pod {key} not found")))
    }

    async fn get_pod_status(&self, _ctx: &OpContext, key: &PodKey) -> Result<PodStatus> {
        self.record(ProviderCall::GetPodStatus(key.clone()))?;
        self.pod(key)
            .map(|p| p.status.unwrap_or_default())
            .ok_or_else(|| Error::NotFound(format!("pod {key} not found")))
    }

    async fn get_pods(&self, _ctx: &OpContext) -> Result<Vec<Pod>> {
        self.record(ProviderCall::GetPods)?;
        Ok(lock(&self.pods).values().cloned().collect())
    }

    async fn get_container_logs(
        &self,
        _ctx: &OpContext,
        key: &PodKey,
        container: &str,
        options: &LogOptions,
    ) -> Result<ByteStream> {
        self.record(ProviderCall::GetContainerLogs {
            key: key.clone(),
            container: container.to_string(),
        })?;
        let logs = lock(&self.logs)
            .get(&(key.clone(), container.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no logs for {key}/{container}")))?;

        let logs = match options.tail {
            Some(tail) if tail >= 0 => {
                let text = String::from_utf8_lossy(&logs);
                let lines: Vec<&str> = text.lines().collect();
                let start = lines.len().saturating_sub(tail as usize);
                let mut tailed = lines[start..].join("\n");
                if !tailed.is_empty() {
                    tailed.push('\n');
                }
                Bytes::from(tailed)
            }
            _ => logs,
        };
        Ok(stream::iter([Ok(logs)]).boxed())
    }

    async fn run_in_container(
        &self,
        _ctx: &OpContext,
        request: &ExecRequest,
        stdin: ByteStream,
    ) -> Result<ByteStream> {
        let key = PodKey::new(&request.namespace, &request.pod_name);
        self.record(ProviderCall::RunInContainer {
            key: key.clone(),
            command: request.command.clone(),
        })?;
        if self.pod(&key).is_none() {
            return Err(Error::NotFound(format!("pod {key} not found")));
        }

        // Echo: the command line first, then stdin as it arrives.
        let banner = Bytes::from(format!("{}\n", request.command.join(" ")));
        Ok(stream::once(async move { Ok(banner) }).chain(stdin).boxed())
    }

    async fn capacity(&self, _ctx: &OpContext) -> Result<BTreeMap<String, Quantity>> {
        self.record(ProviderCall::Capacity)?;
        Ok(lock(&self.capacity).clone())
    }

    async fn node_conditions(&self, _ctx: &OpContext) -> Result<Vec<NodeCondition>> {
        self.record(ProviderCall::NodeConditions)?;
        Ok(Vec::new())
    }

    async fn node_addresses(&self, _ctx: &OpContext) -> Result<Vec<NodeAddress>> {
        self.record(ProviderCall::NodeAddresses)?;
        Ok(vec![NodeAddress {
            address: "10.0.0.10".to_string(),
            type_: "InternalIP".to_string(),
        }])
    }

    async fn node_daemon_endpoints(&self, _ctx: &OpContext) -> Result<NodeDaemonEndpoints> {
        self.record(ProviderCall::NodeDaemonEndpoints)?;
        Ok(NodeDaemonEndpoints {
            kubelet_endpoint: Some(DaemonEndpoint { port: 10250 }),
        })
    }

    async fn get_stats_summary(&self, _ctx: &OpContext) -> Result<StatsSummary> {
        self.record(ProviderCall::GetStatsSummary)?;
        lock(&self.stats)
            .clone()
            .ok_or_else(|| Error::NotFound("stats not supported".into()))
    }
}
