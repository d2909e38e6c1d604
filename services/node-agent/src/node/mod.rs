//! Virtual node lifecycle.
//!
//! The controller moves the node through
//! `Unregistered → Registering → Ready → Draining → Terminated`:
//! - Registration creates the node object (adopting an existing one) and
//!   confirms it Ready
//! - Heartbeats publish capacity and conditions from the provider, or renew
//!   the node lease when leases are enabled
//! - Drain cordons the node and waits for the provider to run dry
//! - Termination deletes the node object
//!
//! Three consecutive failed heartbeats are escalated to the supervisor; the
//! node object is left in place.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::{NodeCondition, Taint};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

use crate::cache::PodCache;
use crate::context::OpContext;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::orchestrator::Orchestrator;
use crate::pod::PodKey;
use crate::provider::Provider;

mod status;

pub use status::{
    build_node, is_ready, next_conditions, node_status, NodeFacts, Readiness, CONDITION_READY,
    REASON_PROVIDER_UNREACHABLE,
};

/// Consecutive heartbeat failures that trigger escalation.
pub const ESCALATION_THRESHOLD: u32 = 3;

/// Lifecycle state of the virtual node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unregistered,
    Registering,
    Ready,
    Draining,
    Terminated,
}

/// Raised when heartbeats keep failing.
#[derive(Debug, Clone)]
pub struct Escalation {
    pub consecutive_failures: u32,
    pub error: Error,
}

/// How a drain ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed,
    TimedOut { remaining: Vec<PodKey> },
}

/// Node controller configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub name: String,
    pub operating_system: String,
    pub architecture: String,
    pub kubelet_version: String,
    /// Fallback address when the provider reports no internal IP.
    pub internal_ip: Option<String>,
    /// Port of the inbound API, advertised as the kubelet endpoint.
    pub daemon_port: i32,
    /// Taint registered on the node.
    pub taint: Taint,

    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// With leases on, full status patches are sent at this interval.
    pub status_update_interval: Duration,
    pub enable_lease: bool,
    pub lease_duration: Duration,

    pub graceful_timeout: Duration,
    pub drain_poll_interval: Duration,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operating_system: "linux".to_string(),
            architecture: "amd64".to_string(),
            kubelet_version: format!("v{}-vnode", env!("CARGO_PKG_VERSION")),
            internal_ip: None,
            daemon_port: 10250,
            taint: Taint {
                key: "virtual-kubelet.io/provider".to_string(),
                value: Some("http".to_string()),
                effect: "NoSchedule".to_string(),
                time_added: None,
            },
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            status_update_interval: Duration::from_secs(60),
            enable_lease: false,
            lease_duration: Duration::from_secs(40),
            graceful_timeout: Duration::from_secs(60),
            drain_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Taint applied when the node is cordoned for drain.
fn cordon_taint() -> Taint {
    Taint {
        key: "node.kubernetes.io/unschedulable".to_string(),
        value: None,
        effect: "NoSchedule".to_string(),
        time_added: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(Utc::now())),
    }
}

#[derive(Default)]
struct Heartbeat {
    facts: NodeFacts,
    conditions: Vec<NodeCondition>,
    consecutive_failures: u32,
    last_status_patch: Option<Instant>,
}

pub struct NodeController {
    config: NodeConfig,
    provider: Arc<dyn Provider>,
    orchestrator: Arc<dyn Orchestrator>,
    metrics: Metrics,
    state: watch::Sender<NodeState>,
    escalations: mpsc::Sender<Escalation>,
    heartbeat: Mutex<Heartbeat>,
}

impl NodeController {
    pub fn new(
        config: NodeConfig,
        provider: Arc<dyn Provider>,
        orchestrator: Arc<dyn Orchestrator>,
        metrics: Metrics,
        escalations: mpsc::Sender<Escalation>,
    ) -> Self {
        let (state, _) = watch::channel(NodeState::Unregistered);
        Self {
            config,
            provider,
            orchestrator,
            metrics,
            state,
            escalations,
            heartbeat: Mutex::new(Heartbeat::default()),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn state(&self) -> NodeState {
        *self.state.borrow()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<NodeState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: NodeState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(node = %self.config.name, from = ?previous, to = ?state, "Node state changed");
        }
    }

    fn heartbeat_state(&self) -> MutexGuard<'_, Heartbeat> {
        self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.heartbeat_state().consecutive_failures
    }

    async fn fetch_facts(&self, ctx: &OpContext) -> Result<NodeFacts> {
        Ok(NodeFacts {
            capacity: self.provider.capacity(ctx).await?,
            conditions: self.provider.node_conditions(ctx).await?,
            addresses: self.provider.node_addresses(ctx).await?,
            endpoints: self.provider.node_daemon_endpoints(ctx).await?,
        })
    }

    /// Register the node and confirm it Ready.
    pub async fn register(&self, ctx: &OpContext) -> Result<()> {
        self.set_state(NodeState::Registering);

        let facts = ctx
            .run(Some(self.config.heartbeat_timeout), self.fetch_facts(ctx))
            .await?;
        let conditions = next_conditions(&[], &facts.conditions, &Readiness::Pending, Utc::now());
        let node = build_node(
            &self.config,
            node_status(&self.config, &facts, conditions.clone()),
        );

        match self.orchestrator.create_node(ctx, &node).await {
            Ok(_) => info!(node = %self.config.name, "Registered node"),
            Err(Error::AlreadyExists(_)) => {
                info!(node = %self.config.name, "Node already registered, adopting it");
            }
            Err(e) => return Err(e),
        }

        {
            let mut heartbeat = self.heartbeat_state();
            heartbeat.facts = facts;
            heartbeat.conditions = conditions;
        }

        self.heartbeat(ctx).await?;
        self.set_state(NodeState::Ready);
        Ok(())
    }

    /// Send one heartbeat.
    ///
    /// If the provider is unreachable the node is still patched, with the
    /// last known capacity and Ready=False, and the heartbeat counts as
    /// failed.
    pub async fn heartbeat(&self, ctx: &OpContext) -> Result<()> {
        let fetched = ctx
            .run(Some(self.config.heartbeat_timeout), self.fetch_facts(ctx))
            .await;
        if let Err(Error::Cancelled) = fetched {
            return Err(Error::Cancelled);
        }

        let (status, provider_error, ready_changed, patch_due) = {
            let mut heartbeat = self.heartbeat_state();
            let (readiness, provider_error) = match fetched {
                Ok(facts) => {
                    heartbeat.facts = facts;
                    (Readiness::Reachable, None)
                }
                Err(e) => (Readiness::Unreachable(e.to_string()), Some(e)),
            };

            let was_ready = is_ready(&heartbeat.conditions);
            let conditions = next_conditions(
                &heartbeat.conditions,
                &heartbeat.facts.conditions,
                &readiness,
                Utc::now(),
            );
            let ready_changed = was_ready != is_ready(&conditions);
            heartbeat.conditions = conditions.clone();

            let patch_due = heartbeat
                .last_status_patch
                .map_or(true, |at| at.elapsed() >= self.config.status_update_interval);
            (
                node_status(&self.config, &heartbeat.facts, conditions),
                provider_error,
                ready_changed,
                patch_due,
            )
        };

        let name = &self.config.name;
        if self.config.enable_lease {
            let duration = i32::try_from(self.config.lease_duration.as_secs()).unwrap_or(i32::MAX);
            ctx.run(
                Some(self.config.heartbeat_timeout),
                self.orchestrator.renew_lease(ctx, name, duration),
            )
            .await?;
        }

        if !self.config.enable_lease || patch_due || ready_changed || provider_error.is_some() {
            ctx.run(
                Some(self.config.heartbeat_timeout),
                self.orchestrator.patch_node_status(ctx, name, &status),
            )
            .await?;
            self.heartbeat_state().last_status_patch = Some(Instant::now());
        }

        match provider_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Heartbeat until `ctx` is cancelled.
    pub async fn run(&self, ctx: OpContext) {
        info!(
            node = %self.config.name,
            interval_secs = self.config.heartbeat_interval.as_secs_f64(),
            lease = self.config.enable_lease,
            "Starting heartbeat loop"
        );

        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let op = ctx.operation();
                    let result = self.heartbeat(&op).instrument(op.span("heartbeat")).await;
                    self.record_heartbeat(result).await;
                }
                _ = ctx.cancelled() => {
                    info!("Heartbeat loop shutting down");
                    break;
                }
            }
        }
    }

    async fn record_heartbeat(&self, result: Result<()>) {
        let error = match result {
            Ok(()) => {
                self.heartbeat_state().consecutive_failures = 0;
                debug!(node = %self.config.name, "Heartbeat acknowledged");
                return;
            }
            Err(Error::Cancelled) => return,
            Err(e) => e,
        };

        self.metrics.inc_heartbeat_failures();
        let consecutive_failures = {
            let mut heartbeat = self.heartbeat_state();
            heartbeat.consecutive_failures += 1;
            heartbeat.consecutive_failures
        };

        if consecutive_failures <= ESCALATION_THRESHOLD {
            warn!(error = %error, consecutive_failures, "Heartbeat failed");
        } else {
            error!(error = %error, consecutive_failures, "Heartbeat failed repeatedly");
        }

        if consecutive_failures == ESCALATION_THRESHOLD {
            let escalation = Escalation {
                consecutive_failures,
                error,
            };
            if self.escalations.send(escalation).await.is_err() {
                debug!("No supervisor listening for heartbeat escalation");
            }
        }
    }

    /// Cordon the node and wait for the provider to report no pods.
    ///
    /// Gives up after the graceful timeout and reports the pods still in
    /// `cache`.
    pub async fn drain(&self, ctx: &OpContext, cache: &PodCache) -> DrainOutcome {
        self.set_state(NodeState::Draining);

        if let Err(e) = self
            .orchestrator
            .cordon_node(ctx, &self.config.name, &cordon_taint())
            .await
        {
            warn!(node = %self.config.name, error = %e, "Failed to cordon node");
        }

        let deadline = Instant::now() + self.config.graceful_timeout;
        loop {
            match self.provider.get_pods(ctx).await {
                Ok(pods) if pods.is_empty() => {
                    info!(node = %self.config.name, "Drain complete");
                    return DrainOutcome::Completed;
                }
                Ok(pods) => debug!(remaining = pods.len(), "Waiting for pods to terminate"),
                Err(e) => debug!(error = %e, "Failed to list provider pods during drain"),
            }

            if Instant::now() >= deadline || ctx.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline.min(Instant::now() + self.config.drain_poll_interval)) => {}
                _ = ctx.cancelled() => break,
            }
        }

        let remaining = cache.keys().await;
        let pods: Vec<String> = remaining.iter().map(ToString::to_string).collect();
        warn!(
            node = %self.config.name,
            remaining = pods.len(),
            pods = ?pods,
            "Drain timed out with pods remaining"
        );
        DrainOutcome::TimedOut { remaining }
    }

    /// Delete the node object.
    pub async fn terminate(&self, ctx: &OpContext) -> Result<()> {
        let result = self.orchestrator.delete_node(ctx, &self.config.name).await;
        match &result {
            Ok(()) => info!(node = %self.config.name, "Node deleted"),
            Err(e) => error!(node = %self.config.name, error = %e, "Failed to delete node"),
        }
        self.set_state(NodeState::Terminated);
        result
    }
}
