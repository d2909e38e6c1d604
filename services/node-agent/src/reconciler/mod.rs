//! Pod reconciler.
//!
//! A fixed pool of workers pulls pod keys from the work queue and runs one
//! transition per key:
//! - Read desired state from the cache and observed state from the provider
//! - Pick a [`Transition`] with [`decide`]
//! - Apply it through the provider, then update the orchestrator and cache
//!
//! Pods are handed to the provider with literal container environments:
//! config map, secret and field references are expanded first (see
//! [`resolve_env`]).
//!
//! The queue guarantees that at most one worker holds a key, so transitions
//! for a single pod never overlap. Failures are classified by kind: transient
//! errors back off through the rate limiter, conflicts re-queue at once, and
//! terminal errors are surfaced as pod events.
//!
//! A resync loop periodically lists provider pods and re-queues every key
//! whose observed state disagrees with the cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Pod, PodStatus};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use vnode_reconcile::{WorkQueue, DEFAULT_MAX_RETRIES};

use crate::cache::PodCache;
use crate::context::OpContext;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::orchestrator::{EventRecord, Orchestrator};
use crate::pod::{self, PodKey};
use crate::provider::Provider;

mod env;
mod transition;

pub use env::{resolve_env, ResolvedEnv};
pub use transition::{decide, Transition};

/// Event reason for provider failures that will not be retried.
pub const REASON_PROVIDER_FAILED: &str = "ProviderFailed";

/// Event reason for creations refused while the node drains.
pub const REASON_NODE_DRAINING: &str = "NodeDraining";

/// Reconciler configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Number of worker tasks.
    pub workers: usize,

    /// Interval between provider resyncs.
    pub resync_interval: Duration,

    /// Rate-limited attempts before a key is failed for good.
    pub max_retries: u32,

    /// How long workers may finish their current transition on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            resync_interval: Duration::from_secs(60),
            max_retries: DEFAULT_MAX_RETRIES,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Result label of a transition that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Done,
    Skipped,
    Refused,
}

impl Applied {
    fn as_str(self) -> &'static str {
        match self {
            Self::Done => "success",
            Self::Skipped => "skipped",
            Self::Refused => "refused",
        }
    }
}

/// Drives provider state towards the pods assigned to this node.
pub struct Reconciler {
    provider: Arc<dyn Provider>,
    orchestrator: Arc<dyn Orchestrator>,
    cache: Arc<PodCache>,
    queue: Arc<WorkQueue<PodKey>>,
    metrics: Metrics,
    config: ReconcilerConfig,
    draining: AtomicBool,
}

impl Reconciler {
    pub fn new(
        provider: Arc<dyn Provider>,
        orchestrator: Arc<dyn Orchestrator>,
        cache: Arc<PodCache>,
        queue: Arc<WorkQueue<PodKey>>,
        metrics: Metrics,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            provider,
            orchestrator,
            cache,
            queue,
            metrics,
            config,
            draining: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue<PodKey>> {
        &self.queue
    }

    pub fn cache(&self) -> &Arc<PodCache> {
        &self.cache
    }

    /// Refuse new creations while `draining` is set. Deletions continue.
    pub fn set_draining(&self, draining: bool) {
        self.draining.store(draining, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Run the worker pool and the resync loop until `ctx` is cancelled.
    ///
    /// On cancellation the queue is shut down, workers get the configured
    /// grace period to finish their current transition, and any transition
    /// still running after that is cancelled.
    pub async fn run(self: Arc<Self>, ctx: OpContext) {
        info!(
            workers = self.config.workers,
            resync_interval_secs = self.config.resync_interval.as_secs(),
            "Starting reconciler"
        );

        // Workers outlive `ctx` by the shutdown grace period.
        let work = OpContext::new(CancellationToken::new())
            .with_correlation_id(ctx.correlation_id());
        let mut workers = JoinSet::new();
        for id in 0..self.config.workers {
            let reconciler = Arc::clone(&self);
            let ctx = work.clone();
            workers.spawn(async move { reconciler.run_worker(id, ctx).await });
        }

        let mut resync = tokio::time::interval(self.config.resync_interval);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        resync.tick().await;

        loop {
            tokio::select! {
                _ = resync.tick() => {
                    let op = ctx.operation();
                    match self.resync(&op).instrument(op.span("resync")).await {
                        Ok(enqueued) => debug!(enqueued, "Resync complete"),
                        Err(Error::Cancelled) => {}
                        Err(e) => warn!(error = %e, "Resync failed"),
                    }
                }
                _ = ctx.cancelled() => {
                    info!("Reconciler shutting down");
                    break;
                }
            }
        }

        if !self.queue.shut_down_with_drain(self.config.shutdown_grace).await {
            warn!(
                grace_secs = self.config.shutdown_grace.as_secs(),
                "Workers did not finish within grace period, cancelling"
            );
        }
        work.cancel();
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Reconciler worker panicked");
            }
        }
        info!("Reconciler stopped");
    }

    async fn run_worker(&self, id: usize, ctx: OpContext) {
        debug!(worker = id, "Worker started");
        while let Ok(key) = self.queue.get().await {
            self.metrics.set_queue_depth(self.queue.len());
            let op = ctx.operation().with_attribute("pod", &key);
            self.process(&op, &key)
                .instrument(op.span("reconcile"))
                .await;
            self.queue.done(&key);
        }
        debug!(worker = id, "Worker stopped");
    }

    /// Run one transition for `key` and handle its outcome.
    pub async fn process(&self, ctx: &OpContext, key: &PodKey) {
        let desired = self.cache.get(key).await;
        let desired_pod = desired.as_ref().map(|d| d.pod.clone());

        let observed = match self.observe(ctx, key).await {
            Ok(observed) => observed,
            Err(e) => {
                self.handle_failure(ctx, key, "observe", desired_pod.as_ref(), e)
                    .await;
                return;
            }
        };

        let transition = decide(desired.as_ref(), observed.as_ref());
        let name = transition.name();
        debug!(pod = %key, transition = name, "Applying transition");

        match self.apply(ctx, key, transition).await {
            Ok(applied) => {
                self.queue.forget(key);
                self.metrics.record_reconcile(name, applied.as_str());
            }
            Err(e) => {
                self.handle_failure(ctx, key, name, desired_pod.as_ref(), e)
                    .await
            }
        }
    }

    async fn observe(&self, ctx: &OpContext, key: &PodKey) -> Result<Option<Pod>> {
        match self.provider.get_pod(ctx, key).await {
            Ok(pod) => Ok(Some(pod)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn apply(&self, ctx: &OpContext, key: &PodKey, transition: Transition) -> Result<Applied> {
        match transition {
            Transition::Forget => {
                debug!(pod = %key, "Pod absent everywhere, forgetting");
                Ok(Applied::Done)
            }
            Transition::Create(desired) => self.create(ctx, key, &desired).await,
            Transition::Update(desired) => self.update(ctx, key, &desired).await,
            Transition::Delete {
                observed,
                finalize,
                recreate,
            } => {
                self.delete(ctx, key, observed.as_ref(), finalize.as_ref(), recreate)
                    .await
            }
            Transition::StatusSync { desired, .. } => self.sync_status(ctx, key, &desired).await,
        }
    }

    async fn create(&self, ctx: &OpContext, key: &PodKey, desired: &Pod) -> Result<Applied> {
        if self.is_draining() {
            info!(pod = %key, "Node is draining, refusing to create pod");
            let event = EventRecord::warning(
                REASON_NODE_DRAINING,
                "node is draining and does not accept new pods",
            );
            self.record_event(ctx, desired, &event).await;
            return Ok(Applied::Refused);
        }

        let resolved = self.expand_env(ctx, desired).await?;
        let uid = pod::uid(desired);
        info!(pod = %key, uid = ?uid, "Creating pod in provider");
        match self.provider.create_pod(ctx, &resolved).await {
            Ok(()) => {}
            Err(Error::AlreadyExists(message)) => {
                debug!(pod = %key, detail = %message, "Pod already exists in provider");
            }
            Err(e) => return Err(e),
        }

        self.cache
            .set_last_applied(key, uid, pod::generation(desired))
            .await;
        // Pick up the first status from the provider.
        self.queue.add(key.clone());
        Ok(Applied::Done)
    }

    async fn update(&self, ctx: &OpContext, key: &PodKey, desired: &Pod) -> Result<Applied> {
        let generation = pod::generation(desired);
        let resolved = self.expand_env(ctx, desired).await?;
        info!(pod = %key, generation, "Updating pod in provider");
        match self.provider.update_pod(ctx, &resolved).await {
            Ok(()) => {
                self.cache
                    .set_last_applied(key, pod::uid(desired), generation)
                    .await;
                Ok(Applied::Done)
            }
            Err(Error::NotFound(message)) => {
                debug!(pod = %key, detail = %message, "Pod vanished from provider, re-queueing");
                self.queue.add(key.clone());
                Ok(Applied::Skipped)
            }
            Err(e) => Err(e),
        }
    }

    /// Expand container environments, recording warnings against `desired`.
    async fn expand_env(&self, ctx: &OpContext, desired: &Pod) -> Result<Pod> {
        let resolved = resolve_env(ctx, self.orchestrator.as_ref(), desired).await?;
        for warning in &resolved.warnings {
            self.record_event(ctx, desired, warning).await;
        }
        Ok(resolved.pod)
    }

    async fn delete(
        &self,
        ctx: &OpContext,
        key: &PodKey,
        observed: Option<&Pod>,
        finalize: Option<&Pod>,
        recreate: bool,
    ) -> Result<Applied> {
        if let Some(observed) = observed {
            info!(pod = %key, uid = ?pod::uid(observed), "Deleting pod from provider");
            self.provider.delete_pod(ctx, observed).await?;
        }

        if let Some(desired) = finalize {
            self.orchestrator
                .remove_pod_finalizers_and_delete(ctx, desired)
                .await?;
            self.cache.delete_if_uid(key, pod::uid(desired)).await;
            info!(pod = %key, "Pod deleted");
        }

        if recreate {
            debug!(pod = %key, "Stale pod removed, re-queueing for creation");
            self.queue.add(key.clone());
        }
        Ok(Applied::Done)
    }

    async fn sync_status(&self, ctx: &OpContext, key: &PodKey, desired: &Pod) -> Result<Applied> {
        let status = self.provider.get_pod_status(ctx, key).await?;

        if self.cache.get(key).await.is_some_and(|c| c.last_applied_generation.is_none()) {
            self.cache
                .set_last_applied(key, pod::uid(desired), pod::generation(desired))
                .await;
        }

        if desired.status.as_ref() == Some(&status) {
            return Ok(Applied::Skipped);
        }

        debug!(pod = %key, phase = pod::phase(&status), "Patching pod status");
        let updated = self.orchestrator.patch_pod_status(ctx, desired, &status).await?;
        self.cache.upsert(updated).await;
        Ok(Applied::Done)
    }

    async fn handle_failure(
        &self,
        ctx: &OpContext,
        key: &PodKey,
        transition: &'static str,
        desired: Option<&Pod>,
        error: Error,
    ) {
        match error {
            Error::Cancelled => {
                debug!(pod = %key, transition, "Transition cancelled");
                self.metrics.record_reconcile(transition, "cancelled");
            }
            Error::Conflict(message) => {
                debug!(pod = %key, transition, detail = %message, "Conflict, re-queueing");
                self.refresh(ctx, key).await;
                self.queue.add(key.clone());
                self.metrics.record_reconcile(transition, "conflict");
            }
            Error::NotFound(message) => {
                debug!(pod = %key, transition, detail = %message, "Target vanished, waiting for next event");
                self.queue.forget(key);
                self.metrics.record_reconcile(transition, "not_found");
            }
            e if e.is_retryable() => {
                let attempts = self.queue.num_requeues(key);
                if attempts >= self.config.max_retries {
                    let e = Error::Internal(format!("giving up after {attempts} retries: {e}"));
                    self.fail(ctx, key, transition, desired, &e).await;
                    return;
                }
                let delay = self.queue.add_rate_limited(key.clone());
                warn!(
                    pod = %key,
                    transition,
                    error = %e,
                    attempt = attempts + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Transition failed, backing off"
                );
                self.metrics.record_reconcile(transition, "retry");
            }
            e => self.fail(ctx, key, transition, desired, &e).await,
        }
    }

    /// Terminal failure: record an event, mark the pod failed, drop the key.
    async fn fail(
        &self,
        ctx: &OpContext,
        key: &PodKey,
        transition: &'static str,
        desired: Option<&Pod>,
        error: &Error,
    ) {
        error!(pod = %key, transition, kind = error.kind(), error = %error, "Transition failed permanently");
        self.queue.forget(key);
        self.metrics.record_reconcile(transition, "failed");

        let Some(desired) = desired else {
            return;
        };

        let tag = match transition {
            "create" => "ProviderCreateFailed",
            "update" => "ProviderUpdateFailed",
            "delete" => "ProviderDeleteFailed",
            _ => REASON_PROVIDER_FAILED,
        };
        let event = EventRecord::warning(REASON_PROVIDER_FAILED, format!("{tag}: {error}"));
        self.record_event(ctx, desired, &event).await;

        if matches!(transition, "create" | "update") {
            let status = failed_status(desired, error);
            match self.orchestrator.patch_pod_status(ctx, desired, &status).await {
                Ok(updated) => {
                    self.cache.upsert(updated).await;
                }
                Err(e) => warn!(pod = %key, error = %e, "Failed to mark pod as failed"),
            }
        }
    }

    async fn record_event(&self, ctx: &OpContext, pod: &Pod, event: &EventRecord) {
        if let Err(e) = self.orchestrator.create_event(ctx, pod, event).await {
            warn!(pod = %PodKey::of(pod), reason = %event.reason, error = %e, "Failed to record event");
        }
    }

    /// Reload `key` from the orchestrator after a conflict.
    async fn refresh(&self, ctx: &OpContext, key: &PodKey) {
        match self.orchestrator.get_pod(ctx, key).await {
            Ok(pod) => {
                self.cache.upsert(pod).await;
            }
            Err(e) => debug!(pod = %key, error = %e, "Failed to refresh pod after conflict"),
        }
    }

    /// Compare provider pods with the cache and re-queue disagreements.
    ///
    /// Returns the number of keys enqueued.
    pub async fn resync(&self, ctx: &OpContext) -> Result<usize> {
        let observed: HashMap<PodKey, Pod> = self
            .provider
            .get_pods(ctx)
            .await?
            .into_iter()
            .map(|p| (PodKey::of(&p), p))
            .collect();
        let desired = self.cache.snapshot().await;

        let mut enqueued = 0;
        for (key, pod) in &observed {
            let stale = match desired.get(key) {
                None => true,
                Some(cached) => {
                    cached.uid() != pod::uid(pod)
                        || (pod.status.is_some() && cached.pod.status != pod.status)
                }
            };
            if stale {
                debug!(pod = %key, "Resync found provider pod out of sync");
                self.queue.add(key.clone());
                enqueued += 1;
            }
        }
        for key in desired.keys().filter(|k| !observed.contains_key(*k)) {
            debug!(pod = %key, "Resync found pod missing from provider");
            self.queue.add(key.clone());
            enqueued += 1;
        }

        self.metrics.set_queue_depth(self.queue.len());
        Ok(enqueued)
    }
}

/// Status reported for a pod the provider refused.
fn failed_status(desired: &Pod, error: &Error) -> PodStatus {
    let phase = if pod::restart_policy(desired) == "Never" {
        "Failed"
    } else {
        "Pending"
    };
    PodStatus {
        phase: Some(phase.to_string()),
        reason: Some(REASON_PROVIDER_FAILED.to_string()),
        message: Some(error.to_string()),
        ..desired.status.clone().unwrap_or_default()
    }
}
