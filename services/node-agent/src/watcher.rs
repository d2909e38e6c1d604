//! Orchestrator watcher.
//!
//! Keeps the pod cache in step with the pods bound to this node and feeds
//! changed keys into the work queue. Every (re)connection starts with a full
//! list that resets the baseline; the watch then continues from the list's
//! resource version. Stream failures reconnect with exponential backoff.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tracing::{debug, info, trace, warn, Instrument};
use vnode_reconcile::{BackoffPolicy, WorkQueue};

use crate::cache::PodCache;
use crate::context::OpContext;
use crate::error::{Error, Result};
use crate::orchestrator::{Orchestrator, PodEvent};
use crate::pod::{self, PodKey};

/// Watcher configuration.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub node_name: String,

    /// Delay between reconnection attempts.
    pub backoff: BackoffPolicy,
}

impl WatcherConfig {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            backoff: BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(30), 0.1),
        }
    }
}

pub struct Watcher {
    orchestrator: Arc<dyn Orchestrator>,
    cache: Arc<PodCache>,
    queue: Arc<WorkQueue<PodKey>>,
    config: WatcherConfig,
}

impl Watcher {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        cache: Arc<PodCache>,
        queue: Arc<WorkQueue<PodKey>>,
        config: WatcherConfig,
    ) -> Self {
        Self {
            orchestrator,
            cache,
            queue,
            config,
        }
    }

    /// Watch until `ctx` is cancelled.
    pub async fn run(&self, ctx: OpContext) {
        info!(node = %self.config.node_name, "Starting pod watcher");
        let mut attempt = 0u32;

        loop {
            let op = ctx.operation().with_attribute("node", &self.config.node_name);
            match self.list_and_watch(&op, &mut attempt).instrument(op.span("watch")).await {
                Ok(()) => debug!("Watch stream closed, reconnecting"),
                Err(Error::Cancelled) => break,
                Err(e) => warn!(error = %e, attempt, "Pod watch failed"),
            }

            let delay = self.config.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancelled() => break,
            }
        }

        info!("Pod watcher stopped");
    }

    async fn list_and_watch(&self, ctx: &OpContext, attempt: &mut u32) -> Result<()> {
        let resource_version = self.relist(ctx).await?;

        let mut events = self
            .orchestrator
            .watch_pods(ctx, &self.config.node_name, &resource_version)
            .await?;
        debug!(resource_version, "Watching pods");

        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Err(Error::Cancelled),
                event = events.next() => match event {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(e),
                    Some(Ok(event)) => {
                        // Backoff resets only once the watch has proven healthy.
                        *attempt = 0;
                        self.handle(event).await;
                    }
                },
            }
        }
    }

    /// List all pods for the node, reset the cache baseline and enqueue
    /// every key that changed. Returns the list resource version.
    pub async fn relist(&self, ctx: &OpContext) -> Result<String> {
        let list = self
            .orchestrator
            .list_pods(ctx, &self.config.node_name)
            .await?;

        let mut listed = HashSet::with_capacity(list.pods.len());
        let mut changed = 0usize;
        for pod in list.pods {
            let key = PodKey::of(&pod);
            listed.insert(key.clone());
            if self.cache.upsert(pod).await.changed() {
                self.queue.add(key);
                changed += 1;
            }
        }

        for key in self.cache.keys().await {
            if !listed.contains(&key) {
                debug!(pod = %key, "Pod no longer listed, removing from cache");
                self.cache.delete(&key).await;
                self.queue.add(key);
                changed += 1;
            }
        }

        info!(pods = listed.len(), changed, "Pod list synchronised");
        Ok(list.resource_version.unwrap_or_default())
    }

    async fn handle(&self, event: PodEvent) {
        match event {
            PodEvent::Added(pod) | PodEvent::Modified(pod) => {
                let key = PodKey::of(&pod);
                let outcome = self.cache.upsert(pod).await;
                if outcome.changed() {
                    self.queue.add(key);
                }
            }
            PodEvent::Deleted(pod) => {
                let key = PodKey::of(&pod);
                debug!(pod = %key, "Pod deleted in orchestrator");
                self.cache.delete_if_uid(&key, pod::uid(&pod)).await;
                self.queue.add(key);
            }
            PodEvent::Bookmark(resource_version) => {
                trace!(resource_version, "Watch bookmark");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{MockOp, MockOrchestrator};
    use crate::pod::fixtures::pod;

    fn watcher(orchestrator: Arc<MockOrchestrator>) -> Watcher {
        Watcher::new(
            orchestrator,
            Arc::new(PodCache::new()),
            Arc::new(WorkQueue::default()),
            WatcherConfig::new("vn-1"),
        )
    }

    #[tokio::test]
    async fn test_relist_sets_baseline_and_removes_unlisted() {
        let orchestrator = Arc::new(MockOrchestrator::new());
        let watcher = watcher(orchestrator.clone());
        let ctx = OpContext::background();

        watcher.cache.upsert(pod("a", "gone", "U0", 1, "1")).await;
        orchestrator.apply_pod(pod("a", "p1", "U1", 1, ""));

        watcher.relist(&ctx).await.unwrap();

        assert!(watcher.cache.get(&PodKey::new("a", "p1")).await.is_some());
        assert!(watcher.cache.get(&PodKey::new("a", "gone")).await.is_none());
        assert!(watcher.queue.contains(&PodKey::new("a", "p1")));
        assert!(watcher.queue.contains(&PodKey::new("a", "gone")));
    }

    #[tokio::test]
    async fn test_deleted_event_keeps_replacement() {
        let orchestrator = Arc::new(MockOrchestrator::new());
        let watcher = watcher(orchestrator);
        watcher.cache.upsert(pod("a", "p1", "U2", 1, "12")).await;

        watcher
            .handle(PodEvent::Deleted(pod("a", "p1", "U1", 1, "11")))
            .await;

        assert!(watcher.cache.get(&PodKey::new("a", "p1")).await.is_some());
    }

    #[tokio::test]
    async fn test_backoff_survives_watch_failing_after_relist() {
        let orchestrator = Arc::new(MockOrchestrator::new());
        let watcher = watcher(orchestrator.clone());
        let ctx = OpContext::background();

        orchestrator.fail_next(MockOp::WatchPods, Error::Retryable("unavailable".into()));
        let mut attempt = 4;
        let result = watcher.list_and_watch(&ctx, &mut attempt).await;
        assert!(result.is_err());
        assert_eq!(attempt, 4);

        let task = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move {
                while orchestrator.watcher_count() == 0 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                orchestrator.bookmark();
                orchestrator.break_watches();
            }
        });
        let result = watcher.list_and_watch(&ctx, &mut attempt).await;
        task.await.unwrap();
        assert!(result.is_err());
        assert_eq!(attempt, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_list_failure() {
        let orchestrator = Arc::new(MockOrchestrator::new());
        orchestrator.fail_next(MockOp::ListPods, Error::Retryable("unavailable".into()));
        let watcher = Arc::new(watcher(orchestrator.clone()));
        let ctx = OpContext::background();

        let task = tokio::spawn({
            let watcher = Arc::clone(&watcher);
            let ctx = ctx.clone();
            async move { watcher.run(ctx).await }
        });

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(orchestrator.watcher_count(), 1);

        orchestrator.apply_pod(pod("a", "p1", "U1", 1, ""));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(watcher.queue.contains(&PodKey::new("a", "p1")));

        ctx.cancel();
        task.await.unwrap();
    }
}
