//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::task::JoinHandle;
use vnode_agent::metrics::Metrics;
use vnode_agent::{
    MockOrchestrator, MockProvider, OpContext, PodCache, PodKey, Reconciler, ReconcilerConfig,
    Watcher, WatcherConfig,
};
use vnode_reconcile::WorkQueue;

pub const NODE: &str = "vn-1";

/// Pod bound to [`NODE`].
pub fn pod(ns: &str, name: &str, uid: &str, generation: i64) -> Pod {
    Pod {
        metadata: ObjectMeta {
            namespace: Some(ns.into()),
            name: Some(name.into()),
            uid: Some(uid.into()),
            generation: Some(generation),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(NODE.into()),
            containers: vec![Container {
                name: "app".into(),
                image: Some("nginx:1.25".into()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    }
}

/// Poll `check` every few milliseconds for up to five seconds.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

/// Like [`eventually`] for checks that do not await.
pub async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    eventually(move || std::future::ready(check())).await
}

/// Watcher and reconciler wired to in-memory collaborators.
pub struct Agent {
    pub provider: Arc<MockProvider>,
    pub orchestrator: Arc<MockOrchestrator>,
    pub cache: Arc<PodCache>,
    pub queue: Arc<WorkQueue<PodKey>>,
    pub reconciler: Arc<Reconciler>,
    pub metrics: Metrics,
    watcher_ctx: OpContext,
    reconciler_ctx: OpContext,
    watcher_task: JoinHandle<()>,
    reconciler_task: JoinHandle<()>,
}

impl Agent {
    pub async fn start() -> Self {
        Self::start_with(ReconcilerConfig {
            workers: 4,
            ..Default::default()
        })
        .await
    }

    pub async fn start_with(config: ReconcilerConfig) -> Self {
        let provider = Arc::new(MockProvider::new());
        let orchestrator = Arc::new(MockOrchestrator::new());
        let cache = Arc::new(PodCache::new());
        let queue = Arc::new(WorkQueue::default());
        let metrics = Metrics::new().unwrap();

        let reconciler = Arc::new(Reconciler::new(
            provider.clone(),
            orchestrator.clone(),
            cache.clone(),
            queue.clone(),
            metrics.clone(),
            config,
        ));
        let watcher = Arc::new(Watcher::new(
            orchestrator.clone(),
            cache.clone(),
            queue.clone(),
            WatcherConfig::new(NODE),
        ));

        let root = OpContext::background();
        let watcher_ctx = root.child();
        let reconciler_ctx = root.child();
        let watcher_task = tokio::spawn({
            let ctx = watcher_ctx.clone();
            async move { watcher.run(ctx).await }
        });
        let reconciler_task = tokio::spawn(Arc::clone(&reconciler).run(reconciler_ctx.clone()));

        let connected = {
            let orchestrator = orchestrator.clone();
            eventually(move || {
                let orchestrator = orchestrator.clone();
                async move { orchestrator.watcher_count() == 1 }
            })
            .await
        };
        assert!(connected, "watcher never connected");

        Self {
            provider,
            orchestrator,
            cache,
            queue,
            reconciler,
            metrics,
            watcher_ctx,
            reconciler_ctx,
            watcher_task,
            reconciler_task,
        }
    }

    /// Wait until the cache reports `uid` under `key` with `generation` applied.
    pub async fn applied(&self, key: &PodKey, uid: &str, generation: i64) -> bool {
        eventually(move || async move {
            self.cache.get(key).await.is_some_and(|c| {
                c.uid() == Some(uid) && c.last_applied_generation == Some(generation)
            })
        })
        .await
    }

    pub async fn stop(self) {
        self.watcher_ctx.cancel();
        self.watcher_task.await.unwrap();
        self.reconciler_ctx.cancel();
        self.reconciler_task.await.unwrap();
    }
}
