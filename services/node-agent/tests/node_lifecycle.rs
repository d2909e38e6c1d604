//! Node registration, heartbeat and shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use vnode_agent::metrics::Metrics;
use vnode_agent::node::DrainOutcome;
use vnode_agent::{
    MockOrchestrator, MockProvider, NodeConfig, NodeController, NodeState, OpContext, PodCache,
};

fn controller(
    provider: &Arc<MockProvider>,
    orchestrator: &Arc<MockOrchestrator>,
) -> (NodeController, mpsc::Receiver<vnode_agent::node::Escalation>) {
    let mut config = NodeConfig::new("vn-1");
    config.heartbeat_interval = Duration::from_secs(1);
    let (tx, rx) = mpsc::channel(1);
    let controller = NodeController::new(
        config,
        provider.clone(),
        orchestrator.clone(),
        Metrics::new().unwrap(),
        tx,
    );
    (controller, rx)
}

fn ready_status(status: &k8s_openapi::api::core::v1::NodeStatus) -> Option<&str> {
    status
        .conditions
        .as_deref()?
        .iter()
        .find(|c| c.type_ == "Ready")
        .map(|c| c.status.as_str())
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_reports_ready_every_interval() {
    let provider = Arc::new(MockProvider::new());
    let orchestrator = Arc::new(MockOrchestrator::new());
    let (controller, _escalations) = controller(&provider, &orchestrator);
    let controller = Arc::new(controller);

    let root = OpContext::background();
    controller.register(&root).await.unwrap();
    let before = orchestrator.node_patches().len();

    let ctx = root.child();
    let task = tokio::spawn({
        let controller = Arc::clone(&controller);
        let ctx = ctx.clone();
        async move { controller.run(ctx).await }
    });

    tokio::time::sleep(Duration::from_millis(3500)).await;
    ctx.cancel();
    task.await.unwrap();

    let patches = orchestrator.node_patches();
    let heartbeats = &patches[before..];
    assert!(heartbeats.len() >= 3, "only {} heartbeats", heartbeats.len());
    assert!(heartbeats
        .iter()
        .all(|(_, status)| ready_status(status) == Some("True")));
    assert_eq!(controller.consecutive_failures(), 0);
}

#[tokio::test]
async fn test_shutdown_cordons_drains_and_deletes_node() {
    let provider = Arc::new(MockProvider::new());
    let orchestrator = Arc::new(MockOrchestrator::new());
    let (controller, _escalations) = controller(&provider, &orchestrator);
    let ctx = OpContext::background();

    controller.register(&ctx).await.unwrap();
    assert_eq!(controller.state(), NodeState::Ready);

    let outcome = controller.drain(&ctx, &PodCache::new()).await;
    assert_eq!(outcome, DrainOutcome::Completed);
    assert!(orchestrator.cordon_taint().is_some());

    controller.terminate(&ctx).await.unwrap();
    assert!(orchestrator.node_deleted());
    assert_eq!(controller.state(), NodeState::Terminated);
}
