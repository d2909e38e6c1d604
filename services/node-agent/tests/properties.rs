//! Ordering guarantees of the reconciler under concurrent change.

mod support;

use std::time::Duration;

use k8s_openapi::api::core::v1::PodStatus;
use support::{pod, wait_for, Agent};
use vnode_agent::provider::{Operation, ProviderCall};
use vnode_agent::PodKey;

#[tokio::test]
async fn test_one_mutation_in_flight_per_pod() {
    let agent = Agent::start().await;
    agent.provider.set_mutation_delay(Duration::from_millis(20));

    let key = PodKey::new("a", "p1");
    agent.orchestrator.apply_pod(pod("a", "p1", "U1", 1));
    // A second pod proves workers still run in parallel across keys.
    agent.orchestrator.apply_pod(pod("a", "p2", "U2", 1));
    assert!(agent.applied(&key, "U1", 1).await);

    for generation in 2..=5 {
        let mut next = agent.orchestrator.pod(&key).unwrap();
        next.metadata.generation = Some(generation);
        agent.orchestrator.apply_pod(next);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(agent.applied(&key, "U1", 5).await);
    assert!(agent.applied(&PodKey::new("a", "p2"), "U2", 1).await);
    assert_eq!(agent.provider.max_in_flight_per_key(), 1);

    agent.stop().await;
}

#[tokio::test]
async fn test_uid_replacement_deletes_before_create() {
    let agent = Agent::start().await;
    let key = PodKey::new("a", "p1");
    agent.orchestrator.apply_pod(pod("a", "p1", "U1", 1));
    assert!(agent.applied(&key, "U1", 1).await);
    agent.provider.clear_calls();

    agent.orchestrator.apply_pod(pod("a", "p1", "U2", 1));
    assert!(agent.applied(&key, "U2", 1).await);

    let mutations = agent.provider.mutations();
    assert_eq!(mutations.len(), 2, "unexpected mutations: {mutations:?}");
    assert!(matches!(
        &mutations[0],
        ProviderCall::DeletePod { uid: Some(uid), .. } if uid == "U1"
    ));
    assert!(matches!(
        &mutations[1],
        ProviderCall::CreatePod { uid: Some(uid), .. } if uid == "U2"
    ));
    assert_eq!(agent.provider.count(Operation::UpdatePod), 0);

    agent.stop().await;
}

#[tokio::test]
async fn test_status_patches_follow_resource_versions() {
    let agent = Agent::start().await;
    let key = PodKey::new("a", "p1");
    agent.orchestrator.apply_pod(pod("a", "p1", "U1", 1));
    assert!(agent.applied(&key, "U1", 1).await);

    let orchestrator = agent.orchestrator.clone();
    assert!(wait_for(move || orchestrator.status_patches().len() == 1).await);

    for (n, phase) in ["Succeeded", "Failed", "Unknown"].into_iter().enumerate() {
        let mut running = agent.provider.pod(&key).unwrap();
        running.status = Some(PodStatus {
            phase: Some(phase.into()),
            ..Default::default()
        });
        agent.provider.insert_pod(running);
        agent.queue.add(key.clone());

        let orchestrator = agent.orchestrator.clone();
        assert!(
            wait_for(move || orchestrator.status_patches().len() == n + 2).await,
            "status {phase} was never reported"
        );
    }

    let versions: Vec<u64> = agent
        .orchestrator
        .status_patches()
        .iter()
        .filter(|p| p.uid.as_deref() == Some("U1"))
        .map(|p| p.resource_version.as_deref().unwrap().parse().unwrap())
        .collect();
    assert_eq!(versions.len(), 4);
    assert!(versions.windows(2).all(|w| w[0] <= w[1]), "{versions:?}");

    let last = agent.orchestrator.pod(&key).unwrap().status.unwrap();
    assert_eq!(last.phase.as_deref(), Some("Unknown"));

    agent.stop().await;
}
