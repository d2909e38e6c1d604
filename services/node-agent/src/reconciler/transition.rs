//! Transition function.
//!
//! Given the desired record from the cache and the pod observed in the
//! provider, pick the single step that moves the pod closer to convergence.

use k8s_openapi::api::core::v1::Pod;

use crate::cache::CachedPod;
use crate::pod;

/// One reconciliation step.
#[derive(Debug, Clone)]
pub enum Transition {
    /// Desired pod is missing from the provider.
    Create(Pod),

    /// Desired generation is ahead of what the provider last received.
    Update(Pod),

    /// Remove `observed` from the provider (if present), then release
    /// `finalize` on the orchestrator side (if set).
    Delete {
        observed: Option<Pod>,
        finalize: Option<Pod>,
        /// The desired pod still exists under another UID and must be
        /// created once the stale one is gone.
        recreate: bool,
    },

    /// Spec is in sync; copy the provider status to the orchestrator.
    StatusSync { desired: Pod, observed: Pod },

    /// Nothing on either side.
    Forget,
}

impl Transition {
    /// Label used in logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Update(_) => "update",
            Self::Delete { .. } => "delete",
            Self::StatusSync { .. } => "status_sync",
            Self::Forget => "forget",
        }
    }
}

/// Decide the next step for one pod key.
pub fn decide(desired: Option<&CachedPod>, observed: Option<&Pod>) -> Transition {
    let Some(desired) = desired else {
        return match observed {
            None => Transition::Forget,
            Some(observed) => Transition::Delete {
                observed: Some(observed.clone()),
                finalize: None,
                recreate: false,
            },
        };
    };

    let deleting = pod::is_deleting(&desired.pod);
    let Some(observed) = observed else {
        return if deleting {
            Transition::Delete {
                observed: None,
                finalize: Some(desired.pod.clone()),
                recreate: false,
            }
        } else {
            Transition::Create(desired.pod.clone())
        };
    };

    if deleting {
        return Transition::Delete {
            observed: Some(observed.clone()),
            finalize: Some(desired.pod.clone()),
            recreate: false,
        };
    }

    if pod::uid(observed) != desired.uid() {
        return Transition::Delete {
            observed: Some(observed.clone()),
            finalize: None,
            recreate: true,
        };
    }

    let generation = pod::generation(&desired.pod);
    let applied = desired
        .last_applied_generation
        .or(observed.metadata.generation)
        .unwrap_or(generation);
    if generation > applied {
        return Transition::Update(desired.pod.clone());
    }

    Transition::StatusSync {
        desired: desired.pod.clone(),
        observed: observed.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::fixtures::pod;
    use chrono::Utc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn cached(pod: Pod, applied: Option<i64>) -> CachedPod {
        CachedPod {
            pod,
            last_applied_generation: applied,
        }
    }

    fn deleting(mut pod: Pod) -> Pod {
        pod.metadata.deletion_timestamp = Some(Time(Utc::now()));
        pod
    }

    #[test]
    fn test_nothing_anywhere_is_forget() {
        assert!(matches!(decide(None, None), Transition::Forget));
    }

    #[test]
    fn test_missing_in_provider_is_create() {
        let desired = cached(pod("a", "p1", "U1", 1, "10"), None);
        assert!(matches!(decide(Some(&desired), None), Transition::Create(_)));
    }

    #[test]
    fn test_orphan_in_provider_is_delete_without_finalize() {
        let observed = pod("a", "p1", "U1", 1, "10");
        match decide(None, Some(&observed)) {
            Transition::Delete {
                observed: Some(_),
                finalize: None,
                recreate: false,
            } => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_deleting_pod_is_deleted_and_finalized() {
        let desired = cached(deleting(pod("a", "p1", "U1", 1, "11")), Some(1));
        let observed = pod("a", "p1", "U1", 1, "10");
        match decide(Some(&desired), Some(&observed)) {
            Transition::Delete {
                observed: Some(_),
                finalize: Some(_),
                ..
            } => {}
            other => panic!("unexpected {other:?}"),
        }

        match decide(Some(&desired), None) {
            Transition::Delete {
                observed: None,
                finalize: Some(_),
                ..
            } => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_uid_mismatch_deletes_stale_then_recreates() {
        let desired = cached(pod("a", "p1", "U2", 1, "12"), None);
        let observed = pod("a", "p1", "U1", 3, "10");
        match decide(Some(&desired), Some(&observed)) {
            Transition::Delete {
                observed: Some(stale),
                finalize: None,
                recreate: true,
            } => assert_eq!(pod::uid(&stale), Some("U1")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_newer_generation_is_update() {
        let desired = cached(pod("a", "p1", "U1", 2, "11"), Some(1));
        let observed = pod("a", "p1", "U1", 1, "10");
        assert!(matches!(
            decide(Some(&desired), Some(&observed)),
            Transition::Update(_)
        ));
    }

    #[test]
    fn test_applied_generation_falls_back_to_observed() {
        let desired = cached(pod("a", "p1", "U1", 2, "11"), None);
        let observed = pod("a", "p1", "U1", 2, "10");
        assert!(matches!(
            decide(Some(&desired), Some(&observed)),
            Transition::StatusSync { .. }
        ));
    }

    #[test]
    fn test_in_sync_is_status_sync() {
        let desired = cached(pod("a", "p1", "U1", 1, "10"), Some(1));
        let observed = pod("a", "p1", "U1", 1, "10");
        let transition = decide(Some(&desired), Some(&observed));
        assert_eq!(transition.name(), "status_sync");
    }
}
