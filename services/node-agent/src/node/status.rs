//! Node object and status construction.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    DaemonEndpoint, Node, NodeAddress, NodeCondition, NodeDaemonEndpoints, NodeSpec, NodeStatus,
    NodeSystemInfo,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

use super::NodeConfig;

pub const CONDITION_READY: &str = "Ready";

/// Reason set on the Ready condition when the provider cannot be reached.
pub const REASON_PROVIDER_UNREACHABLE: &str = "ProviderUnreachable";

const DEFAULT_CONDITIONS: [(&str, &str, &str, &str); 5] = [
    (CONDITION_READY, "False", "KubeletPending", "virtual node is starting"),
    ("MemoryPressure", "False", "KubeletHasSufficientMemory", "virtual node has sufficient memory available"),
    ("DiskPressure", "False", "KubeletHasNoDiskPressure", "virtual node has no disk pressure"),
    ("PIDPressure", "False", "KubeletHasSufficientPID", "virtual node has sufficient PID available"),
    ("NetworkUnavailable", "False", "RouteCreated", "virtual node has a working network"),
];

/// Node facts reported by the provider.
#[derive(Debug, Clone, Default)]
pub struct NodeFacts {
    pub capacity: BTreeMap<String, Quantity>,
    pub conditions: Vec<NodeCondition>,
    pub addresses: Vec<NodeAddress>,
    pub endpoints: NodeDaemonEndpoints,
}

/// Readiness decided for one heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Registered but not yet confirmed.
    Pending,
    /// Provider answered; use its Ready condition if it reported one.
    Reachable,
    /// Provider could not be reached.
    Unreachable(String),
}

fn condition(type_: &str, status: &str, reason: &str, message: &str, now: DateTime<Utc>) -> NodeCondition {
    NodeCondition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        last_heartbeat_time: Some(Time(now)),
        last_transition_time: Some(Time(now)),
    }
}

/// Next set of node conditions.
///
/// Provider-reported conditions override the defaults by type. Heartbeat
/// times never move backwards, and transition times only move when a
/// condition's status changes.
pub fn next_conditions(
    previous: &[NodeCondition],
    reported: &[NodeCondition],
    readiness: &Readiness,
    now: DateTime<Utc>,
) -> Vec<NodeCondition> {
    let mut next: Vec<NodeCondition> = DEFAULT_CONDITIONS
        .iter()
        .map(|(t, s, r, m)| condition(t, s, r, m, now))
        .collect();

    for reported in reported {
        match next.iter_mut().find(|c| c.type_ == reported.type_) {
            Some(slot) => *slot = reported.clone(),
            None => next.push(reported.clone()),
        }
    }

    if let Some(ready) = next.iter_mut().find(|c| c.type_ == CONDITION_READY) {
        match readiness {
            Readiness::Pending => {}
            Readiness::Reachable => {
                if !reported.iter().any(|c| c.type_ == CONDITION_READY) {
                    *ready = condition(CONDITION_READY, "True", "KubeletReady", "virtual node is ready", now);
                }
            }
            Readiness::Unreachable(message) => {
                *ready = condition(CONDITION_READY, "False", REASON_PROVIDER_UNREACHABLE, message, now);
            }
        }
    }

    for cond in &mut next {
        let prev = previous.iter().find(|p| p.type_ == cond.type_);
        let prev_heartbeat = prev.and_then(|p| p.last_heartbeat_time.as_ref()).map(|t| t.0);
        let heartbeat = prev_heartbeat.map_or(now, |p| p.max(now));
        cond.last_heartbeat_time = Some(Time(heartbeat));

        cond.last_transition_time = match prev {
            Some(p) if p.status == cond.status => p
                .last_transition_time
                .clone()
                .or_else(|| Some(Time(heartbeat))),
            _ => Some(Time(heartbeat)),
        };
    }
    next
}

/// Whether `conditions` has Ready=True.
pub fn is_ready(conditions: &[NodeCondition]) -> bool {
    conditions
        .iter()
        .any(|c| c.type_ == CONDITION_READY && c.status == "True")
}

/// Full node status from provider facts and the computed conditions.
pub fn node_status(config: &NodeConfig, facts: &NodeFacts, conditions: Vec<NodeCondition>) -> NodeStatus {
    let mut addresses = facts.addresses.clone();
    if !addresses.iter().any(|a| a.type_ == "InternalIP") {
        if let Some(ip) = &config.internal_ip {
            addresses.push(NodeAddress {
                address: ip.clone(),
                type_: "InternalIP".to_string(),
            });
        }
    }
    if !addresses.iter().any(|a| a.type_ == "Hostname") {
        addresses.push(NodeAddress {
            address: config.name.clone(),
            type_: "Hostname".to_string(),
        });
    }

    let mut endpoints = facts.endpoints.clone();
    if endpoints.kubelet_endpoint.is_none() {
        endpoints.kubelet_endpoint = Some(DaemonEndpoint {
            port: config.daemon_port,
        });
    }

    NodeStatus {
        capacity: Some(facts.capacity.clone()),
        allocatable: Some(facts.capacity.clone()),
        conditions: Some(conditions),
        addresses: Some(addresses),
        daemon_endpoints: Some(endpoints),
        node_info: Some(NodeSystemInfo {
            operating_system: config.operating_system.clone(),
            architecture: config.architecture.clone(),
            kubelet_version: config.kubelet_version.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Node object registered with the orchestrator.
pub fn build_node(config: &NodeConfig, status: NodeStatus) -> Node {
    let labels = [
        ("type", "virtual-kubelet"),
        ("kubernetes.io/role", "agent"),
        ("kubernetes.io/hostname", config.name.as_str()),
        ("kubernetes.io/os", config.operating_system.as_str()),
        ("kubernetes.io/arch", config.architecture.as_str()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    Node {
        metadata: ObjectMeta {
            name: Some(config.name.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            taints: Some(vec![config.taint.clone()]),
            ..Default::default()
        }),
        status: Some(status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ready(conditions: &[NodeCondition]) -> &NodeCondition {
        conditions.iter().find(|c| c.type_ == CONDITION_READY).unwrap()
    }

    #[test]
    fn test_reachable_is_ready() {
        let now = Utc::now();
        let conditions = next_conditions(&[], &[], &Readiness::Reachable, now);
        assert_eq!(conditions.len(), 5);
        assert!(is_ready(&conditions));
    }

    #[test]
    fn test_unreachable_is_not_ready() {
        let now = Utc::now();
        let conditions = next_conditions(&[], &[], &Readiness::Unreachable("timeout".into()), now);
        let ready = ready(&conditions);
        assert_eq!(ready.status, "False");
        assert_eq!(ready.reason.as_deref(), Some(REASON_PROVIDER_UNREACHABLE));
    }

    #[test]
    fn test_heartbeat_time_never_decreases() {
        let now = Utc::now();
        let first = next_conditions(&[], &[], &Readiness::Reachable, now);
        let earlier = now - Duration::seconds(30);
        let second = next_conditions(&first, &[], &Readiness::Reachable, earlier);
        assert_eq!(ready(&second).last_heartbeat_time, Some(Time(now)));
    }

    #[test]
    fn test_transition_time_moves_only_on_status_change() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(10);
        let t2 = t0 + Duration::seconds(20);

        let first = next_conditions(&[], &[], &Readiness::Reachable, t0);
        let second = next_conditions(&first, &[], &Readiness::Reachable, t1);
        assert_eq!(ready(&second).last_transition_time, Some(Time(t0)));
        assert_eq!(ready(&second).last_heartbeat_time, Some(Time(t1)));

        let third = next_conditions(&second, &[], &Readiness::Unreachable("down".into()), t2);
        assert_eq!(ready(&third).last_transition_time, Some(Time(t2)));
    }

    #[test]
    fn test_reported_conditions_override_defaults() {
        let now = Utc::now();
        let reported = vec![condition("MemoryPressure", "True", "Full", "no memory", now)];
        let conditions = next_conditions(&[], &reported, &Readiness::Reachable, now);
        let memory = conditions.iter().find(|c| c.type_ == "MemoryPressure").unwrap();
        assert_eq!(memory.status, "True");
    }
}
