//! Wire types of the provider protocol that are not pod or node objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error body returned alongside non-2xx statuses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Options for container log requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogOptions {
    pub tail: Option<i64>,
    pub follow: bool,
    pub timestamps: bool,
    pub limit_bytes: Option<i64>,
    pub since_seconds: Option<i64>,
}

impl LogOptions {
    /// Query parameters for `/getContainerLogs`, minus the pod identity.
    pub fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if let Some(tail) = self.tail {
            query.push(("tail", tail.to_string()));
        }
        if self.follow {
            query.push(("follow", "true".to_string()));
        }
        if self.timestamps {
            query.push(("timestamps", "true".to_string()));
        }
        if let Some(limit) = self.limit_bytes {
            query.push(("limitBytes", limit.to_string()));
        }
        if let Some(since) = self.since_seconds {
            query.push(("sinceSeconds", since.to_string()));
        }
        query
    }
}

/// First line of a `/runInContainer` request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecRequest {
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub stdin: bool,
}

/// Node and pod resource usage, in the kubelet summary layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSummary {
    pub node: NodeStats,
    #[serde(default)]
    pub pods: Vec<PodStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    #[serde(default)]
    pub node_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodReference {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStats {
    pub pod_ref: PodReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub containers: Vec<ContainerStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStats {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_nano_cores: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_core_nano_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_set_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rss_bytes: Option<u64>,
}

fn sum_cpu<'a>(items: impl Iterator<Item = &'a CpuStats>) -> Option<CpuStats> {
    let mut total: Option<CpuStats> = None;
    for cpu in items {
        let acc = total.get_or_insert(CpuStats {
            time: cpu.time,
            usage_nano_cores: None,
            usage_core_nano_seconds: None,
        });
        acc.time = acc.time.max(cpu.time);
        acc.usage_nano_cores = add(acc.usage_nano_cores, cpu.usage_nano_cores);
        acc.usage_core_nano_seconds = add(acc.usage_core_nano_seconds, cpu.usage_core_nano_seconds);
    }
    total
}

fn sum_memory<'a>(items: impl Iterator<Item = &'a MemoryStats>) -> Option<MemoryStats> {
    let mut total: Option<MemoryStats> = None;
    for memory in items {
        let acc = total.get_or_insert(MemoryStats {
            time: memory.time,
            available_bytes: None,
            usage_bytes: None,
            working_set_bytes: None,
            rss_bytes: None,
        });
        acc.time = acc.time.max(memory.time);
        acc.usage_bytes = add(acc.usage_bytes, memory.usage_bytes);
        acc.working_set_bytes = add(acc.working_set_bytes, memory.working_set_bytes);
        acc.rss_bytes = add(acc.rss_bytes, memory.rss_bytes);
    }
    total
}

fn add(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(0).saturating_add(b.unwrap_or(0))),
    }
}

impl StatsSummary {
    /// Fill in missing pod totals from their containers, and missing node
    /// totals from the pods.
    pub fn aggregated(mut self, node_name: &str) -> Self {
        for pod in &mut self.pods {
            if pod.cpu.is_none() {
                pod.cpu = sum_cpu(pod.containers.iter().filter_map(|c| c.cpu.as_ref()));
            }
            if pod.memory.is_none() {
                pod.memory = sum_memory(pod.containers.iter().filter_map(|c| c.memory.as_ref()));
            }
        }

        if self.node.node_name.is_empty() {
            self.node.node_name = node_name.to_string();
        }
        if self.node.cpu.is_none() {
            self.node.cpu = sum_cpu(self.pods.iter().filter_map(|p| p.cpu.as_ref()));
        }
        if self.node.memory.is_none() {
            self.node.memory = sum_memory(self.pods.iter().filter_map(|p| p.memory.as_ref()));
        }
        self
    }

    /// Empty summary for providers that do not report stats.
    pub fn empty(node_name: &str) -> Self {
        Self {
            node: NodeStats {
                node_name: node_name.to_string(),
                ..Default::default()
            },
            pods: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu(nano_cores: u64, core_ns: u64) -> CpuStats {
        CpuStats {
            time: Utc::now(),
            usage_nano_cores: Some(nano_cores),
            usage_core_nano_seconds: Some(core_ns),
        }
    }

    fn memory(working_set: u64) -> MemoryStats {
        MemoryStats {
            time: Utc::now(),
            available_bytes: None,
            usage_bytes: Some(working_set * 2),
            working_set_bytes: Some(working_set),
            rss_bytes: None,
        }
    }

    #[test]
    fn test_aggregated_fills_pods_and_node() {
        let summary = StatsSummary {
            node: NodeStats::default(),
            pods: vec![
                PodStats {
                    pod_ref: PodReference {
                        name: "p1".into(),
                        namespace: "a".into(),
                        uid: "U1".into(),
                    },
                    containers: vec![
                        ContainerStats {
                            name: "app".into(),
                            cpu: Some(cpu(100, 1_000)),
                            memory: Some(memory(10)),
                            ..Default::default()
                        },
                        ContainerStats {
                            name: "sidecar".into(),
                            cpu: Some(cpu(50, 500)),
                            memory: Some(memory(5)),
                            ..Default::default()
                        },
                    ],
                    ..Default::default()
                },
                PodStats {
                    pod_ref: PodReference {
                        name: "p2".into(),
                        namespace: "a".into(),
                        uid: "U2".into(),
                    },
                    cpu: Some(cpu(10, 10)),
                    memory: Some(memory(1)),
                    ..Default::default()
                },
            ],
        }
        .aggregated("vn-1");

        let p1 = &summary.pods[0];
        assert_eq!(p1.cpu.as_ref().unwrap().usage_nano_cores, Some(150));
        assert_eq!(p1.memory.as_ref().unwrap().working_set_bytes, Some(15));

        assert_eq!(summary.node.node_name, "vn-1");
        let node_cpu = summary.node.cpu.unwrap();
        assert_eq!(node_cpu.usage_nano_cores, Some(160));
        assert_eq!(node_cpu.usage_core_nano_seconds, Some(1_510));
        assert_eq!(summary.node.memory.unwrap().working_set_bytes, Some(16));
    }

    #[test]
    fn test_summary_wire_format() {
        let json = serde_json::json!({
            "node": {"nodeName": "vn-1"},
            "pods": [{
                "podRef": {"name": "p1", "namespace": "a", "uid": "U1"},
                "containers": [],
                "cpu": {"time": "2024-01-01T00:00:00Z", "usageNanoCores": 5}
            }]
        });
        let summary: StatsSummary = serde_json::from_value(json).unwrap();
        assert_eq!(summary.pods[0].pod_ref.uid, "U1");
        assert_eq!(summary.pods[0].cpu.as_ref().unwrap().usage_nano_cores, Some(5));
    }

    #[test]
    fn test_log_options_query() {
        let options = LogOptions {
            tail: Some(10),
            follow: true,
            ..Default::default()
        };
        assert_eq!(
            options.query(),
            vec![("tail", "10".to_string()), ("follow", "true".to_string())]
        );
    }
}
