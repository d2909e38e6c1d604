//! Prometheus metrics.
//!
//! [`Metrics`] owns the agent's own counters. Resource usage from the
//! provider is rendered into a throwaway registry on every scrape of
//! `/metrics/resource`, so stale pods never linger in the exposition.

use prometheus::core::Collector;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

use crate::error::{Error, Result};
use crate::provider::{CpuStats, MemoryStats, StatsSummary};

impl From<prometheus::Error> for Error {
    fn from(err: prometheus::Error) -> Self {
        Self::Internal(format!("metrics: {err}"))
    }
}

fn register<C>(registry: &Registry, collector: C) -> Result<C>
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

/// Agent counters, shared by the reconciler, the queue and the node controller.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    reconcile_total: IntCounterVec,
    workqueue_depth: IntGauge,
    heartbeat_failures: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let reconcile_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "vnode_reconcile_total",
                    "Reconciler transitions grouped by transition and result",
                ),
                &["transition", "result"],
            )?,
        )?;
        let workqueue_depth = register(
            &registry,
            IntGauge::new("vnode_workqueue_depth", "Keys waiting in the work queue")?,
        )?;
        let heartbeat_failures = register(
            &registry,
            IntCounter::new(
                "vnode_heartbeat_failures_total",
                "Node heartbeats that failed",
            )?,
        )?;

        Ok(Self {
            registry,
            reconcile_total,
            workqueue_depth,
            heartbeat_failures,
        })
    }

    pub fn record_reconcile(&self, transition: &str, result: &str) {
        self.reconcile_total
            .with_label_values(&[transition, result])
            .inc();
    }

    pub fn reconcile_count(&self, transition: &str, result: &str) -> u64 {
        self.reconcile_total
            .with_label_values(&[transition, result])
            .get()
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.workqueue_depth.set(depth as i64);
    }

    pub fn inc_heartbeat_failures(&self) {
        self.heartbeat_failures.inc();
    }

    pub fn heartbeat_failures(&self) -> u64 {
        self.heartbeat_failures.get()
    }

    /// Render `summary` plus the agent counters in the text exposition format.
    ///
    /// `summary` is `None` when the provider could not be scraped.
    pub fn render_resource(&self, summary: Option<&StatsSummary>) -> Result<String> {
        let resource = Registry::new();
        let scrape_error = register(
            &resource,
            Gauge::new(
                "scrape_error",
                "1 if there was an error while getting container metrics, 0 otherwise",
            )?,
        )?;

        match summary {
            Some(summary) => record_summary(&resource, summary)?,
            None => scrape_error.set(1.0),
        }

        let mut families = resource.gather();
        families.extend(self.registry.gather());

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics: {e}")))
    }
}

fn cpu_seconds(cpu: Option<&CpuStats>) -> Option<f64> {
    cpu?.usage_core_nano_seconds.map(|ns| ns as f64 / 1e9)
}

fn working_set(memory: Option<&MemoryStats>) -> Option<f64> {
    memory?.working_set_bytes.map(|b| b as f64)
}

fn record_summary(registry: &Registry, summary: &StatsSummary) -> Result<()> {
    let node_cpu = register(
        registry,
        Counter::new(
            "node_cpu_usage_seconds_total",
            "Cumulative cpu time consumed by the node in core-seconds",
        )?,
    )?;
    let node_memory = register(
        registry,
        Gauge::new(
            "node_memory_working_set_bytes",
            "Current working set of the node in bytes",
        )?,
    )?;
    let pod_cpu = register(
        registry,
        CounterVec::new(
            Opts::new(
                "pod_cpu_usage_seconds_total",
                "Cumulative cpu time consumed by the pod in core-seconds",
            ),
            &["namespace", "pod"],
        )?,
    )?;
    let pod_memory = register(
        registry,
        GaugeVec::new(
            Opts::new(
                "pod_memory_working_set_bytes",
                "Current working set of the pod in bytes",
            ),
            &["namespace", "pod"],
        )?,
    )?;
    let container_cpu = register(
        registry,
        CounterVec::new(
            Opts::new(
                "container_cpu_usage_seconds_total",
                "Cumulative cpu time consumed by the container in core-seconds",
            ),
            &["namespace", "pod", "container"],
        )?,
    )?;
    let container_memory = register(
        registry,
        GaugeVec::new(
            Opts::new(
                "container_memory_working_set_bytes",
                "Current working set of the container in bytes",
            ),
            &["namespace", "pod", "container"],
        )?,
    )?;

    if let Some(seconds) = cpu_seconds(summary.node.cpu.as_ref()) {
        node_cpu.inc_by(seconds);
    }
    if let Some(bytes) = working_set(summary.node.memory.as_ref()) {
        node_memory.set(bytes);
    }

    for pod in &summary.pods {
        let (ns, name) = (pod.pod_ref.namespace.as_str(), pod.pod_ref.name.as_str());
        if let Some(seconds) = cpu_seconds(pod.cpu.as_ref()) {
            pod_cpu.with_label_values(&[ns, name]).inc_by(seconds);
        }
        if let Some(bytes) = working_set(pod.memory.as_ref()) {
            pod_memory.with_label_values(&[ns, name]).set(bytes);
        }
        for container in &pod.containers {
            let labels = [ns, name, container.name.as_str()];
            if let Some(seconds) = cpu_seconds(container.cpu.as_ref()) {
                container_cpu.with_label_values(&labels).inc_by(seconds);
            }
            if let Some(bytes) = working_set(container.memory.as_ref()) {
                container_memory.with_label_values(&labels).set(bytes);
            }
        }
    }
    Ok(())
}
