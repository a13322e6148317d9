//! Metrics emitted by the scheduler, failover manager and coordinator.
//!
//! Every metric is a `(name, value, labels)` tuple pushed into a
//! [`MetricsSink`]. The core never aggregates beyond its own counters;
//! sinks decide what to do with the stream.

use std::sync::{Arc, Mutex};

use crate::log_debug;

pub const TASK_COMPLETED: &str = "task.completed";
pub const TASK_FAILED: &str = "task.failed";
pub const TASK_RETRY: &str = "task.retry";
pub const TASK_EXECUTION_TIME: &str = "task.execution_time";
pub const CIRCUIT_TRANSITION: &str = "circuit.transition";
pub const FAILOVER_EVENT: &str = "failover.event";
pub const FAILOVER_DEFERRED: &str = "failover.deferred";
pub const SCALING_EVENT: &str = "scaling.event";
pub const CONFLICT_RESOLVED: &str = "conflict.resolved";

/// A single metric sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub labels: Vec<(String, String)>,
}

impl Metric {
    pub fn new(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            value,
            labels: Vec::new(),
        }
    }

    /// A counter increment of one.
    pub fn count(name: &str) -> Self {
        Self::new(name, 1.0)
    }

    pub fn label(mut self, key: &str, value: impl ToString) -> Self {
        self.labels.push((key.to_string(), value.to_string()));
        self
    }

    pub fn get_label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Destination for emitted metrics.
pub trait MetricsSink: Send + Sync {
    fn emit(&self, metric: Metric);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn emit(&self, _metric: Metric) {}
}

/// Writes each metric to the debug log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn emit(&self, metric: Metric) {
        let labels: Vec<String> = metric
            .labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        log_debug!("metric {} {} [{}]", metric.name, metric.value, labels.join(","));
    }
}

/// Keeps every metric in memory for later inspection.
#[derive(Debug, Default)]
pub struct MemorySink {
    metrics: Mutex<Vec<Metric>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<Metric> {
        self.metrics.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// All samples with the given name.
    pub fn named(&self, name: &str) -> Vec<Metric> {
        self.snapshot()
            .into_iter()
            .filter(|m| m.name == name)
            .collect()
    }

    /// Sum of the values of all samples with the given name.
    pub fn total(&self, name: &str) -> f64 {
        self.named(name).iter().map(|m| m.value).sum()
    }
}

impl MetricsSink for MemorySink {
    fn emit(&self, metric: Metric) {
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.push(metric);
        }
    }
}

/// Shared handle used by the components.
pub type SharedSink = Arc<dyn MetricsSink>;

/// The sink components use when none is configured.
pub fn default_sink() -> SharedSink {
    Arc::new(LogSink)
}
