//! Metrics collection for pipeline runs.
//!
//! The controller records per-stage timings and chunk counts, plus named
//! counters (candidates removed by the length filter, clusters formed, rows
//! per output). Everything ends up in `metrics.json` next to the outputs.
//!
//! # Overview
//!
//! - [`Metric`] is the interface for any named value
//! - [`CounterMetric`] and [`GaugeMetric`] are the built-in kinds
//! - [`MetricsCollector`] is a cheap-to-clone, thread-safe registry
//!
//! # Example
//!
//! ```
//! use ampbeam::metrics::{GaugeMetric, MetricsCollector};
//! use ampbeam::plan::Stage;
//! use std::time::Duration;
//!
//! let metrics = MetricsCollector::new();
//! metrics.increment_counter("candidates_called", 40);
//! metrics.increment_counter("candidates_called", 2);
//! metrics.register(Box::new(GaugeMetric::new("memory_budget_gib", 12.0)));
//! metrics.record_stage(Stage::Classify, Duration::from_millis(1500), 4, 3, 42);
//!
//! let json = metrics.to_json();
//! assert_eq!(json["metrics"]["candidates_called"]["value"], 42);
//! assert_eq!(json["stages"]["classify"]["chunks_dropped"], 1);
//! ```

use crate::plan::Stage;
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Value, json};
use std::any::Any;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// A named value reported at the end of a run.
pub trait Metric: Send + Sync + Any {
    fn name(&self) -> &str;

    /// The current value as JSON.
    fn value(&self) -> Value;

    fn description(&self) -> Option<&str> {
        None
    }

    /// Cast to Any for downcasting.
    fn as_any(&self) -> &dyn Any;
}

/// Timing and chunk accounting for one executed stage.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StageMetrics {
    pub duration_ms: u64,
    pub chunks_submitted: usize,
    pub chunks_accepted: usize,
    pub chunks_dropped: usize,
    pub rows: usize,
}

/// Thread-safe registry of run metrics.
#[derive(Clone, Default)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsCollectorInner>>,
}

#[derive(Default)]
struct MetricsCollectorInner {
    metrics: BTreeMap<String, Box<dyn Metric>>,
    stages: BTreeMap<Stage, StageMetrics>,
    start_time: Option<Instant>,
    end_time: Option<Instant>,
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MetricsCollectorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a metric, replacing any metric of the same name.
    pub fn register(&self, metric: Box<dyn Metric>) {
        self.lock().metrics.insert(metric.name().to_string(), metric);
    }

    pub fn record_start(&self) {
        self.lock().start_time = Some(Instant::now());
    }

    pub fn record_end(&self) {
        self.lock().end_time = Some(Instant::now());
    }

    /// Elapsed run time, once both ends are recorded.
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        let inner = self.lock();
        match (inner.start_time, inner.end_time) {
            (Some(start), Some(end)) => Some(end.duration_since(start)),
            _ => None,
        }
    }

    /// Add `value` to a counter, creating it on first use.
    pub fn increment_counter(&self, name: &str, value: u64) {
        let mut inner = self.lock();
        if let Some(metric) = inner.metrics.get(name)
            && let Some(counter) = metric.as_any().downcast_ref::<CounterMetric>()
        {
            counter.add(value);
            return;
        }
        inner
            .metrics
            .insert(name.to_string(), Box::new(CounterMetric::with_value(name, value)));
    }

    /// Current value of a counter, if one exists under `name`.
    #[must_use]
    pub fn counter(&self, name: &str) -> Option<u64> {
        self.lock()
            .metrics
            .get(name)
            .and_then(|m| m.as_any().downcast_ref::<CounterMetric>())
            .map(CounterMetric::get)
    }

    /// Record one stage's wall time and chunk accounting.
    pub fn record_stage(&self, stage: Stage, duration: Duration, submitted: usize, accepted: usize, rows: usize) {
        self.lock().stages.insert(
            stage,
            StageMetrics {
                duration_ms: millis(duration),
                chunks_submitted: submitted,
                chunks_accepted: accepted,
                chunks_dropped: submitted.saturating_sub(accepted),
                rows,
            },
        );
    }

    #[must_use]
    pub fn stage(&self, stage: Stage) -> Option<StageMetrics> {
        self.lock().stages.get(&stage).cloned()
    }

    /// All stages recorded so far, in pipeline order.
    #[must_use]
    pub fn stages(&self) -> Vec<(Stage, StageMetrics)> {
        self.lock().stages.iter().map(|(s, m)| (*s, m.clone())).collect()
    }

    /// Everything as one JSON document.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let inner = self.lock();
        let mut metrics_json = serde_json::Map::new();
        for (name, metric) in &inner.metrics {
            let mut metric_obj = serde_json::Map::new();
            metric_obj.insert("value".to_string(), metric.value());
            if let Some(desc) = metric.description() {
                metric_obj.insert("description".to_string(), json!(desc));
            }
            metrics_json.insert(name.clone(), Value::Object(metric_obj));
        }
        let stages: serde_json::Map<String, Value> = inner
            .stages
            .iter()
            .map(|(stage, m)| (stage.to_string(), json!(m)))
            .collect();
        let mut doc = json!({
            "metrics": metrics_json,
            "stages": stages,
        });
        if let (Some(start), Some(end)) = (inner.start_time, inner.end_time) {
            doc["execution_time_ms"] = json!(millis(end.duration_since(start)));
        }
        doc
    }

    /// Save all metrics to a pretty-printed JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or written to.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let formatted = serde_json::to_string_pretty(&self.to_json())?;
        let mut file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        file.write_all(formatted.as_bytes())
            .with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// Name/value pairs of every registered metric.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.lock()
            .metrics
            .iter()
            .map(|(name, metric)| (name.clone(), metric.value()))
            .collect()
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// A monotonically increasing count.
pub struct CounterMetric {
    name: String,
    count: AtomicU64,
}

impl CounterMetric {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_value(name, 0)
    }

    pub fn with_value(name: impl Into<String>, count: u64) -> Self {
        Self {
            name: name.into(),
            count: AtomicU64::new(count),
        }
    }

    pub fn add(&self, value: u64) {
        self.count.fetch_add(value, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Metric for CounterMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Value {
        json!(self.get())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A single numeric reading.
pub struct GaugeMetric {
    name: String,
    value: f64,
    description: Option<String>,
}

impl GaugeMetric {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            description: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl Metric for GaugeMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Value {
        json!(self.value)
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_writes_pretty_json() {
        let dir = tempfile::tempdir().unwrap();
        let m = MetricsCollector::new();
        m.record_start();
        m.increment_counter("clusters", 3);
        m.register(Box::new(GaugeMetric::new("threads", 4.0).with_description("worker threads")));
        m.record_end();
        let path = dir.path().join("metrics.json");
        m.save_to_file(&path).unwrap();
        let v: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(v["metrics"]["clusters"]["value"], 3);
        assert_eq!(v["metrics"]["threads"]["description"], "worker threads");
        assert!(v.get("execution_time_ms").is_some());
        assert_eq!(m.counter("clusters"), Some(3));
    }
}
