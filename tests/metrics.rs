//! Tests for the metrics module.

use ampbeam::metrics::{CounterMetric, GaugeMetric, MetricsCollector};
use ampbeam::plan::Stage;
use anyhow::{Context, Result};
use serde_json::json;
use std::time::Duration;
use tempfile::tempdir;

#[test]
fn test_counter_metric() {
    let collector = MetricsCollector::new();
    collector.register(Box::new(CounterMetric::with_value("chunks", 5)));
    collector.increment_counter("chunks", 2);
    collector.increment_counter("clusters", 9);

    let snapshot = collector.snapshot();
    assert_eq!(snapshot.get("chunks"), Some(&json!(7)));
    assert_eq!(collector.counter("clusters"), Some(9));
    assert_eq!(collector.counter("missing"), None);
}

#[test]
fn test_gauge_metric() {
    let collector = MetricsCollector::new();
    collector.register(Box::new(
        GaugeMetric::new("memory_budget_bytes", 1024.0).with_description("bucket memory"),
    ));
    let doc = collector.to_json();
    assert_eq!(doc["metrics"]["memory_budget_bytes"]["value"], json!(1024.0));
    assert_eq!(doc["metrics"]["memory_budget_bytes"]["description"], json!("bucket memory"));
}

#[test]
fn test_stage_metrics_are_keyed_by_stage_name() -> Result<()> {
    let collector = MetricsCollector::new();
    collector.record_stage(Stage::Classify, Duration::from_millis(1500), 10, 8, 800);
    let m = collector.stage(Stage::Classify).context("classify was recorded")?;
    assert_eq!(m.chunks_dropped, 2);
    assert_eq!(m.duration_ms, 1500);

    let doc = collector.to_json();
    assert_eq!(doc["stages"]["classify"]["rows"], json!(800));
    assert!(doc.get("execution_time_ms").is_none());
    Ok(())
}

#[test]
fn test_clones_share_state() {
    let collector = MetricsCollector::new();
    let handle = collector.clone();
    std::thread::scope(|scope| {
        scope.spawn(|| handle.increment_counter("rows", 3));
    });
    assert_eq!(collector.counter("rows"), Some(3));
}

#[test]
fn test_save_to_file() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("metrics.json");
    let collector = MetricsCollector::new();
    collector.record_start();
    collector.increment_counter("candidates_called", 12);
    collector.record_end();
    collector.save_to_file(&path)?;

    let doc: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    assert_eq!(doc["metrics"]["candidates_called"]["value"], json!(12));
    assert!(doc["execution_time_ms"].is_u64());
    Ok(())
}
