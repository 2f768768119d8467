//! Tests for the metrics module.

use ironframe::metrics::{
    CounterMetric, GaugeMetric, HistogramMetric, HistogramStats, Metric, MetricsCollector, names,
};
use serde_json::json;
use std::thread;
use std::time::Duration;


#[test]
fn test_counter_metric() {
    let collector = MetricsCollector::new();
    collector.register(Box::new(CounterMetric::with_value("test_counter", 5)));

    let snapshot = collector.snapshot();
    assert_eq!(snapshot.get("test_counter").unwrap(), &json!(5));
    assert_eq!(collector.counter("test_counter"), Some(5));
}

#[test]
fn test_gauge_metric() {
    let gauge = GaugeMetric::new("progress", 0.5).with_description("Fraction of partitions merged");
    assert_eq!(gauge.description(), Some("Fraction of partitions merged"));

    let collector = MetricsCollector::new();
    collector.register(Box::new(gauge));
    assert_eq!(collector.snapshot().get("progress").unwrap(), &json!(0.5));
    collector.set_gauge("progress", 1.0);
    assert_approx_eq!(collector.gauge("progress").unwrap(), 1.0);
}

#[test]
fn test_increment_counter() {
    let collector = MetricsCollector::new();
    collector.increment_counter(names::PARTITIONS_MERGED, 1);
    collector.increment_counter(names::PARTITIONS_MERGED, 5);
    assert_eq!(collector.counter(names::PARTITIONS_MERGED), Some(6));
    assert_eq!(collector.counter(names::RETRIES), None);
}

#[test]
fn test_counter_replaces_other_metric_kinds() {
    let collector = MetricsCollector::new();
    collector.set_gauge("metric", 99.9);
    collector.increment_counter("metric", 2);
    assert_eq!(collector.counter("metric"), Some(2));
    assert!(collector.gauge("metric").is_none());
}

#[test]
fn test_record_histogram() {
    let collector = MetricsCollector::new();
    for ms in [30.0, 10.0, 20.0] {
        collector.record_histogram(names::TASK_DURATION_MS, ms);
    }
    let stats = collector.histogram(names::TASK_DURATION_MS).unwrap();
    assert_eq!(stats.count, 3);
    assert_approx_eq!(stats.mean, 20.0);
    assert_approx_eq!(stats.min, 10.0);
    assert_approx_eq!(stats.max, 30.0);
}

#[test]
fn test_histogram_percentiles() {
    let values: Vec<f64> = (1..=100).map(f64::from).collect();
    let stats = HistogramMetric::with_values("percentile_test", values).stats();

    assert_eq!(stats.count, 100);
    assert_approx_eq!(stats.min, 1.0);
    assert_approx_eq!(stats.max, 100.0);
    assert!(stats.p50 >= 49.0 && stats.p50 <= 51.0);
    assert!(stats.p95 >= 94.0 && stats.p95 <= 96.0);
    assert!(stats.p99 >= 98.0 && stats.p99 <= 100.0);
}

#[test]
fn test_histogram_single_value() {
    let mut hist = HistogramMetric::new("single");
    hist.record(42.0);
    let stats = hist.stats();
    assert_eq!(stats.count, 1);
    assert_approx_eq!(stats.p50, 42.0);
    assert_approx_eq!(stats.p99, 42.0);
}

#[test]
fn test_empty_histogram_has_default_stats() {
    assert_eq!(HistogramMetric::new("latency").stats(), HistogramStats::default());
}

#[test]
fn test_histogram_json_value() {
    let hist = HistogramMetric::with_values("hist", vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    let value = hist.value();
    assert_eq!(value["count"], json!(5));
    assert_eq!(value["mean"], json!(3.0));
}

#[test]
fn test_elapsed_time() {
    let collector = MetricsCollector::new();
    assert!(collector.elapsed().is_none());

    collector.record_start();
    assert!(collector.elapsed().is_none());
    thread::sleep(Duration::from_millis(20));
    collector.record_end();
    assert!(collector.elapsed().unwrap() >= Duration::from_millis(20));
}

#[test]
fn test_to_json() {
    let collector = MetricsCollector::new();
    collector.register(Box::new(CounterMetric::with_value("count", 100)));
    assert!(collector.to_json().get("execution_time_ms").is_none());

    collector.record_start();
    collector.record_end();
    let json = collector.to_json();
    assert_eq!(json["count"]["value"], json!(100));
    assert!(json["execution_time_ms"]["value"].is_number());
}

#[test]
fn test_clones_share_the_registry() {
    let collector = MetricsCollector::new();
    let clone = collector.clone();
    clone.increment_counter("shared", 42);
    assert_eq!(collector.counter("shared"), Some(42));
}

#[test]
fn test_save_to_file() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let file_path = temp_dir.path().join("metrics.json");

    let collector = MetricsCollector::new();
    collector.increment_counter("saved", 123);
    collector.save_to_file(&file_path).unwrap();

    let contents = std::fs::read_to_string(&file_path).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
    assert_eq!(parsed["saved"]["value"], json!(123));
}

#[test]
fn test_log_summary_does_not_panic() {
    ironframe::logging::init_for_tests();
    let collector = MetricsCollector::default();
    collector.increment_counter(names::RETRIES, 1);
    collector.log_summary();
}
