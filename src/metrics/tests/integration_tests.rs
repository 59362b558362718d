//! Integration tests for the metrics system
//!
//! These tests exercise the facade helpers against the real backends.

use crate::metrics::prometheus::PrometheusExporter;
use crate::metrics::statsd::StatsDExporter;
use crate::metrics::{
    create_metrics_exporter, create_null_exporter, create_prometheus_exporter, Metrics,
    MetricsError, MetricsExporter,
};
use std::sync::Arc;
use tokio::net::UdpSocket;

#[tokio::test]
async fn test_prometheus_records_lifecycle_events() {
    let metrics = Metrics::new(create_prometheus_exporter());

    metrics.record_job_action("start", "started").await;
    metrics.record_job_action("force_restart", "queued").await;
    metrics.record_stage("transcribing").await;
    metrics.record_job_finished("large-v3", "completed", 42.0).await;
    metrics.record_stale_exit().await;
    metrics.record_model_load("transcriber", "large-v3", 3.5, "loaded").await;
    metrics.record_model_cache_hit("transcriber", "large-v3").await;
    metrics.set_active_workers(2).await;
    metrics.record_batch_created(3, true).await;
    metrics
        .record_http_request("GET", "/transcription/{file_id}", "200", 0.002)
        .await;

    let exported = metrics.export().await.expect("Failed to export metrics");
    let exported = String::from_utf8(exported).expect("Invalid UTF-8 in exported metrics");

    assert!(exported.contains("job_actions_total"));
    assert!(exported.contains("outcome=\"queued\""));
    assert!(exported.contains("job_stage_transitions_total"));
    assert!(exported.contains("job_duration_seconds"));
    assert!(exported.contains("job_stale_exits_total"));
    assert!(exported.contains("model_loads_total"));
    assert!(exported.contains("active_workers 2"));
    assert!(exported.contains("batches_created_total"));
}

#[tokio::test]
async fn test_label_order_does_not_matter() {
    let exporter = PrometheusExporter::new();
    exporter
        .increment("ordered_total", &[("a", "1"), ("b", "2")])
        .await
        .unwrap();
    exporter
        .increment("ordered_total", &[("b", "2"), ("a", "1")])
        .await
        .unwrap();

    let exported = String::from_utf8(exporter.export().await.unwrap()).unwrap();
    assert!(exported.contains("ordered_total{a=\"1\",b=\"2\"} 2"));
    assert_eq!(exporter.metric_count(), 1);
}

#[tokio::test]
async fn test_prometheus_validation_errors() {
    let exporter = PrometheusExporter::new();

    let result = exporter.increment("", &[]).await;
    assert!(matches!(result, Err(MetricsError::InvalidName { .. })));

    let result = exporter.set_gauge("valid_name", f64::INFINITY, &[]).await;
    assert!(matches!(result, Err(MetricsError::InvalidValue { .. })));

    let result = exporter.increment("valid_name", &[("", "value")]).await;
    assert!(matches!(result, Err(MetricsError::InvalidLabel { .. })));

    exporter.increment("typed_metric", &[]).await.unwrap();
    let result = exporter.set_gauge("typed_metric", 1.0, &[]).await;
    assert!(matches!(result, Err(MetricsError::RegistrationFailed { .. })));
}

#[tokio::test]
async fn test_metric_limit_is_enforced() {
    let exporter = PrometheusExporter::with_settings(None, 2);
    exporter.increment("first_total", &[]).await.unwrap();
    exporter.increment("second_total", &[]).await.unwrap();
    let result = exporter.increment("third_total", &[]).await;
    assert!(matches!(result, Err(MetricsError::ResourceLimitExceeded { .. })));
}

#[tokio::test]
async fn test_null_exporter_never_fails() {
    let metrics = Metrics::new(create_null_exporter());
    metrics.increment("any_name", &[]).await.unwrap();
    metrics.set_gauge("any_gauge", f64::NAN, &[]).await.unwrap();
    assert!(metrics.export().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_helpers_swallow_exporter_errors() {
    // A namespace-less exporter limited to one metric fails on the second
    // helper call; the helper must log and return normally.
    let metrics = Metrics::new(Arc::new(PrometheusExporter::with_settings(None, 1)));
    metrics.record_stale_exit().await;
    metrics.record_checkpoint_retry().await;
}

#[tokio::test]
async fn test_statsd_sends_datagrams() {
    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let endpoint = receiver.local_addr().unwrap().to_string();

    let exporter = StatsDExporter::new(&endpoint, Some("jobs".to_string()), None).unwrap();
    exporter
        .increment("stage_total", &[("stage", "diarizing")])
        .await
        .unwrap();

    let mut buf = [0u8; 256];
    let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
    assert_eq!(
        std::str::from_utf8(&buf[..len]).unwrap(),
        "jobs.stage_total:1|c|#stage:diarizing"
    );
}

#[tokio::test]
async fn test_statsd_configuration_errors() {
    assert!(StatsDExporter::new("not an address", None, None).is_err());
    assert!(StatsDExporter::new("127.0.0.1:8125", None, Some(1.5)).is_err());

    let exporter = StatsDExporter::new("localhost:8125", None, Some(0.5)).unwrap();
    assert_eq!(exporter.counter_line("x", &[]), "x:1|c|@0.5");
}

#[tokio::test]
async fn test_factory_selects_backend() {
    let none = create_metrics_exporter("none", None, None, None).unwrap();
    assert!(none.export().await.unwrap().is_empty());

    let unknown = create_metrics_exporter("carrier-pigeon", None, None, None).unwrap();
    assert!(unknown.export().await.unwrap().is_empty());

    assert!(create_metrics_exporter("statsd", Some("bad"), None, None).is_err());
}
