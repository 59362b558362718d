//! Metrics facade
//!
//! `Metrics` wraps a pluggable [`MetricsExporter`] and offers one helper per job
//! lifecycle event. Helpers never fail: exporter errors are logged at `warn` and
//! dropped, so that metrics can never take a worker down.
//!
//! ```rust,no_run
//! use transcript_jobs::metrics::{create_prometheus_exporter, Metrics};
//!
//! # async fn example() {
//! let metrics = Metrics::new(create_prometheus_exporter());
//! metrics.record_job_action("start", "started").await;
//! let exported = metrics.export().await.unwrap_or_default();
//! println!("{}", String::from_utf8_lossy(&exported));
//! # }
//! ```

use crate::metrics::error::{validation, MetricsError};
use crate::metrics::null::NullExporter;
use crate::metrics::prometheus::PrometheusExporter;
use crate::metrics::statsd::StatsDExporter;
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;

/// Interface implemented by every metrics backend
#[async_trait]
pub trait MetricsExporter: Send + Sync {
    /// Increment a counter by one
    async fn increment(&self, name: &str, labels: &[(&str, &str)]) -> Result<(), MetricsError>;

    /// Set a gauge to a point-in-time value
    async fn set_gauge(
        &self,
        name: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) -> Result<(), MetricsError>;

    /// Record one observation in a histogram
    async fn observe_histogram(
        &self,
        name: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) -> Result<(), MetricsError>;

    /// Serialized metrics for pull-based backends, empty for push-based ones
    async fn export(&self) -> Result<Vec<u8>, MetricsError>;
}

/// Metrics facade for the application
#[derive(Clone)]
pub struct Metrics {
    exporter: Arc<dyn MetricsExporter>,
}

impl Metrics {
    pub fn new(exporter: Arc<dyn MetricsExporter>) -> Self {
        Self { exporter }
    }

    /// Facade over the null exporter
    pub fn disabled() -> Self {
        Self::new(create_null_exporter())
    }

    pub async fn increment(&self, name: &str, labels: &[(&str, &str)]) -> Result<(), MetricsError> {
        self.exporter.increment(name, labels).await
    }

    pub async fn set_gauge(
        &self,
        name: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) -> Result<(), MetricsError> {
        self.exporter.set_gauge(name, value, labels).await
    }

    pub async fn observe_histogram(
        &self,
        name: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) -> Result<(), MetricsError> {
        self.exporter.observe_histogram(name, value, labels).await
    }

    pub async fn export(&self) -> Result<Vec<u8>, MetricsError> {
        self.exporter.export().await
    }

    async fn increment_internal(&self, name: &str, labels: &[(&str, &str)]) {
        if let Err(e) = self.exporter.increment(name, labels).await {
            warn!("Failed to increment counter '{}': {}", name, e);
        }
    }

    async fn set_gauge_internal(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        if let Err(e) = self.exporter.set_gauge(name, value, labels).await {
            warn!("Failed to set gauge '{}': {}", name, e);
        }
    }

    async fn observe_histogram_internal(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        if let Err(e) = self.exporter.observe_histogram(name, value, labels).await {
            warn!("Failed to observe histogram '{}': {}", name, e);
        }
    }

    // Convenience methods for job lifecycle events

    /// Record an HTTP request and its duration
    pub async fn record_http_request(
        &self,
        method: &str,
        endpoint: &str,
        status: &str,
        duration: f64,
    ) {
        let labels = [("endpoint", endpoint), ("method", method), ("status", status)];
        self.observe_histogram_internal("http_request_duration_seconds", duration, &labels)
            .await;
        self.increment_internal("http_requests_total", &labels).await;
    }

    /// Record the outcome of a start/resume/force_restart request
    pub async fn record_job_action(&self, action: &str, outcome: &str) {
        self.increment_internal(
            "job_actions_total",
            &[("action", action), ("outcome", outcome)],
        )
        .await;
    }

    /// Record a worker entering a stage
    pub async fn record_stage(&self, stage: &str) {
        self.increment_internal("job_stage_transitions_total", &[("stage", stage)])
            .await;
    }

    /// Record a worker reaching a terminal state
    pub async fn record_job_finished(&self, model: &str, outcome: &str, duration: f64) {
        let labels = [("model", model), ("outcome", outcome)];
        self.observe_histogram_internal("job_duration_seconds", duration, &labels)
            .await;
        self.increment_internal("jobs_finished_total", &labels).await;
    }

    /// Record a superseded worker exiting without writing
    pub async fn record_stale_exit(&self) {
        self.increment_internal("job_stale_exits_total", &[]).await;
    }

    /// Record a checkpoint write that had to be retried
    pub async fn record_checkpoint_retry(&self) {
        self.increment_internal("checkpoint_write_retries_total", &[])
            .await;
    }

    /// Record an engine load performed by the model cache
    pub async fn record_model_load(&self, kind: &str, variant: &str, duration: f64, outcome: &str) {
        let labels = [("kind", kind), ("variant", variant), ("outcome", outcome)];
        self.observe_histogram_internal("model_load_duration_seconds", duration, &labels)
            .await;
        self.increment_internal("model_loads_total", &labels).await;
    }

    /// Record an engine served from the cache without loading
    pub async fn record_model_cache_hit(&self, kind: &str, variant: &str) {
        self.increment_internal(
            "model_cache_hits_total",
            &[("kind", kind), ("variant", variant)],
        )
        .await;
    }

    /// Set the number of live workers
    pub async fn set_active_workers(&self, count: usize) {
        match validation::validate_usize_conversion(count) {
            Ok(value) => self.set_gauge_internal("active_workers", value, &[]).await,
            Err(e) => warn!("Failed to record active worker count {}: {}", count, e),
        }
    }

    /// Record a split operation and the number of chunks it produced
    pub async fn record_batch_created(&self, chunks: usize, auto_start: bool) {
        let auto_start = if auto_start { "true" } else { "false" };
        self.increment_internal("batches_created_total", &[("auto_start", auto_start)])
            .await;
        if let Ok(value) = validation::validate_usize_conversion(chunks) {
            self.observe_histogram_internal("batch_chunk_count", value, &[])
                .await;
        }
    }
}

/// Factory function to create metrics exporter based on configuration
pub fn create_metrics_exporter(
    exporter_type: &str,
    endpoint: Option<&str>,
    prefix: Option<&str>,
    sample_rate: Option<f64>,
) -> Result<Arc<dyn MetricsExporter>, MetricsError> {
    match exporter_type.to_lowercase().as_str() {
        "prometheus" => {
            debug!("Initializing Prometheus metrics exporter");
            Ok(Arc::new(PrometheusExporter::from_env()?))
        }
        "statsd" => {
            let endpoint = endpoint.unwrap_or("127.0.0.1:8125");
            debug!(
                "Initializing StatsD metrics exporter with endpoint: {}, prefix: {:?}, sample_rate: {:?}",
                endpoint, prefix, sample_rate
            );
            let exporter = StatsDExporter::new(endpoint, prefix.map(|s| s.to_string()), sample_rate)?;
            Ok(Arc::new(exporter))
        }
        "none" | "null" | "disabled" => {
            debug!("Metrics disabled, using null exporter");
            Ok(Arc::new(NullExporter))
        }
        other => {
            warn!("Unknown metrics exporter type '{}', using null exporter", other);
            Ok(Arc::new(NullExporter))
        }
    }
}

/// Prometheus exporter with default settings
pub fn create_prometheus_exporter() -> Arc<dyn MetricsExporter> {
    Arc::new(PrometheusExporter::new())
}

/// No-op exporter
pub fn create_null_exporter() -> Arc<dyn MetricsExporter> {
    Arc::new(NullExporter)
}
