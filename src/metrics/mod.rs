// Metrics for the transcription job service
//
// This module contains the metrics facade and its exporters. Job lifecycle
// events (starts, resumes, restarts, stage changes, model loads, stale worker
// exits) are recorded through `Metrics` and exported to Prometheus, StatsD or
// nowhere, depending on configuration.

pub mod error;
pub mod metrics;
pub mod null;
pub mod prometheus;
pub mod statsd;

#[cfg(test)]
mod tests;

pub use error::MetricsError;
pub use metrics::{
    create_metrics_exporter, create_null_exporter, create_prometheus_exporter, Metrics,
    MetricsExporter,
};
