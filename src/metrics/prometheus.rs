//! Prometheus exporter
//!
//! Metrics are created lazily on first use and registered in a private
//! registry. Label names are canonicalized (sorted) so that call sites may pass
//! labels in any order.

use crate::metrics::error::{validation, MetricsError};
use crate::metrics::metrics::MetricsExporter;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::debug;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

const DEFAULT_MAX_METRICS: usize = 1000;

/// Prometheus implementation of MetricsExporter
pub struct PrometheusExporter {
    registry: Registry,
    counters: DashMap<String, CounterVec>,
    gauges: DashMap<String, GaugeVec>,
    histograms: DashMap<String, HistogramVec>,
    /// Upper bound on distinct metric names
    max_metrics: usize,
    /// Optional prefix for every metric name
    namespace: Option<String>,
    metric_count: AtomicUsize,
}

impl PrometheusExporter {
    pub fn new() -> Self {
        Self::with_settings(None, DEFAULT_MAX_METRICS)
    }

    pub fn with_settings(namespace: Option<String>, max_metrics: usize) -> Self {
        let capacity = (max_metrics / 3).max(16);
        Self {
            registry: Registry::new(),
            counters: DashMap::with_capacity(capacity),
            gauges: DashMap::with_capacity(capacity),
            histograms: DashMap::with_capacity(capacity),
            max_metrics,
            namespace,
            metric_count: AtomicUsize::new(0),
        }
    }

    /// Create PrometheusExporter from environment variables
    ///
    /// - PROMETHEUS_NAMESPACE: namespace prefix for metrics (optional)
    /// - PROMETHEUS_MAX_METRICS: maximum number of metrics to track (default: 1000)
    pub fn from_env() -> Result<Self, MetricsError> {
        let namespace = std::env::var("PROMETHEUS_NAMESPACE").ok();
        if let Some(ns) = &namespace {
            validation::validate_metric_name(ns).map_err(|e| {
                MetricsError::configuration_error(format!(
                    "Invalid PROMETHEUS_NAMESPACE '{}': {}",
                    ns, e
                ))
            })?;
        }

        let max_metrics = std::env::var("PROMETHEUS_MAX_METRICS")
            .ok()
            .and_then(|val| val.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_METRICS);
        if max_metrics == 0 {
            return Err(MetricsError::configuration_error(
                "PROMETHEUS_MAX_METRICS must be greater than 0",
            ));
        }

        Ok(Self::with_settings(namespace, max_metrics))
    }

    pub fn metric_count(&self) -> usize {
        self.metric_count.load(Ordering::SeqCst)
    }

    fn apply_namespace(&self, name: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{}_{}", ns, name),
            None => name.to_string(),
        }
    }

    fn help_text(name: &str, metric_type: &str) -> String {
        format!("{} ({})", name.replace('_', " "), metric_type)
    }

    fn reserve_slot(&self) -> Result<(), MetricsError> {
        let mut current = self.metric_count.load(Ordering::Relaxed);
        loop {
            if current >= self.max_metrics {
                return Err(MetricsError::resource_limit_exceeded(format!(
                    "Maximum number of metrics ({}) exceeded",
                    self.max_metrics
                )));
            }
            match self.metric_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn release_slot(&self) {
        self.metric_count.fetch_sub(1, Ordering::SeqCst);
    }

    fn check_type_conflict(&self, full_name: &str, metric_type: &str) -> Result<(), MetricsError> {
        let existing = [
            (self.counters.contains_key(full_name), "counter"),
            (self.gauges.contains_key(full_name), "gauge"),
            (self.histograms.contains_key(full_name), "histogram"),
        ];
        for (exists, existing_type) in existing {
            if exists && existing_type != metric_type {
                return Err(MetricsError::registration_failed(
                    full_name,
                    format!(
                        "already registered as {}, cannot register as {}",
                        existing_type, metric_type
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Shared get-or-create for the three metric maps
    fn get_or_create<M, F>(
        &self,
        map: &DashMap<String, M>,
        name: &str,
        metric_type: &str,
        build: F,
    ) -> Result<M, MetricsError>
    where
        M: Clone + prometheus::core::Collector + 'static,
        F: FnOnce(&str, &str) -> prometheus::Result<M>,
    {
        let full_name = self.apply_namespace(name);
        self.check_type_conflict(&full_name, metric_type)?;

        if let Some(metric) = map.get(&full_name) {
            return Ok(metric.clone());
        }

        match map.entry(full_name.clone()) {
            Entry::Occupied(e) => Ok(e.get().clone()),
            Entry::Vacant(e) => {
                self.reserve_slot()?;
                let help = Self::help_text(name, metric_type);
                let metric = build(&full_name, &help).map_err(|err| {
                    self.release_slot();
                    MetricsError::registration_failed(name, err.to_string())
                })?;
                if let Err(err) = self.registry.register(Box::new(metric.clone())) {
                    self.release_slot();
                    return Err(MetricsError::registration_failed(name, err.to_string()));
                }
                Ok(e.insert(metric).clone())
            }
        }
    }

    /// Bucket layout chosen from the metric name
    fn histogram_buckets(name: &str) -> Vec<f64> {
        if name.contains("duration") || name.contains("seconds") {
            // Jobs run from seconds to hours
            vec![
                0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0,
            ]
        } else if name.contains("count") {
            vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0]
        } else {
            prometheus::DEFAULT_BUCKETS.to_vec()
        }
    }

    /// Sorted label names with their values in matching order
    fn split_labels<'a>(
        labels: &'a [(&'a str, &'a str)],
    ) -> (Vec<String>, Vec<&'a str>) {
        let values: HashMap<&str, &str> = labels.iter().copied().collect();
        let mut names: Vec<String> = labels.iter().map(|(k, _)| k.to_string()).collect();
        names.sort();
        let ordered = names.iter().map(|n| values[n.as_str()]).collect();
        (names, ordered)
    }
}

impl Default for PrometheusExporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricsExporter for PrometheusExporter {
    async fn increment(&self, name: &str, labels: &[(&str, &str)]) -> Result<(), MetricsError> {
        validation::validate_metric_name(name)?;
        validation::validate_labels(labels)?;
        let (names, values) = Self::split_labels(labels);
        let counter = self.get_or_create(&self.counters, name, "counter", |full, help| {
            let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
            CounterVec::new(Opts::new(full, help), &refs)
        })?;
        counter
            .get_metric_with_label_values(&values)
            .map_err(|e| MetricsError::invalid_label(name, e.to_string()))?
            .inc();
        debug!("Incremented counter {} with labels {:?}", name, labels);
        Ok(())
    }

    async fn set_gauge(
        &self,
        name: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) -> Result<(), MetricsError> {
        validation::validate_metric_name(name)?;
        validation::validate_labels(labels)?;
        validation::validate_numeric_value(value)?;
        let (names, values) = Self::split_labels(labels);
        let gauge = self.get_or_create(&self.gauges, name, "gauge", |full, help| {
            let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
            GaugeVec::new(Opts::new(full, help), &refs)
        })?;
        gauge
            .get_metric_with_label_values(&values)
            .map_err(|e| MetricsError::invalid_label(name, e.to_string()))?
            .set(value);
        Ok(())
    }

    async fn observe_histogram(
        &self,
        name: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) -> Result<(), MetricsError> {
        validation::validate_metric_name(name)?;
        validation::validate_labels(labels)?;
        validation::validate_numeric_value(value)?;
        let (names, values) = Self::split_labels(labels);
        let histogram = self.get_or_create(&self.histograms, name, "histogram", |full, help| {
            let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
            let opts = HistogramOpts::new(full, help).buckets(Self::histogram_buckets(name));
            HistogramVec::new(opts, &refs)
        })?;
        histogram
            .get_metric_with_label_values(&values)
            .map_err(|e| MetricsError::invalid_label(name, e.to_string()))?
            .observe(value);
        Ok(())
    }

    async fn export(&self) -> Result<Vec<u8>, MetricsError> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| MetricsError::export_failed(format!("Failed to encode metrics: {}", e)))?;
        Ok(buffer)
    }
}
