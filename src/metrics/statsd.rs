/// StatsD exporter
///
/// Push-based exporter sending one UDP datagram per metric event:
/// - Counters: `name:1|c[|@rate][|#k:v,...]`
/// - Gauges: `name:value|g[|#k:v,...]`
/// - Timers: `name:value|ms[|@rate][|#k:v,...]`
use crate::metrics::error::MetricsError;
use crate::metrics::metrics::MetricsExporter;
use async_trait::async_trait;
use log::{debug, error};
use std::net::SocketAddr;
use tokio::net::UdpSocket;

pub struct StatsDExporter {
    address: SocketAddr,
    prefix: Option<String>,
    /// Fraction of events actually sent (0.0 to 1.0)
    sample_rate: f64,
}

impl StatsDExporter {
    /// Create a new StatsD exporter for a `host:port` endpoint
    pub fn new(
        endpoint: &str,
        prefix: Option<String>,
        sample_rate: Option<f64>,
    ) -> Result<Self, MetricsError> {
        let address = endpoint.replacen("localhost:", "127.0.0.1:", 1);
        let address = address.parse::<SocketAddr>().map_err(|e| {
            MetricsError::configuration_error(format!(
                "Invalid StatsD endpoint '{}': {}",
                endpoint, e
            ))
        })?;

        let sample_rate = sample_rate.unwrap_or(1.0);
        if !(0.0..=1.0).contains(&sample_rate) {
            return Err(MetricsError::configuration_error(
                "Sample rate must be between 0.0 and 1.0",
            ));
        }

        Ok(Self {
            address,
            prefix,
            sample_rate,
        })
    }

    fn metric_name(&self, name: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}.{}", prefix, name),
            None => name.to_string(),
        }
    }

    fn tags(labels: &[(&str, &str)]) -> String {
        if labels.is_empty() {
            return String::new();
        }
        let tags: Vec<String> = labels
            .iter()
            .map(|(key, value)| format!("{}:{}", key, value))
            .collect();
        format!("|#{}", tags.join(","))
    }

    fn rate(&self) -> String {
        if self.sample_rate < 1.0 {
            format!("|@{}", self.sample_rate)
        } else {
            String::new()
        }
    }

    /// Format a counter line; exposed for tests
    pub fn counter_line(&self, name: &str, labels: &[(&str, &str)]) -> String {
        format!("{}:1|c{}{}", self.metric_name(name), self.rate(), Self::tags(labels))
    }

    async fn send(&self, message: &str) {
        if self.sample_rate < 1.0 && fastrand::f64() > self.sample_rate {
            return;
        }

        match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => {
                if let Err(e) = socket.send_to(message.as_bytes(), &self.address).await {
                    error!("Failed to send StatsD metric: {}", e);
                    return;
                }
                debug!("Sent StatsD metric: {}", message);
            }
            Err(e) => error!("Failed to create UDP socket for StatsD: {}", e),
        }
    }
}

#[async_trait]
impl MetricsExporter for StatsDExporter {
    async fn increment(&self, name: &str, labels: &[(&str, &str)]) -> Result<(), MetricsError> {
        let message = self.counter_line(name, labels);
        self.send(&message).await;
        Ok(())
    }

    async fn set_gauge(
        &self,
        name: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) -> Result<(), MetricsError> {
        let message = format!("{}:{}|g{}", self.metric_name(name), value, Self::tags(labels));
        self.send(&message).await;
        Ok(())
    }

    async fn observe_histogram(
        &self,
        name: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) -> Result<(), MetricsError> {
        // Durations are recorded in seconds, StatsD timers expect milliseconds
        let value = if name.ends_with("_seconds") {
            value * 1000.0
        } else {
            value
        };
        let message = format!(
            "{}:{}|ms{}{}",
            self.metric_name(name),
            value,
            self.rate(),
            Self::tags(labels)
        );
        self.send(&message).await;
        Ok(())
    }

    /// StatsD is push-based; there is nothing to export
    async fn export(&self) -> Result<Vec<u8>, MetricsError> {
        Ok(vec![])
    }
}
