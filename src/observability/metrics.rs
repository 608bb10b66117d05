//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Own a per-run Prometheus recorder (never the global one, so several
//!   runs can live in one process)
//! - Hand app code counters, gauges and histograms registered on it
//! - Render the Prometheus text exposition for the HTTP listener
//!
//! # Design Decisions
//! - Handles are the `metrics` crate types; updates are atomic operations
//! - Histogram buckets come from configuration and apply to every histogram

use std::fmt;
use std::sync::Arc;

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Label, Level, Metadata, Recorder, SharedString, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use thiserror::Error;

/// Errors raised by the metrics subsystem.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("invalid histogram buckets: {0}")]
    Buckets(String),

    #[error("metrics server already running")]
    AlreadyRunning,

    #[error("failed to bind metrics listener on {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },
}

/// Name, help text and constant labels of a metric.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDescriptor {
    pub name: String,
    pub help: String,
    pub unit: Option<Unit>,
    pub labels: Vec<(String, String)>,
}

impl MetricDescriptor {
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            unit: None,
            labels: Vec::new(),
        }
    }

    pub fn unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }

    fn key(&self) -> Key {
        let labels: Vec<Label> = self
            .labels
            .iter()
            .map(|(k, v)| Label::new(k.clone(), v.clone()))
            .collect();
        Key::from_parts(self.name.clone(), labels)
    }

    fn key_name(&self) -> KeyName {
        KeyName::from(self.name.clone())
    }

    fn description(&self) -> SharedString {
        SharedString::from(self.help.clone())
    }
}

/// Recorder plus the handle used to render it.
pub struct MetricsRegistry {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
}

impl MetricsRegistry {
    pub fn new(histogram_buckets: &[f64]) -> Result<Self, MetricsError> {
        let recorder = PrometheusBuilder::new()
            .set_buckets(histogram_buckets)
            .map_err(|e| MetricsError::Buckets(e.to_string()))?
            .build_recorder();
        let handle = recorder.handle();
        Ok(Self { recorder, handle })
    }

    /// Prometheus text exposition of everything registered so far.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRegistry").finish_non_exhaustive()
    }
}

fn metadata() -> Metadata<'static> {
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()))
}

/// App-facing metrics interface.
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Arc<MetricsRegistry>,
}

impl Metrics {
    pub fn new(registry: Arc<MetricsRegistry>) -> Self {
        Self { registry }
    }

    pub fn counter(&self, descriptor: &MetricDescriptor) -> Counter {
        let recorder = &self.registry.recorder;
        recorder.describe_counter(descriptor.key_name(), descriptor.unit, descriptor.description());
        recorder.register_counter(&descriptor.key(), &metadata())
    }

    pub fn gauge(&self, descriptor: &MetricDescriptor) -> Gauge {
        let recorder = &self.registry.recorder;
        recorder.describe_gauge(descriptor.key_name(), descriptor.unit, descriptor.description());
        recorder.register_gauge(&descriptor.key(), &metadata())
    }

    pub fn histogram(&self, descriptor: &MetricDescriptor) -> Histogram {
        let recorder = &self.registry.recorder;
        recorder.describe_histogram(descriptor.key_name(), descriptor.unit, descriptor.description());
        recorder.register_histogram(&descriptor.key(), &metadata())
    }

    pub fn render(&self) -> String {
        self.registry.render()
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> Metrics {
        Metrics::new(Arc::new(MetricsRegistry::new(&[0.1, 1.0, 10.0]).unwrap()))
    }

    #[test]
    fn test_counter_is_rendered_with_help() {
        let metrics = metrics();
        let counter = metrics.counter(&MetricDescriptor::new("ticks_total", "Number of ticks"));
        counter.increment(3);

        let output = metrics.render();
        assert!(output.contains("# HELP ticks_total Number of ticks"));
        assert!(output.contains("ticks_total 3"));
    }

    #[test]
    fn test_labels_and_gauge() {
        let metrics = metrics();
        let gauge = metrics.gauge(&MetricDescriptor::new("queue_depth", "Items queued").label("queue", "main"));
        gauge.set(7.0);

        let output = metrics.render();
        assert!(output.contains("queue_depth{queue=\"main\"} 7"));
    }

    #[test]
    fn test_histogram_uses_configured_buckets() {
        let metrics = metrics();
        let histogram = metrics.histogram(&MetricDescriptor::new("latency_seconds", "Latency"));
        histogram.record(0.5);

        let output = metrics.render();
        assert!(output.contains("# TYPE latency_seconds histogram"));
        assert!(output.contains("latency_seconds_bucket{le="));
        assert!(output.contains("latency_seconds_count 1"));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = metrics();
        let b = metrics();
        a.counter(&MetricDescriptor::new("only_in_a", "a")).increment(1);
        assert!(a.render().contains("only_in_a"));
        assert!(!b.render().contains("only_in_a"));
    }

    #[test]
    fn test_empty_buckets_rejected() {
        assert!(matches!(MetricsRegistry::new(&[]), Err(MetricsError::Buckets(_))));
    }
}
