//! Prometheus instruments for produced canary records.
//!
//! Instruments are registered on a caller-supplied `Registry` instead of the
//! process-wide default one, so each producer (and each test) gets its own set.

use crate::producer::SendOutcome;
use anyhow::{anyhow, Context, Result};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::warn;

/// Namespace prefixed to every canary metric name
pub const NAMESPACE: &str = "strimzi_canary";

/// Label names shared by all producer instruments
const LABELS: [&str; 2] = ["clientid", "partition"];

/// Per-partition producer instruments, labeled by client id and partition
#[derive(Clone)]
pub struct ProducerMetrics {
    /// Send attempts, successful or not
    pub records_produced: IntCounterVec,
    /// Failed send attempts
    pub records_produced_failed: IntCounterVec,
    /// Latency in milliseconds from message creation to acknowledgement
    pub records_produced_latency: HistogramVec,
    /// Acknowledgements timestamped before the message was created
    pub records_produced_clock_skew: IntCounterVec,
}

impl ProducerMetrics {
    /// Creates the instruments and registers them on `registry`
    ///
    /// # Arguments
    /// * `registry` - Registry the instruments are exposed through
    /// * `latency_buckets` - Histogram bucket upper bounds, in milliseconds
    ///
    /// # Returns
    /// * `Err(anyhow::Error)` - If the buckets are invalid or a metric with the
    ///   same name is already registered
    pub fn register(registry: &Registry, latency_buckets: Vec<f64>) -> Result<Self> {
        validate_buckets(&latency_buckets)?;

        let records_produced = IntCounterVec::new(
            Opts::new("records_produced_total", "The total number of records produced")
                .namespace(NAMESPACE),
            &LABELS,
        )?;
        let records_produced_failed = IntCounterVec::new(
            Opts::new(
                "records_produced_failed_total",
                "The total number of records failed to produce",
            )
            .namespace(NAMESPACE),
            &LABELS,
        )?;
        let records_produced_latency = HistogramVec::new(
            HistogramOpts::new(
                "records_produced_latency",
                "Records produced latency in milliseconds",
            )
            .namespace(NAMESPACE)
            .buckets(latency_buckets),
            &LABELS,
        )?;
        let records_produced_clock_skew = IntCounterVec::new(
            Opts::new(
                "records_produced_clock_skew_total",
                "The total number of records acknowledged before their creation timestamp",
            )
            .namespace(NAMESPACE),
            &LABELS,
        )?;

        registry.register(Box::new(records_produced.clone()))?;
        registry.register(Box::new(records_produced_failed.clone()))?;
        registry.register(Box::new(records_produced_latency.clone()))?;
        registry.register(Box::new(records_produced_clock_skew.clone()))?;

        Ok(Self {
            records_produced,
            records_produced_failed,
            records_produced_latency,
            records_produced_clock_skew,
        })
    }

    /// Applies the outcome of one send attempt to the instruments
    pub fn record(&self, client_id: &str, outcome: &SendOutcome) {
        let partition = outcome.partition.to_string();
        let labels = [client_id, partition.as_str()];

        self.records_produced.with_label_values(&labels).inc();

        if !outcome.success {
            self.records_produced_failed.with_label_values(&labels).inc();
            return;
        }

        if let Some(latency) = outcome.latency_millis {
            if latency < 0 {
                warn!(
                    "Negative produce latency {} ms on partition {}: clock skew between message creation and acknowledgement",
                    latency, outcome.partition
                );
                self.records_produced_clock_skew.with_label_values(&labels).inc();
            }
            self.records_produced_latency
                .with_label_values(&labels)
                .observe(latency as f64);
        }
    }
}

/// Checks histogram bucket bounds: non-empty, finite and strictly increasing
///
/// Prometheus only validates buckets when the first labeled child is created,
/// which would turn a configuration error into a panic in the send loop.
pub fn validate_buckets(buckets: &[f64]) -> Result<()> {
    if buckets.is_empty() {
        return Err(anyhow!("Latency buckets must not be empty"));
    }
    if let Some(bound) = buckets.iter().find(|b| !b.is_finite()) {
        return Err(anyhow!("Latency bucket {} is not a finite number", bound));
    }
    if let Some(pair) = buckets.windows(2).find(|pair| pair[0] >= pair[1]) {
        return Err(anyhow!(
            "Latency buckets must be strictly increasing: {} is followed by {}",
            pair[0],
            pair[1]
        ));
    }
    Ok(())
}

/// Renders every metric in `registry` in the Prometheus text exposition format
pub fn encode_text(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("Failed to encode metrics")?;
    String::from_utf8(buffer).context("Metrics output is not valid UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> (Registry, ProducerMetrics) {
        let registry = Registry::new();
        let metrics = ProducerMetrics::register(&registry, vec![5.0, 10.0, 20.0]).unwrap();
        (registry, metrics)
    }

    #[test]
    fn test_success_records_attempt_and_latency() {
        let (_registry, metrics) = metrics();
        metrics.record("c", &SendOutcome::delivered(0, 12, 7));

        assert_eq!(metrics.records_produced.with_label_values(&["c", "0"]).get(), 1);
        assert_eq!(metrics.records_produced_failed.with_label_values(&["c", "0"]).get(), 0);
        let histogram = metrics.records_produced_latency.with_label_values(&["c", "0"]);
        assert_eq!(histogram.get_sample_count(), 1);
        assert_eq!(histogram.get_sample_sum(), 7.0);
    }

    #[test]
    fn test_failure_records_attempt_without_latency() {
        let (_registry, metrics) = metrics();
        metrics.record("c", &SendOutcome::failed(3));

        assert_eq!(metrics.records_produced.with_label_values(&["c", "3"]).get(), 1);
        assert_eq!(metrics.records_produced_failed.with_label_values(&["c", "3"]).get(), 1);
        assert_eq!(
            metrics
                .records_produced_latency
                .with_label_values(&["c", "3"])
                .get_sample_count(),
            0
        );
    }

    #[test]
    fn test_negative_latency_is_counted_not_clamped() {
        let (_registry, metrics) = metrics();
        metrics.record("c", &SendOutcome::delivered(1, 0, -4));

        assert_eq!(
            metrics.records_produced_clock_skew.with_label_values(&["c", "1"]).get(),
            1
        );
        let histogram = metrics.records_produced_latency.with_label_values(&["c", "1"]);
        assert_eq!(histogram.get_sample_count(), 1);
        assert_eq!(histogram.get_sample_sum(), -4.0);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Registry::new();
        ProducerMetrics::register(&registry, vec![1.0]).unwrap();
        assert!(ProducerMetrics::register(&registry, vec![1.0]).is_err());
    }

    #[test]
    fn test_unsorted_buckets_fail() {
        let registry = Registry::new();
        assert!(ProducerMetrics::register(&registry, vec![10.0, 5.0]).is_err());
    }

    #[test]
    fn test_validate_buckets() {
        assert!(validate_buckets(&[2.0, 5.0, 10.0]).is_ok());
        assert!(validate_buckets(&[]).is_err());
        assert!(validate_buckets(&[5.0, 5.0]).is_err());
        assert!(validate_buckets(&[1.0, f64::INFINITY]).is_err());
    }

    #[test]
    fn test_encode_text_contains_namespaced_names() {
        let (registry, metrics) = metrics();
        metrics.record("c", &SendOutcome::delivered(0, 1, 3));
        metrics.record("c", &SendOutcome::failed(1));

        let text = encode_text(&registry).unwrap();
        assert!(text.contains("strimzi_canary_records_produced_total{clientid=\"c\",partition=\"0\"} 1"));
        assert!(text.contains("strimzi_canary_records_produced_failed_total{clientid=\"c\",partition=\"1\"} 1"));
        assert!(text.contains("strimzi_canary_records_produced_latency_bucket"));
    }
}
