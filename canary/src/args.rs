//! Command-line argument types for the canary
//!
//! This module contains the `Args` struct and the parsers for its list-valued
//! options. Every option can also be supplied through an environment variable.

use crate::metrics::validate_buckets;
use anyhow::{anyhow, Result};
use clap::Parser;
use std::time::Duration;

/// Command-line arguments for configuring the canary producer
#[derive(Parser, Debug)]
#[command(name = "canary")]
#[command(about = "Kafka canary producer with per-partition latency metrics")]
pub struct Args {
    /// Comma-separated list of Kafka bootstrap brokers
    #[arg(long, env = "KAFKA_BOOTSTRAP_SERVERS", default_value = "localhost:9092")]
    pub bootstrap_servers: String,

    /// Topic that receives the canary messages
    #[arg(long, env = "TOPIC", default_value = "__canary")]
    pub topic: String,

    /// Client id reported to the brokers and used as the clientid metric label
    #[arg(long, env = "CLIENT_ID", default_value = "canary-client")]
    pub client_id: String,

    /// Comma-separated upper bounds of the produce latency histogram, in milliseconds
    #[arg(long, env = "PRODUCER_LATENCY_BUCKETS", default_value = "2,5,10,20,50,100,200,400")]
    pub producer_latency_buckets: String,

    /// Time between two canary cycles, in milliseconds
    #[arg(long, env = "RECONCILE_INTERVAL_MS", default_value = "30000")]
    pub reconcile_interval_ms: u64,

    /// Maximum time to wait for a broker response, in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "10000")]
    pub request_timeout_ms: u64,

    /// Number of partitions to probe (defaults to the topic's partition count)
    #[arg(long, env = "PARTITIONS")]
    pub partitions: Option<i32>,

    /// Print the collected metrics in Prometheus text format on shutdown
    #[arg(long, default_value = "false")]
    pub print_metrics: bool,

    /// Quiet mode: only log errors
    #[arg(short, long, default_value = "false")]
    pub quiet: bool,
}

impl Args {
    /// Bootstrap broker addresses, trimmed and without empty entries
    pub fn bootstrap_list(&self) -> Result<Vec<String>> {
        let servers: Vec<String> = self
            .bootstrap_servers
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if servers.is_empty() {
            return Err(anyhow!("At least one bootstrap server is required"));
        }
        Ok(servers)
    }

    pub fn latency_buckets(&self) -> Result<Vec<f64>> {
        LatencyBuckets::parse(&self.producer_latency_buckets)
    }

    pub fn reconcile_interval(&self) -> Result<Duration> {
        if self.reconcile_interval_ms == 0 {
            return Err(anyhow!("Reconcile interval must be greater than zero"));
        }
        Ok(Duration::from_millis(self.reconcile_interval_ms))
    }

    /// Request timeout; the broker receives it as an `i32` millisecond count
    pub fn request_timeout(&self) -> Result<Duration> {
        if self.request_timeout_ms == 0 || self.request_timeout_ms > i32::MAX as u64 {
            return Err(anyhow!(
                "Request timeout must be between 1 and {} ms, got {}",
                i32::MAX,
                self.request_timeout_ms
            ));
        }
        Ok(Duration::from_millis(self.request_timeout_ms))
    }
}

/// Parser for the latency histogram bucket list
pub struct LatencyBuckets;

impl LatencyBuckets {
    /// Parses a bucket specification such as "2,5,10,20"
    ///
    /// # Arguments
    /// * `s` - Comma-separated bucket upper bounds; whitespace around entries is ignored
    ///
    /// # Returns
    /// * `Ok(Vec<f64>)` - Bucket bounds in the given order
    /// * `Err(anyhow::Error)` - If an entry is not a number, or the bounds are
    ///   empty, non-finite or not strictly increasing
    pub fn parse(s: &str) -> Result<Vec<f64>> {
        let buckets = s
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                entry
                    .parse::<f64>()
                    .map_err(|e| anyhow!("Invalid latency bucket '{}': {}", entry, e))
            })
            .collect::<Result<Vec<f64>>>()?;
        validate_buckets(&buckets)?;
        Ok(buckets)
    }
}
