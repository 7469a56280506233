//! Kafka canary producer
//!
//! Periodically sends a probe message to every partition of the canary topic,
//! waits for each acknowledgement, and records produced/failed counts and
//! produce latency per partition.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use anyhow::Result;
use canary::args::Args;
use canary::metrics::{encode_text, ProducerMetrics};
use canary::scheduler::shutdown_signal;
use canary::{CanaryProducer, CanaryScheduler, KafkaClient, KafkaClientConfig, SchedulerConfig};
use clap::Parser;
use prometheus::Registry;
use std::sync::Arc;
use tracing::{error, info};

/// Initializes the global tracing subscriber
///
/// `RUST_LOG` takes precedence; otherwise logs at info, or only errors in quiet mode.
fn setup_logging(quiet: bool) {
    let default_level = if quiet { "error" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::filter::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(default_level)),
        )
        .init();
}

fn print_startup_info(args: &Args, buckets: &[f64]) {
    info!("Starting Kafka canary producer");
    info!(
        "Brokers: {}, topic: {}, client id: {}, interval: {} ms, request timeout: {} ms",
        args.bootstrap_servers,
        args.topic,
        args.client_id,
        args.reconcile_interval_ms,
        args.request_timeout_ms
    );
    match args.partitions {
        Some(count) => info!("Partitions: {} (fixed)", count),
        None => info!("Partitions: from topic metadata"),
    }
    info!("Latency buckets (ms): {:?}", buckets);
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.quiet);

    let buckets = args.latency_buckets()?;
    let reconcile_interval = args.reconcile_interval()?;
    let request_timeout = args.request_timeout()?;
    print_startup_info(&args, &buckets);

    let client = Arc::new(
        KafkaClient::connect(KafkaClientConfig {
            bootstrap_servers: args.bootstrap_list()?,
            client_id: args.client_id.clone(),
            request_timeout,
        })
        .await?,
    );

    let registry = Registry::new();
    let metrics = ProducerMetrics::register(&registry, buckets)?;
    let producer = Arc::new(CanaryProducer::new(args.client_id.clone(), client.clone(), metrics));

    let scheduler = CanaryScheduler::new(
        producer.clone(),
        client,
        SchedulerConfig {
            topic: args.topic.clone(),
            reconcile_interval,
            partitions: args.partitions,
        },
    );
    scheduler.run(shutdown_signal()).await;

    if args.print_metrics {
        println!("{}", encode_text(&registry)?);
    }

    if let Err(e) = producer.close().await {
        error!("Error closing canary producer: {:#}", e);
        std::process::exit(1);
    }

    info!("Canary stopped after {} messages", producer.last_message_id().await);
    Ok(())
}
