//! Periodic canary cycle driver
//!
//! `CanaryScheduler` wakes up every reconcile interval, refreshes topic metadata
//! and sends one probe to every partition. It runs until the shutdown future
//! completes.

use crate::broker::BrokerClient;
use crate::producer::CanaryProducer;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Settings for the canary cycle
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Topic that receives the probes
    pub topic: String,
    /// Time between two cycles
    pub reconcile_interval: Duration,
    /// Fixed partition count; when unset the count comes from topic metadata
    pub partitions: Option<i32>,
}

pub struct CanaryScheduler<C> {
    producer: Arc<CanaryProducer<C>>,
    client: Arc<C>,
    config: SchedulerConfig,
}

impl<C: BrokerClient> CanaryScheduler<C> {
    pub fn new(producer: Arc<CanaryProducer<C>>, client: Arc<C>, config: SchedulerConfig) -> Self {
        Self {
            producer,
            client,
            config,
        }
    }

    /// Runs one cycle: refresh metadata, resolve the partition count, fan out
    ///
    /// # Returns
    /// * The number of partitions probed, 0 when the count is unknown
    pub async fn run_cycle(&self) -> i32 {
        let topic = self.config.topic.as_str();
        self.producer.refresh_metadata(topic).await;

        let partition_count = match self.config.partitions {
            Some(count) => Some(count),
            None => self.client.partition_count(topic).await,
        };

        match partition_count {
            Some(count) => {
                debug!("Sending canary messages to {} partitions of '{}'", count, topic);
                self.producer.send_to_partitions(topic, count).await;
                count.max(0)
            }
            None => {
                warn!("Partition count for '{}' is unknown, skipping this cycle", topic);
                0
            }
        }
    }

    /// Runs cycles every reconcile interval until `shutdown` completes
    ///
    /// The first cycle starts immediately. `shutdown` is checked before every
    /// tick and between cycles; a cycle in progress when it completes runs to
    /// the end first.
    ///
    /// # Returns
    /// * The number of cycles started
    pub async fn run<F>(&self, shutdown: F) -> u64
    where
        F: Future<Output = ()>,
    {
        info!(
            "Starting canary on '{}' every {} ms",
            self.config.topic,
            self.config.reconcile_interval.as_millis()
        );

        let mut reconcile_interval = interval(self.config.reconcile_interval);
        reconcile_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let mut cycles = 0u64;
        loop {
            select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested after {} cycles", cycles);
                    break;
                }
                _ = reconcile_interval.tick() => {
                    cycles += 1;
                    self.run_cycle().await;
                }
            }
        }
        cycles
    }
}

/// Completes when the process receives Ctrl-C or, on Unix, SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::FakeBrokerClient;
    use crate::metrics::ProducerMetrics;
    use prometheus::Registry;
    use tokio::time::sleep;

    fn scheduler(
        client: Arc<FakeBrokerClient>,
        partitions: Option<i32>,
    ) -> (CanaryScheduler<FakeBrokerClient>, Arc<CanaryProducer<FakeBrokerClient>>) {
        let metrics = ProducerMetrics::register(&Registry::new(), vec![5.0, 10.0]).unwrap();
        let producer = Arc::new(CanaryProducer::new("sched", client.clone(), metrics));
        let config = SchedulerConfig {
            topic: "__canary".to_string(),
            reconcile_interval: Duration::from_millis(1000),
            partitions,
        };
        (CanaryScheduler::new(producer.clone(), client, config), producer)
    }

    #[tokio::test]
    async fn test_cycle_uses_metadata_partition_count() {
        let client = Arc::new(FakeBrokerClient::default());
        client.set_partitions(3);
        let (scheduler, producer) = scheduler(client.clone(), None);

        assert_eq!(scheduler.run_cycle().await, 3);
        assert_eq!(*client.refresh_calls.lock().unwrap(), 1);
        let partitions: Vec<i32> = client.sent().iter().map(|r| r.partition).collect();
        assert_eq!(partitions, vec![0, 1, 2]);
        assert_eq!(producer.last_message_id().await, 3);
    }

    #[tokio::test]
    async fn test_cycle_prefers_configured_partition_count() {
        let client = Arc::new(FakeBrokerClient::default());
        client.set_partitions(6);
        let (scheduler, _producer) = scheduler(client.clone(), Some(2));

        assert_eq!(scheduler.run_cycle().await, 2);
        assert_eq!(client.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_cycle_skips_unknown_partition_count() {
        let client = Arc::new(FakeBrokerClient::default());
        *client.fail_refresh.lock().unwrap() = true;
        let (scheduler, producer) = scheduler(client.clone(), None);

        assert_eq!(scheduler.run_cycle().await, 0);
        assert_eq!(*client.refresh_calls.lock().unwrap(), 1);
        assert!(client.sent().is_empty());
        assert_eq!(producer.last_message_id().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_in_progress_finishes_before_shutdown() {
        let clock = Arc::new(crate::clock::ManualClock::new(0));
        let client = Arc::new(FakeBrokerClient::with_clock(clock, 0));
        client.set_partitions(4);
        let (scheduler, producer) = scheduler(client.clone(), None);

        let shutdown = Arc::new(tokio::sync::Notify::new());
        let trigger = shutdown.clone();
        // Completes while the first cycle's fan-out is still queued on the producer lock
        let guard = producer.lock_state().await;
        let run = tokio::spawn(async move { scheduler.run(async move { trigger.notified().await }).await });
        tokio::task::yield_now().await;
        shutdown.notify_one();
        drop(guard);

        assert_eq!(run.await.unwrap(), 1);
        assert_eq!(client.sent().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_until_shutdown() {
        let client = Arc::new(FakeBrokerClient::default());
        client.set_partitions(2);
        let (scheduler, producer) = scheduler(client.clone(), None);

        // Ticks at 0, 1000 and 2000 ms fire before shutdown at 2500 ms
        let cycles = scheduler.run(sleep(Duration::from_millis(2500))).await;

        assert_eq!(cycles, 3);
        assert_eq!(*client.refresh_calls.lock().unwrap(), 3);
        assert_eq!(client.sent().len(), 6);
        assert_eq!(producer.last_message_id().await, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_without_cycles_when_shutdown_already_completed() {
        let client = Arc::new(FakeBrokerClient::default());
        client.set_partitions(1);
        let (scheduler, _producer) = scheduler(client.clone(), None);

        let cycles = scheduler.run(std::future::ready(())).await;
        assert_eq!(cycles, 0);
        assert_eq!(*client.refresh_calls.lock().unwrap(), 0);
        assert!(client.sent().is_empty());
    }
}
