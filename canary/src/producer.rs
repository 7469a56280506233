//! Canary producer sending one probe message to every partition of a topic
//!
//! This module contains the `CanaryProducer`, which owns the broker client
//! handle and the message sequence, fans a probe message out to each partition
//! in turn and records the outcome of every attempt in `ProducerMetrics`.

use crate::broker::BrokerClient;
use crate::clock::{Clock, SystemClock};
use crate::message::{CanaryMessage, MessageFactory};
use crate::metrics::ProducerMetrics;
use anyhow::Result;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Result of one send attempt to one partition
///
/// Only used to drive metric updates; discarded afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    /// Partition the message was addressed to
    pub partition: i32,
    /// Whether the broker acknowledged the record
    pub success: bool,
    /// Broker-assigned offset, on success
    pub delivered_offset: Option<i64>,
    /// Acknowledgement time minus message creation time, on success
    pub latency_millis: Option<i64>,
}

impl SendOutcome {
    pub fn delivered(partition: i32, offset: i64, latency_millis: i64) -> Self {
        Self {
            partition,
            success: true,
            delivered_offset: Some(offset),
            latency_millis: Some(latency_millis),
        }
    }

    pub fn failed(partition: i32) -> Self {
        Self {
            partition,
            success: false,
            delivered_offset: None,
            latency_millis: None,
        }
    }
}

/// State guarded by the producer's mutex for the duration of a fan-out
pub(crate) struct ProducerState {
    /// Source of message sequence numbers
    factory: MessageFactory,
    /// Set once `close` has been called successfully
    closed: bool,
}

/// Canary producer writing probe messages to every partition of a topic
///
/// Sends are sequential: each partition's send is awaited before the next one
/// starts. Overlapping calls to `send_to_partitions` are serialized.
pub struct CanaryProducer<C> {
    /// Identity written into messages and used as the `clientid` label
    client_id: String,
    /// Broker client owned by this producer until `close`
    client: Arc<C>,
    /// Instruments updated after every send attempt
    metrics: ProducerMetrics,
    /// Time source for creation and acknowledgement timestamps
    clock: Arc<dyn Clock>,
    state: Mutex<ProducerState>,
}

impl<C: BrokerClient> CanaryProducer<C> {
    /// Creates a new CanaryProducer
    ///
    /// # Arguments
    /// * `client_id` - Identity of this canary instance
    /// * `client` - Broker client used for sends, refreshes and close
    /// * `metrics` - Registered instruments to record outcomes into
    pub fn new(client_id: impl Into<String>, client: Arc<C>, metrics: ProducerMetrics) -> Self {
        let client_id = client_id.into();
        Self {
            state: Mutex::new(ProducerState {
                factory: MessageFactory::new(client_id.clone()),
                closed: false,
            }),
            client_id,
            client,
            metrics,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the system clock, e.g. with a `ManualClock`
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Sends one canary message to each partition in `0..partition_count`
    ///
    /// Partitions are visited in increasing order. Every attempt increments the
    /// produced counter; a failed attempt increments the failed counter and the
    /// loop moves on to the next partition without retrying. Nothing is
    /// returned: outcomes are only reported through metrics.
    ///
    /// # Arguments
    /// * `topic` - Topic to write to
    /// * `partition_count` - Number of partitions; 0 is a no-op
    pub async fn send_to_partitions(&self, topic: &str, partition_count: i32) {
        if partition_count < 0 {
            warn!(
                "Ignoring send request with negative partition count {}",
                partition_count
            );
            return;
        }

        let mut state = self.state.lock().await;
        if state.closed {
            error!(
                "Canary producer is closed, not sending to {} partitions of '{}'",
                partition_count, topic
            );
            return;
        }

        for partition in 0..partition_count {
            let message = state.factory.next_message(self.clock.as_ref());
            let outcome = self.send_message(topic, partition, &message).await;
            self.metrics.record(&self.client_id, &outcome);
        }
    }

    /// Sends a single message and measures its latency from creation time
    async fn send_message(&self, topic: &str, partition: i32, message: &CanaryMessage) -> SendOutcome {
        let payload = match message.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode {}: {:#}", message, e);
                return SendOutcome::failed(partition);
            }
        };

        debug!("Sending message: value={} on partition={}", payload, partition);
        let result = self
            .client
            .send_sync(topic, partition, Bytes::from(payload))
            .await;
        let ack_timestamp = self.clock.now_millis();

        match result {
            Ok(report) => {
                let latency = ack_timestamp - message.timestamp;
                debug!(
                    "Message sent: partition={}, offset={}, duration={} ms",
                    report.partition, report.offset, latency
                );
                SendOutcome::delivered(partition, report.offset, latency)
            }
            Err(e) => {
                warn!(
                    "Error sending message {} to partition {}: {:#}",
                    message.message_id, partition, e
                );
                SendOutcome::failed(partition)
            }
        }
    }

    /// Asks the broker client to re-resolve partition leadership for `topic`
    ///
    /// A failure is logged and otherwise ignored.
    pub async fn refresh_metadata(&self, topic: &str) {
        debug!("Producer refreshing metadata for '{}'", topic);
        if let Err(e) = self.client.refresh_metadata(topic).await {
            warn!("Error refreshing producer metadata for '{}': {:#}", topic, e);
        }
    }

    /// Closes the underlying broker client
    ///
    /// The first call returns the client's close result and callers treat an
    /// error as fatal. Calling again after a successful close is a no-op.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            debug!("Canary producer already closed");
            return Ok(());
        }

        info!("Closing canary producer");
        self.client.close().await?;
        state.closed = true;
        info!("Canary producer closed");
        Ok(())
    }

    /// Sequence number of the last message built by this producer
    pub async fn last_message_id(&self) -> u64 {
        self.state.lock().await.factory.last_message_id()
    }

    /// Blocks every fan-out and close until the guard is dropped
    #[cfg(test)]
    pub(crate) async fn lock_state(&self) -> tokio::sync::MutexGuard<'_, ProducerState> {
        self.state.lock().await
    }
}
