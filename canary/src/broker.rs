//! Broker client contract used by the canary producer
//!
//! The producer never talks to the network directly. It drives a `BrokerClient`,
//! which `KafkaClient` implements over the Kafka wire protocol and tests replace
//! with an in-memory fake.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Broker acknowledgement of a single produced record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Partition that accepted the record
    pub partition: i32,
    /// Offset assigned by the broker
    pub offset: i64,
}

/// Operations the canary needs from a broker client
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Sends `payload` to an explicit partition and waits for the acknowledgement
    ///
    /// Returns an error if the broker rejects the record, the connection fails,
    /// or the client's request timeout elapses.
    async fn send_sync(&self, topic: &str, partition: i32, payload: Bytes) -> Result<DeliveryReport>;

    /// Re-resolves partition leadership for `topic`
    async fn refresh_metadata(&self, topic: &str) -> Result<()>;

    /// Number of partitions of `topic` as of the last metadata refresh
    async fn partition_count(&self, topic: &str) -> Option<i32>;

    /// Releases connections held by the client
    async fn close(&self) -> Result<()>;
}
