//! Kafka canary producer library
//!
//! Sends one probe message to every partition of a canary topic on a fixed
//! interval and records per-partition produce outcomes and latency as
//! Prometheus metrics.

pub mod args;
pub mod broker;
pub mod clock;
pub mod kafka_client;
pub mod message;
pub mod metrics;
pub mod producer;
pub mod scheduler;

// Re-export commonly used types
pub use broker::{BrokerClient, DeliveryReport};
pub use kafka_client::{KafkaClient, KafkaClientConfig};
pub use message::{CanaryMessage, MessageFactory};
pub use metrics::ProducerMetrics;
pub use producer::{CanaryProducer, SendOutcome};
pub use scheduler::{CanaryScheduler, SchedulerConfig};
