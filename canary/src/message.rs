//! Canary probe messages
//!
//! This module contains the `CanaryMessage` payload sent to every partition and
//! the `MessageFactory` that stamps each message with a sequence number and a
//! creation time. The JSON form of `CanaryMessage` is read back by the canary
//! consumer, so its field names and types must not change.

use crate::clock::Clock;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Probe message carried as the record value
///
/// Serializes to `{"producerId":"...","messageId":N,"timestamp":MS}`. Unknown
/// fields are ignored when reading so newer producers stay compatible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanaryMessage {
    /// Client identity of the producing canary
    #[serde(rename = "producerId")]
    pub producer_id: String,
    /// Sequence number, unique and increasing per producer instance
    #[serde(rename = "messageId")]
    pub message_id: u64,
    /// Creation time in milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl CanaryMessage {
    /// Encodes the message into its wire payload
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to encode canary message")
    }

    /// Decodes a wire payload produced by `to_json`
    pub fn from_json(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).context("Failed to decode canary message")
    }
}

impl fmt::Display for CanaryMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ProducerID={}, MessageID={}, Timestamp={}}}",
            self.producer_id, self.message_id, self.timestamp
        )
    }
}

/// Builds canary messages with a monotonically increasing sequence number
///
/// The sequence is scoped to one factory, so separate producers never share
/// sequence space. `next_message` takes `&mut self`; callers that share a
/// factory must serialize access.
#[derive(Debug)]
pub struct MessageFactory {
    /// Identity written into every message
    producer_id: String,
    /// Sequence number of the last message built (0 before the first one)
    index: u64,
}

impl MessageFactory {
    pub fn new(producer_id: impl Into<String>) -> Self {
        Self {
            producer_id: producer_id.into(),
            index: 0,
        }
    }

    /// Builds the next message, stamped with the current time of `clock`
    ///
    /// The first call yields sequence number 1.
    pub fn next_message(&mut self, clock: &dyn Clock) -> CanaryMessage {
        self.index += 1;
        CanaryMessage {
            producer_id: self.producer_id.clone(),
            message_id: self.index,
            timestamp: clock.now_millis(),
        }
    }

    /// Sequence number of the last message built, 0 if none yet
    pub fn last_message_id(&self) -> u64 {
        self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_wire_format_is_exact() {
        let message = CanaryMessage {
            producer_id: "canary-client".to_string(),
            message_id: 42,
            timestamp: 1_700_000_000_123,
        };
        assert_eq!(
            message.to_json().unwrap(),
            r#"{"producerId":"canary-client","messageId":42,"timestamp":1700000000123}"#
        );
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let payload = br#"{"producerId":"p","messageId":7,"timestamp":99,"extra":"field"}"#;
        let message = CanaryMessage::from_json(payload).unwrap();
        assert_eq!(message.producer_id, "p");
        assert_eq!(message.message_id, 7);
        assert_eq!(message.timestamp, 99);
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        assert!(CanaryMessage::from_json(br#"{"producerId":"p"}"#).is_err());
    }

    #[test]
    fn test_display() {
        let message = CanaryMessage {
            producer_id: "p".to_string(),
            message_id: 3,
            timestamp: 5,
        };
        assert_eq!(
            message.to_string(),
            "{ProducerID=p, MessageID=3, Timestamp=5}"
        );
    }

    #[test]
    fn test_factory_sequence_starts_at_one_without_gaps() {
        let clock = ManualClock::new(0);
        let mut factory = MessageFactory::new("p");
        assert_eq!(factory.last_message_id(), 0);

        let ids: Vec<u64> = (0..5).map(|_| factory.next_message(&clock).message_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(factory.last_message_id(), 5);
    }

    #[test]
    fn test_factory_stamps_creation_time() {
        let clock = ManualClock::new(1_000);
        let mut factory = MessageFactory::new("p");
        let first = factory.next_message(&clock);
        clock.advance(25);
        let second = factory.next_message(&clock);
        assert_eq!(first.timestamp, 1_000);
        assert_eq!(second.timestamp, 1_025);
        assert_eq!(second.producer_id, "p");
    }

    #[test]
    fn test_factories_do_not_share_sequence() {
        let clock = ManualClock::new(0);
        let mut a = MessageFactory::new("a");
        let mut b = MessageFactory::new("b");
        a.next_message(&clock);
        a.next_message(&clock);
        assert_eq!(b.next_message(&clock).message_id, 1);
    }
}
