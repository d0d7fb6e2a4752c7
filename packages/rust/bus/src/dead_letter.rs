//! Dead-lettered messages and the sink they are reported through.

use chrono::{DateTime, Utc};
use ravedigest_shared::{MessageId, Payload};
use serde::Serialize;

/// A message that exceeded the delivery threshold of its group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub topic: String,
    pub group: String,
    pub id: MessageId,
    /// Consumer that held the message last.
    pub consumer: String,
    pub delivery_count: u32,
    pub payload: Payload,
    pub dead_at: DateTime<Utc>,
}

/// Receives every dead letter exactly once, after the bus has committed it.
pub trait DeadLetterSink: Send + Sync {
    fn report(&self, letter: &DeadLetter);
}

/// Default sink: a structured warning.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DeadLetterSink for TracingSink {
    fn report(&self, letter: &DeadLetter) {
        tracing::warn!(
            topic = %letter.topic,
            group = %letter.group,
            id = %letter.id,
            consumer = %letter.consumer,
            deliveries = letter.delivery_count,
            "message dead-lettered"
        );
    }
}
