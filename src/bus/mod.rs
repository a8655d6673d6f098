//! Event log access.
//!
//! This module contains:
//! - `EventSource` trait: ordered pull of inbound messages with manual commit
//! - `EventPublisher` trait: keyed publish of derived events
//! - Implementations: Kafka (feature `kafka`), in-memory channel log

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

pub mod channel;
#[cfg(feature = "kafka")]
pub mod kafka;

pub use channel::{ChannelBus, ChannelPublisher, ChannelSource};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaBusConfig, KafkaEventPublisher, KafkaEventSource};

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
///
/// All of these are transient from the processor's point of view: the
/// message being handled is retried, never committed.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Commit failed: {0}")]
    Commit(String),

    #[error("Channel closed")]
    Closed,
}

/// A message pulled from the inbound channel.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Partition key (the card id for well-formed producers).
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    /// `topic/partition/offset`, for logs.
    pub fn position(&self) -> String {
        format!("{}/{}/{}", self.topic, self.partition, self.offset)
    }
}

/// Acknowledgement of a durable publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl fmt::Display for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.topic, self.partition, self.offset)
    }
}

/// Ordered source of inbound messages with explicit progress commits.
///
/// Messages of one key always arrive on the same partition and in order, as
/// long as producers key by card id.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Wait for the next message.
    async fn next(&self) -> Result<InboundMessage>;

    /// Mark this message (and everything before it on its partition) as done.
    async fn commit(&self, message: &InboundMessage) -> Result<()>;

    /// Stop consuming and release the subscription.
    async fn close(&self) -> Result<()>;
}

/// Keyed publisher for derived events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish and wait for the broker acknowledgement.
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<Ack>;

    /// Wait, up to `timeout`, for any queued publishes to be delivered.
    async fn flush(&self, timeout: Duration) -> Result<()>;
}
