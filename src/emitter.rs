//! Downstream emitter.
//!
//! Publishes derived events to the outbound topic keyed by card id. A publish
//! error is returned untouched: the caller must treat it as transient and
//! neither commit nor reset anything.

use std::sync::Arc;

use tracing::info;

use crate::bus::{Ack, BusError, EventPublisher};
use crate::model::DerivedEvent;

/// Keyed JSON publisher for one outbound topic.
pub struct DownstreamEmitter {
    publisher: Arc<dyn EventPublisher>,
    topic: String,
}

impl DownstreamEmitter {
    pub fn new(publisher: Arc<dyn EventPublisher>, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Serialize and publish, returning once the broker acknowledged.
    pub async fn emit(&self, event: &DerivedEvent) -> Result<Ack, BusError> {
        let payload = event
            .to_json()
            .map_err(|e| BusError::Publish(format!("Failed to serialize {}: {}", event, e)))?;

        let ack = self
            .publisher
            .publish(&self.topic, event.card_id(), payload)
            .await?;

        info!(event = %event, ack = %ack, "Emitted derived event");
        Ok(ack)
    }

    /// Publisher behind this emitter, for draining on shutdown.
    pub fn publisher(&self) -> &Arc<dyn EventPublisher> {
        &self.publisher
    }
}
