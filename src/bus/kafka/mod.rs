//! Kafka event log implementation.
//!
//! Inbound: a `StreamConsumer` in a consumer group with auto-commit disabled;
//! offsets are committed explicitly, one message at a time, after the
//! processor has settled the message's side effects.
//!
//! Outbound: an idempotent `FutureProducer` (`acks=all`). Message key is the
//! card id, which keeps every customer on one partition.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message as KafkaMessage;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::{debug, info};

use super::{Ack, BusError, EventPublisher, EventSource, InboundMessage, Result};
use crate::config::EventLogSettings;

/// How long a publish may wait in the producer queue before failing.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Client configuration derived from the validated event log settings.
///
/// Producers and consumers share the connection and security settings; only
/// the consumer side uses the group.
#[derive(Clone, Debug)]
pub struct KafkaBusConfig {
    settings: EventLogSettings,
}

impl KafkaBusConfig {
    pub fn from_settings(settings: &EventLogSettings) -> Self {
        Self {
            settings: settings.clone(),
        }
    }

    /// Idempotent producer waiting on every in-sync replica.
    fn build_producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.settings.bootstrap_servers);
        config.set("message.timeout.ms", PUBLISH_TIMEOUT.as_millis().to_string());
        config.set("acks", "all");
        config.set("enable.idempotence", "true");

        self.apply_security_config(&mut config);
        config
    }

    /// Group consumer with offsets committed by hand.
    fn build_consumer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.settings.bootstrap_servers);
        config.set("group.id", &self.settings.group_id);
        config.set("enable.auto.commit", "false");
        config.set("auto.offset.reset", "earliest");
        config.set("socket.keepalive.enable", "true");

        self.apply_security_config(&mut config);
        config
    }

    /// Credentials without an explicit protocol imply SASL over TLS.
    fn security_protocol(&self) -> Option<&str> {
        self.settings
            .security_protocol
            .as_deref()
            .or_else(|| self.settings.sasl_username.as_ref().map(|_| "SASL_SSL"))
    }

    fn apply_security_config(&self, config: &mut ClientConfig) {
        if let Some(protocol) = self.security_protocol() {
            config.set("security.protocol", protocol);
        }

        let optional = [
            ("sasl.mechanism", &self.settings.sasl_mechanism),
            ("sasl.username", &self.settings.sasl_username),
            ("sasl.password", &self.settings.sasl_password),
            ("ssl.ca.location", &self.settings.ssl_ca_location),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                config.set(name, value);
            }
        }
    }
}

/// Consumer-group reader over one inbound topic.
pub struct KafkaEventSource {
    consumer: Arc<StreamConsumer>,
    topic: String,
}

impl KafkaEventSource {
    /// Create a consumer and subscribe it to `topic`.
    pub fn new(config: &KafkaBusConfig, topic: impl Into<String>) -> Result<Self> {
        let topic = topic.into();
        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| BusError::Connection(format!("Failed to create Kafka consumer: {}", e)))?;

        consumer
            .subscribe(&[topic.as_str()])
            .map_err(|e| BusError::Connection(format!("Failed to subscribe to {}: {}", topic, e)))?;

        info!(
            bootstrap_servers = %config.settings.bootstrap_servers,
            group_id = %config.settings.group_id,
            topic = %topic,
            "Subscribed to Kafka topic"
        );

        Ok(Self {
            consumer: Arc::new(consumer),
            topic,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl EventSource for KafkaEventSource {
    async fn next(&self) -> Result<InboundMessage> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| BusError::Consume(e.to_string()))?;

        debug!(
            topic = %message.topic(),
            partition = message.partition(),
            offset = message.offset(),
            "Received message"
        );

        Ok(InboundMessage {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message
                .key()
                .map(|k| String::from_utf8_lossy(k).into_owned()),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        })
    }

    async fn commit(&self, message: &InboundMessage) -> Result<()> {
        // The committed offset is the next one to read.
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &message.topic,
                message.partition,
                Offset::Offset(message.offset + 1),
            )
            .map_err(|e| BusError::Commit(e.to_string()))?;

        // A sync commit waits on the broker; keep it off the runtime workers.
        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || consumer.commit(&offsets, CommitMode::Sync))
            .await
            .map_err(|e| BusError::Commit(format!("Commit task failed: {}", e)))?
            .map_err(|e| BusError::Commit(format!("{} at {}", e, message.position())))?;

        debug!(position = %message.position(), "Committed offset");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.consumer.unsubscribe();
        info!(topic = %self.topic, "Unsubscribed from Kafka topic");
        Ok(())
    }
}

/// Keyed Kafka publisher.
#[derive(Clone)]
pub struct KafkaEventPublisher {
    producer: FutureProducer,
}

impl KafkaEventPublisher {
    pub fn new(config: &KafkaBusConfig) -> Result<Self> {
        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| BusError::Connection(format!("Failed to create Kafka producer: {}", e)))?;

        info!(bootstrap_servers = %config.bootstrap_servers, "Connected Kafka producer");

        Ok(Self { producer })
    }
}

#[async_trait]
impl EventPublisher for KafkaEventPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<Ack> {
        let record = FutureRecord::to(topic).key(key).payload(&payload);

        let (partition, offset) = self
            .producer
            .send(record, PUBLISH_TIMEOUT)
            .await
            .map_err(|(e, _)| BusError::Publish(format!("Failed to publish: {}", e)))?;

        debug!(topic = %topic, key = %key, partition, offset, "Published to Kafka");

        Ok(Ack {
            topic: topic.to_string(),
            partition,
            offset,
        })
    }

    async fn flush(&self, timeout: Duration) -> Result<()> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| BusError::Publish(format!("Flush task failed: {}", e)))?
            .map_err(|e| BusError::Publish(format!("Flush failed: {}", e)))
    }
}
