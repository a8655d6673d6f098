//! In-memory event log.
//!
//! Topics are append-only vectors; consumer groups keep a committed offset per
//! topic. A source created for a group starts at that group's committed
//! offset, so dropping a source and creating a new one behaves like a process
//! restart: everything after the last commit is delivered again.
//!
//! Single partition per topic. Ideal for local runs and tests without a
//! broker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use super::{Ack, BusError, EventPublisher, EventSource, InboundMessage, Result};

/// The only partition an in-memory topic has.
const PARTITION: i32 = 0;

/// A record stored in an in-memory topic.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

/// Shared in-memory log of topics and committed offsets.
#[derive(Default)]
pub struct ChannelBus {
    topics: Mutex<HashMap<String, Vec<StoredRecord>>>,
    committed: Mutex<HashMap<(String, String), i64>>,
    appended: Notify,
    fail_on_publish: AtomicBool,
}

impl ChannelBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append a raw record, returning its offset.
    pub fn append(&self, topic: &str, key: Option<&str>, payload: impl Into<Vec<u8>>) -> i64 {
        let offset = {
            let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
            let log = topics.entry(topic.to_string()).or_default();
            log.push(StoredRecord {
                key: key.map(str::to_string),
                payload: payload.into(),
            });
            (log.len() - 1) as i64
        };
        self.appended.notify_waiters();
        offset
    }

    /// Snapshot of every record in a topic.
    pub fn records(&self, topic: &str) -> Vec<StoredRecord> {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics.get(topic).cloned().unwrap_or_default()
    }

    /// Next offset the group will read after a restart, if it ever committed.
    pub fn committed_offset(&self, group: &str, topic: &str) -> Option<i64> {
        let committed = self.committed.lock().unwrap_or_else(|e| e.into_inner());
        committed
            .get(&(group.to_string(), topic.to_string()))
            .copied()
    }

    /// Make every publish fail until cleared.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.fail_on_publish.store(fail, Ordering::SeqCst);
    }

    /// Subscribe a consumer group to a topic.
    pub fn source(self: &Arc<Self>, group: &str, topic: &str) -> ChannelSource {
        let start = self.committed_offset(group, topic).unwrap_or(0);
        ChannelSource {
            bus: Arc::clone(self),
            group: group.to_string(),
            topic: topic.to_string(),
            position: AtomicI64::new(start),
            closed: AtomicBool::new(false),
        }
    }

    /// Publisher writing into this log.
    pub fn publisher(self: &Arc<Self>) -> ChannelPublisher {
        ChannelPublisher {
            bus: Arc::clone(self),
        }
    }

    fn record_at(&self, topic: &str, offset: i64) -> Option<StoredRecord> {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .get(topic)
            .and_then(|log| log.get(usize::try_from(offset).ok()?))
            .cloned()
    }

    fn commit(&self, group: &str, topic: &str, next_offset: i64) {
        let mut committed = self.committed.lock().unwrap_or_else(|e| e.into_inner());
        committed.insert((group.to_string(), topic.to_string()), next_offset);
    }
}

/// Consumer-group reader over one in-memory topic.
pub struct ChannelSource {
    bus: Arc<ChannelBus>,
    group: String,
    topic: String,
    position: AtomicI64,
    closed: AtomicBool,
}

#[async_trait]
impl EventSource for ChannelSource {
    async fn next(&self) -> Result<InboundMessage> {
        loop {
            // Register interest before checking, so an append between the
            // check and the await is not missed.
            let appended = self.bus.appended.notified();

            if self.closed.load(Ordering::SeqCst) {
                return Err(BusError::Closed);
            }

            let offset = self.position.load(Ordering::SeqCst);
            if let Some(record) = self.bus.record_at(&self.topic, offset) {
                self.position.store(offset + 1, Ordering::SeqCst);
                return Ok(InboundMessage {
                    topic: self.topic.clone(),
                    partition: PARTITION,
                    offset,
                    key: record.key,
                    payload: record.payload,
                });
            }

            appended.await;
        }
    }

    async fn commit(&self, message: &InboundMessage) -> Result<()> {
        self.bus.commit(&self.group, &message.topic, message.offset + 1);
        debug!(
            group = %self.group,
            position = %message.position(),
            "Committed offset"
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.bus.appended.notify_waiters();
        Ok(())
    }
}

/// Publisher appending to an in-memory topic.
pub struct ChannelPublisher {
    bus: Arc<ChannelBus>,
}

#[async_trait]
impl EventPublisher for ChannelPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<Ack> {
        if self.bus.fail_on_publish.load(Ordering::SeqCst) {
            return Err(BusError::Publish("channel publish failure".to_string()));
        }

        let offset = self.bus.append(topic, Some(key), payload);
        debug!(topic = %topic, key = %key, offset, "Published to channel");

        Ok(Ack {
            topic: topic.to_string(),
            partition: PARTITION,
            offset,
        })
    }

    async fn flush(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}
