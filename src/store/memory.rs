//! In-process state store.
//!
//! Each key lives in its own slot guarded by an async mutex, so operations on
//! one key are atomic with respect to each other inside this process. Expiry is
//! evaluated lazily against the injected clock on every access.
//!
//! Only valid for single-instance deployments: the mutex does nothing for
//! processors running in other processes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use super::{Result, ScoredMember, StateStore, StoreError};
use crate::clock::{Clock, SystemClock};

#[derive(Debug)]
enum Data {
    Counter(i64),
    Set(HashMap<String, f64>),
}

#[derive(Debug, Default)]
struct Slot {
    data: Option<Data>,
    expires_at: Option<DateTime<Utc>>,
}

impl Slot {
    /// Drop the value if its TTL has elapsed.
    fn evict_if_expired(&mut self, now: DateTime<Utc>) {
        if matches!(self.expires_at, Some(at) if at <= now) {
            self.data = None;
            self.expires_at = None;
        }
    }

    fn clear(&mut self) {
        self.data = None;
        self.expires_at = None;
    }
}

/// In-memory `StateStore` with per-key locking and clock-driven TTLs.
pub struct InMemoryStateStore {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<Slot>>>>,
    clock: Arc<dyn Clock>,
    writes: AtomicU64,
    unavailable: AtomicBool,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store whose TTLs follow the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            clock,
            writes: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate a connectivity outage: every operation fails while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of mutating operations performed so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Remaining time-to-live of a key, if it has one.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let slot = self.slot(key);
        let mut slot = slot.lock().await;
        let now = self.clock.now();
        slot.evict_if_expired(now);
        slot.data.as_ref()?;
        slot.expires_at
            .and_then(|at| (at - now).to_std().ok())
    }

    fn slot(&self, key: &str) -> Arc<AsyncMutex<Slot>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(key.to_string()).or_default().clone()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn increment(&self, key: &str) -> Result<i64> {
        self.check_available()?;
        let slot = self.slot(key);
        let mut slot = slot.lock().await;
        slot.evict_if_expired(self.clock.now());
        self.record_write();

        let value = match slot.data.get_or_insert(Data::Counter(0)) {
            Data::Counter(n) => {
                *n += 1;
                *n
            }
            Data::Set(_) => return Err(StoreError::WrongType(key.to_string())),
        };

        debug!(key = %key, value, "Incremented counter");
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>> {
        self.check_available()?;
        let slot = self.slot(key);
        let mut slot = slot.lock().await;
        slot.evict_if_expired(self.clock.now());

        match &slot.data {
            None => Ok(None),
            Some(Data::Counter(n)) => Ok(Some(*n)),
            Some(Data::Set(_)) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.check_available()?;
        let slot = self.slot(key);
        let mut slot = slot.lock().await;
        let now = self.clock.now();
        slot.evict_if_expired(now);
        self.record_write();

        if slot.data.is_none() {
            return Ok(false);
        }

        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::Unavailable(format!("invalid ttl: {}", e)))?;
        slot.expires_at = Some(now + ttl);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        let slot = self.slot(key);
        let mut slot = slot.lock().await;
        slot.evict_if_expired(self.clock.now());
        self.record_write();

        let existed = slot.data.is_some();
        slot.clear();
        Ok(existed)
    }

    async fn add_scored(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.check_available()?;
        let slot = self.slot(key);
        let mut slot = slot.lock().await;
        slot.evict_if_expired(self.clock.now());
        self.record_write();

        match slot.data.get_or_insert_with(|| Data::Set(HashMap::new())) {
            Data::Set(members) => {
                members.insert(member.to_string(), score);
                Ok(())
            }
            Data::Counter(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn purge_below(&self, key: &str, ceiling: f64) -> Result<u64> {
        self.check_available()?;
        let slot = self.slot(key);
        let mut slot = slot.lock().await;
        slot.evict_if_expired(self.clock.now());
        self.record_write();

        let removed = match &mut slot.data {
            None => 0,
            Some(Data::Set(members)) => {
                let before = members.len();
                members.retain(|_, score| *score >= ceiling);
                (before - members.len()) as u64
            }
            Some(Data::Counter(_)) => return Err(StoreError::WrongType(key.to_string())),
        };

        if matches!(&slot.data, Some(Data::Set(m)) if m.is_empty()) {
            slot.clear();
        }
        Ok(removed)
    }

    async fn range_all(&self, key: &str) -> Result<Vec<ScoredMember>> {
        self.check_available()?;
        let slot = self.slot(key);
        let mut slot = slot.lock().await;
        slot.evict_if_expired(self.clock.now());

        match &slot.data {
            None => Ok(Vec::new()),
            Some(Data::Set(members)) => {
                let mut out: Vec<ScoredMember> = members
                    .iter()
                    .map(|(member, score)| ScoredMember {
                        member: member.clone(),
                        score: *score,
                    })
                    .collect();
                // Same ordering as a Redis sorted set: score, then member bytes.
                out.sort_by(|a, b| {
                    a.score
                        .total_cmp(&b.score)
                        .then_with(|| a.member.cmp(&b.member))
                });
                Ok(out)
            }
            Some(Data::Counter(_)) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn remove(&self, key: &str, members: &[String]) -> Result<u64> {
        self.check_available()?;
        let slot = self.slot(key);
        let mut slot = slot.lock().await;
        slot.evict_if_expired(self.clock.now());
        self.record_write();

        let removed = match &mut slot.data {
            None => 0,
            Some(Data::Set(set)) => members.iter().filter(|m| set.remove(*m).is_some()).count(),
            Some(Data::Counter(_)) => return Err(StoreError::WrongType(key.to_string())),
        };

        if matches!(&slot.data, Some(Data::Set(m)) if m.is_empty()) {
            slot.clear();
        }
        Ok(removed as u64)
    }

    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64> {
        self.check_available()?;
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::Unavailable(format!("invalid ttl: {}", e)))?;
        let slot = self.slot(key);
        let mut slot = slot.lock().await;
        let now = self.clock.now();
        slot.evict_if_expired(now);
        self.record_write();

        let value = match slot.data.get_or_insert(Data::Counter(0)) {
            Data::Counter(n) => {
                *n += 1;
                *n
            }
            Data::Set(_) => return Err(StoreError::WrongType(key.to_string())),
        };
        let expires_at = *slot.expires_at.get_or_insert(now + ttl);

        debug!(key = %key, value, expires_at = %expires_at, "Incremented windowed counter");
        Ok(value)
    }
}
