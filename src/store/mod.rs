//! State store client.
//!
//! Typed access to an external key-value store offering two capability groups:
//!
//! - atomic counters with expiry (`increment`, `increment_with_expiry`, `get`,
//!   `set_expiry`, `delete`)
//! - ordered sets scored by unix seconds (`add_scored`, `purge_below`,
//!   `range_all`, `remove`)
//!
//! Every operation is a single round-trip. Atomicity comes from the backing
//! store's primitives; this layer adds no locking of its own. Multi-step
//! sequences built on top (see `spend`) are only safe when a single processor
//! owns each customer key, which the event log's key partitioning provides.
//!
//! Implementations:
//! - `RedisStateStore`: Redis (feature `redis`)
//! - `InMemoryStateStore`: single-process deployments and tests

use std::time::Duration;

use async_trait::async_trait;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::InMemoryStateStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStateStore;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during store operations.
///
/// All variants are treated as transient infrastructure failures by the
/// stream processor.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("State store unavailable: {0}")]
    Unavailable(String),

    #[error("Operation against a key holding the wrong kind of value: {0}")]
    WrongType(String),
}

/// A member of an ordered set with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: String,
    pub score: f64,
}

/// Atomic key-value operations backing the aggregators.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Atomically increment an integer counter, creating it at 0 first.
    ///
    /// Returns the post-increment value.
    async fn increment(&self, key: &str) -> Result<i64>;

    /// Read a counter. `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<i64>>;

    /// Set (or replace) the time-to-live of any key.
    ///
    /// Returns false if the key does not exist.
    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Delete any key. Returns true if something was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Add or overwrite a member of an ordered set.
    async fn add_scored(&self, key: &str, member: &str, score: f64) -> Result<()>;

    /// Remove every member with a score strictly below `ceiling`.
    ///
    /// Returns the number of members removed.
    async fn purge_below(&self, key: &str, ceiling: f64) -> Result<u64>;

    /// All members in ascending score order.
    async fn range_all(&self, key: &str) -> Result<Vec<ScoredMember>>;

    /// Remove specific members from an ordered set.
    async fn remove(&self, key: &str, members: &[String]) -> Result<u64>;

    /// Increment a counter and, in the same atomic step, give it `ttl` when it
    /// has no expiry yet.
    ///
    /// An existing expiry is never extended, so repeated calls within one
    /// window keep the window anchored to its first increment. A counter
    /// left without an expiry gets one on its next increment.
    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64>;
}
