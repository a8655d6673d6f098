//! Redis StateStore implementation.
//!
//! Counters map to `INCR`/`GET` with `EXPIRE`; ordered sets map to sorted-set
//! commands (`ZADD`, `ZREMRANGEBYSCORE`, `ZRANGE ... WITHSCORES`, `ZREM`).
//! Each call is one round-trip on a shared `ConnectionManager`. Windowed
//! counters use `EXPIRE ... NX` and therefore need Redis 7.0 or newer.

use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use tracing::{debug, info};

use super::{Result, ScoredMember, StateStore};

/// Redis-backed state store.
///
/// Key format: `{key_prefix}:{key}` when a prefix is configured, otherwise the
/// key is used verbatim (`customer_spend:{card}`, `fraud_check:{card}`).
pub struct RedisStateStore {
    conn: ConnectionManager,
    key_prefix: Option<String>,
}

impl RedisStateStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., redis://localhost:6379)
    /// * `key_prefix` - Optional namespace prepended to every key
    pub async fn new(url: &str, key_prefix: Option<&str>) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        info!(url = %url, key_prefix = ?key_prefix, "Connected to Redis state store");

        Ok(Self {
            conn,
            key_prefix: key_prefix.filter(|p| !p.is_empty()).map(str::to_string),
        })
    }

    fn key(&self, key: &str) -> String {
        qualify(self.key_prefix.as_deref(), key)
    }
}

/// Prepend the namespace, if any.
fn qualify(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}:{}", prefix, key),
        None => key.to_string(),
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn increment(&self, key: &str) -> Result<i64> {
        let key = self.key(key);
        let mut conn = self.conn.clone();

        let value: i64 = conn.incr(&key, 1i64).await?;

        debug!(key = %key, value, "Incremented counter in Redis");
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>> {
        let key = self.key(key);
        let mut conn = self.conn.clone();

        let value: Option<i64> = conn.get(&key).await?;
        Ok(value)
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<bool> {
        let key = self.key(key);
        let mut conn = self.conn.clone();

        // EXPIRE has whole-second resolution; never round a live TTL down to 0.
        let seconds = ttl.as_secs().max(1) as i64;
        let applied: bool = conn.expire(&key, seconds).await?;

        debug!(key = %key, seconds, applied, "Set expiry in Redis");
        Ok(applied)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let key = self.key(key);
        let mut conn = self.conn.clone();

        let removed: i64 = conn.del(&key).await?;

        debug!(key = %key, removed, "Deleted key from Redis");
        Ok(removed > 0)
    }

    async fn add_scored(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let key = self.key(key);
        let mut conn = self.conn.clone();

        let _: i64 = conn.zadd(&key, member, score).await?;
        Ok(())
    }

    async fn purge_below(&self, key: &str, ceiling: f64) -> Result<u64> {
        let key = self.key(key);
        let mut conn = self.conn.clone();

        // "(" makes the upper bound exclusive.
        let removed: u64 = conn
            .zrembyscore(&key, "-inf", format!("({}", ceiling))
            .await?;

        if removed > 0 {
            debug!(key = %key, removed, ceiling, "Purged expired members from Redis");
        }
        Ok(removed)
    }

    async fn range_all(&self, key: &str) -> Result<Vec<ScoredMember>> {
        let key = self.key(key);
        let mut conn = self.conn.clone();

        let members: Vec<(String, f64)> = conn.zrange_withscores(&key, 0, -1).await?;

        Ok(members
            .into_iter()
            .map(|(member, score)| ScoredMember { member, score })
            .collect())
    }

    async fn remove(&self, key: &str, members: &[String]) -> Result<u64> {
        if members.is_empty() {
            return Ok(0);
        }

        let key = self.key(key);
        let mut conn = self.conn.clone();

        let removed: u64 = conn.zrem(&key, members).await?;
        Ok(removed)
    }

    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64> {
        let key = self.key(key);
        let mut conn = self.conn.clone();

        // MULTI/EXEC so a lost reply can never leave a counter behind without
        // its TTL. EXPIRE ... NX (Redis 7.0+) only applies when none is set.
        let seconds = ttl.as_secs().max(1) as i64;
        let (value,): (i64,) = redis::pipe()
            .atomic()
            .incr(&key, 1i64)
            .cmd("EXPIRE")
            .arg(&key)
            .arg(seconds)
            .arg("NX")
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!(key = %key, value, seconds, "Incremented windowed counter in Redis");
        Ok(value)
    }
}
