//! Rate window detector.
//!
//! Counts transactions per card in a fixed window backed by an atomic counter
//! (`fraud_check:{card}`). Increment and TTL are one store operation: the TTL
//! is applied whenever the counter has none and never extended otherwise. The
//! window therefore starts at the first hit and resets only when the key
//! expires, even when a retried message re-runs the increment.
//!
//! Being a fixed window, a burst straddling a boundary can reach up to twice
//! the limit without either half being flagged.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::store::{Result, StateStore};

/// Key prefix for per-card transaction counters.
pub const RATE_KEY_PREFIX: &str = "fraud_check";

/// Build the counter key for a card.
pub fn rate_key(card_id: &str) -> String {
    format!("{}:{}", RATE_KEY_PREFIX, card_id)
}

/// Outcome of registering one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateCheck {
    /// Count in the current window, including this transaction.
    pub count: i64,
    /// True once the count exceeds the configured maximum.
    pub suspicious: bool,
}

/// Fixed-window transaction counter over a `StateStore`.
pub struct RateWindowDetector {
    store: Arc<dyn StateStore>,
}

impl RateWindowDetector {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Count a transaction and report whether the card is over the limit.
    ///
    /// An empty card id is never suspicious and touches nothing.
    pub async fn register_and_check(
        &self,
        card_id: &str,
        max_transactions: u32,
        window_seconds: u64,
    ) -> Result<RateCheck> {
        if card_id.trim().is_empty() {
            return Ok(RateCheck::default());
        }

        let key = rate_key(card_id);
        let count = self
            .store
            .increment_with_expiry(&key, Duration::from_secs(window_seconds))
            .await?;

        let suspicious = count > i64::from(max_transactions);
        if suspicious {
            warn!(
                card_id = %card_id,
                count,
                window_seconds,
                "Transaction frequency above limit"
            );
        } else {
            debug!(card_id = %card_id, count, "Registered transaction");
        }

        Ok(RateCheck { count, suspicious })
    }

    /// Transactions counted in the card's current window; 0 if none.
    pub async fn current_count(&self, card_id: &str) -> Result<i64> {
        Ok(self.store.get(&rate_key(card_id)).await?.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{InMemoryStateStore, ScoredMember, StoreError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Applies every write but reports the first expiry-bearing call as
    /// failed, like a reply lost after the server executed the command.
    struct LostReplyStore {
        inner: Arc<InMemoryStateStore>,
        lost: AtomicBool,
    }

    impl LostReplyStore {
        fn lose_once<T>(&self, result: Result<T>) -> Result<T> {
            let value = result?;
            if self.lost.swap(true, Ordering::SeqCst) {
                Ok(value)
            } else {
                Err(StoreError::Unavailable("connection reset".to_string()))
            }
        }
    }

    #[async_trait]
    impl StateStore for LostReplyStore {
        async fn increment(&self, key: &str) -> Result<i64> {
            self.inner.increment(key).await
        }

        async fn get(&self, key: &str) -> Result<Option<i64>> {
            self.inner.get(key).await
        }

        async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<bool> {
            let applied = self.inner.set_expiry(key, ttl).await;
            self.lose_once(applied)
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            self.inner.delete(key).await
        }

        async fn add_scored(&self, key: &str, member: &str, score: f64) -> Result<()> {
            self.inner.add_scored(key, member, score).await
        }

        async fn purge_below(&self, key: &str, ceiling: f64) -> Result<u64> {
            self.inner.purge_below(key, ceiling).await
        }

        async fn range_all(&self, key: &str) -> Result<Vec<ScoredMember>> {
            self.inner.range_all(key).await
        }

        async fn remove(&self, key: &str, members: &[String]) -> Result<u64> {
            self.inner.remove(key, members).await
        }

        async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64> {
            let value = self.inner.increment_with_expiry(key, ttl).await;
            self.lose_once(value)
        }
    }

    fn fixture() -> (Arc<InMemoryStateStore>, ManualClock, RateWindowDetector) {
        let clock = ManualClock::default();
        let store = Arc::new(InMemoryStateStore::with_clock(Arc::new(clock.clone())));
        let detector = RateWindowDetector::new(store.clone());
        (store, clock, detector)
    }

    #[tokio::test]
    async fn test_sixth_event_in_window_is_suspicious() {
        let (_store, clock, detector) = fixture();

        for i in 1..=6 {
            let check = detector.register_and_check("C1", 5, 60).await.unwrap();
            assert_eq!(check.count, i);
            assert_eq!(check.suspicious, i == 6, "event {}", i);
            clock.advance(chrono::Duration::seconds(2));
        }

        assert_eq!(detector.current_count("C1").await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_ttl_set_once_per_window() {
        let (store, clock, detector) = fixture();

        detector.register_and_check("C1", 5, 60).await.unwrap();
        clock.advance(chrono::Duration::seconds(45));
        detector.register_and_check("C1", 5, 60).await.unwrap();

        // Still counting down from the first hit.
        let ttl = store.ttl(&rate_key("C1")).await.unwrap();
        assert_eq!(ttl, Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_counter_resets_after_window_expires() {
        let (_store, clock, detector) = fixture();

        for _ in 0..5 {
            detector.register_and_check("C1", 5, 60).await.unwrap();
        }
        clock.advance(chrono::Duration::seconds(60));

        assert_eq!(detector.current_count("C1").await.unwrap(), 0);
        let check = detector.register_and_check("C1", 5, 60).await.unwrap();
        assert_eq!(check.count, 1);
        assert!(!check.suspicious);
    }

    #[tokio::test]
    async fn test_boundary_straddling_burst_is_not_flagged() {
        // Fixed window: 5 late in one window plus 5 early in the next stay
        // under the limit individually.
        let (_store, clock, detector) = fixture();

        detector.register_and_check("C1", 5, 60).await.unwrap();
        clock.advance(chrono::Duration::seconds(55));
        for _ in 0..4 {
            assert!(!detector.register_and_check("C1", 5, 60).await.unwrap().suspicious);
        }
        clock.advance(chrono::Duration::seconds(5));
        for _ in 0..5 {
            assert!(!detector.register_and_check("C1", 5, 60).await.unwrap().suspicious);
        }
    }

    #[tokio::test]
    async fn test_cards_are_independent() {
        let (_store, _clock, detector) = fixture();
        for _ in 0..6 {
            detector.register_and_check("C1", 5, 60).await.unwrap();
        }
        let other = detector.register_and_check("C2", 5, 60).await.unwrap();
        assert_eq!(other.count, 1);
        assert!(!other.suspicious);
    }

    #[tokio::test]
    async fn test_current_count_absent_is_zero() {
        let (_store, _clock, detector) = fixture();
        assert_eq!(detector.current_count("nobody").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_card_is_ignored() {
        let (store, _clock, detector) = fixture();
        let check = detector.register_and_check("", 0, 60).await.unwrap();
        assert!(!check.suspicious);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_window_survives_retry_after_lost_reply() {
        let clock = ManualClock::default();
        let inner = Arc::new(InMemoryStateStore::with_clock(Arc::new(clock.clone())));
        let detector = RateWindowDetector::new(Arc::new(LostReplyStore {
            inner: inner.clone(),
            lost: AtomicBool::new(false),
        }));

        // The first attempt fails after the write landed; the retry counts it
        // again and must still leave the counter with a deadline.
        assert!(detector.register_and_check("C1", 1, 60).await.is_err());
        let retried = detector.register_and_check("C1", 1, 60).await.unwrap();
        assert_eq!(retried.count, 2);
        assert!(inner.ttl(&rate_key("C1")).await.is_some());

        clock.advance(chrono::Duration::seconds(60));
        let next = detector.register_and_check("C1", 1, 60).await.unwrap();
        assert_eq!(next.count, 1);
        assert!(!next.suspicious);
    }

    #[tokio::test]
    async fn test_counter_without_ttl_gets_one() {
        let (store, clock, detector) = fixture();
        for _ in 0..3 {
            store.increment(&rate_key("C1")).await.unwrap();
        }

        let check = detector.register_and_check("C1", 5, 60).await.unwrap();
        assert_eq!(check.count, 4);
        assert_eq!(
            store.ttl(&rate_key("C1")).await,
            Some(Duration::from_secs(60))
        );

        clock.advance(chrono::Duration::seconds(60));
        assert_eq!(detector.current_count("C1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let (store, _clock, detector) = fixture();
        store.set_unavailable(true);
        assert!(detector.register_and_check("C1", 5, 60).await.is_err());
    }
}
