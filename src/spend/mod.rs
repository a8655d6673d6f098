//! Spend window aggregator.
//!
//! Keeps, per customer, the purchases of the last N days as an ordered set
//! (`customer_spend:{card}`) scored by arrival time in unix seconds. Members
//! are encoded `"{transaction_id}:{amount}"`. The running total is never
//! cached: it is recomputed from the live members after purging the expired
//! ones.
//!
//! Threshold detection is edge-triggered: a crossing is reported only on the
//! event that takes the total from below the threshold to at-or-above it.
//!
//! The purge / sum / add sequence spans several round-trips and is not atomic.
//! It relies on a single processor owning each customer key at a time.

use std::sync::Arc;

use chrono::Duration;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::model::LoyaltyEvent;
use crate::store::{Result, StateStore};

/// Key prefix for customer spend sets.
pub const SPEND_KEY_PREFIX: &str = "customer_spend";

/// Extra lifetime given to a spend set beyond the window itself.
pub const EXPIRY_MARGIN_DAYS: i64 = 1;

/// Build the ordered-set key for a card.
pub fn spend_key(card_id: &str) -> String {
    format!("{}:{}", SPEND_KEY_PREFIX, card_id)
}

/// Encode a spend entry as a set member.
pub fn encode_member(transaction_id: &str, amount: Decimal) -> String {
    format!("{}:{}", transaction_id, amount)
}

/// Decode a set member into `(transaction_id, amount)`.
///
/// The amount follows the last `:`; members without one, or with an
/// unparseable amount, decode to `None`.
pub fn decode_member(member: &str) -> Option<(&str, Decimal)> {
    let (transaction_id, amount) = member.rsplit_once(':')?;
    let amount = amount.parse::<Decimal>().ok()?;
    Some((transaction_id, amount))
}

/// Amount carried by a member; malformed members count as zero.
fn member_amount(member: &str) -> Decimal {
    decode_member(member).map(|(_, amount)| amount).unwrap_or_default()
}

/// Outcome of recording one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpendEvaluation {
    /// True only on the event that moves the total across the threshold.
    pub crossed: bool,
    /// Live total before this event, excluding any earlier copy of it.
    pub previous_total: Decimal,
    /// Live total including this event.
    pub new_total: Decimal,
}

/// Rolling-window spend aggregator over a `StateStore`.
pub struct SpendWindowAggregator {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl SpendWindowAggregator {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Record a purchase and report whether it crossed the threshold.
    ///
    /// Events that are not purchases, carry no details, or have an empty card
    /// id return `(false, 0)` without touching the store.
    ///
    /// Re-recording the same transaction id replaces its earlier entry instead
    /// of adding to it, so redelivery never inflates the total.
    pub async fn record_and_evaluate(
        &self,
        event: &LoyaltyEvent,
        window: Duration,
        threshold: Decimal,
    ) -> Result<SpendEvaluation> {
        if !event.is_spend() {
            debug!(
                card_id = %event.card_id,
                kind = ?event.kind,
                "Event does not contribute to spend"
            );
            return Ok(SpendEvaluation::default());
        }

        let key = spend_key(&event.card_id);
        let amount = event.amount();
        let member = encode_member(&event.transaction_id, amount);
        let now = self.clock.now();
        let cutoff = now - window;

        let purged = self
            .store
            .purge_below(&key, cutoff.timestamp() as f64)
            .await?;
        if purged > 0 {
            debug!(card_id = %event.card_id, purged, "Purged spend outside window");
        }

        let entries = self.store.range_all(&key).await?;

        let is_same_transaction = |candidate: &str| {
            if event.transaction_id.is_empty() {
                candidate == member
            } else {
                decode_member(candidate).map(|(id, _)| id) == Some(event.transaction_id.as_str())
            }
        };

        let previous_total: Decimal = entries
            .iter()
            .filter(|e| !is_same_transaction(&e.member))
            .map(|e| member_amount(&e.member))
            .sum();

        let superseded: Vec<String> = entries
            .iter()
            .filter(|e| e.member != member && is_same_transaction(&e.member))
            .map(|e| e.member.clone())
            .collect();
        if !superseded.is_empty() {
            warn!(
                card_id = %event.card_id,
                transaction_id = %event.transaction_id,
                replaced = ?superseded,
                "Transaction re-recorded with a different amount, replacing earlier entry"
            );
            self.store.remove(&key, &superseded).await?;
        }

        self.store
            .add_scored(&key, &member, now.timestamp() as f64)
            .await?;

        let ttl = (window + Duration::days(EXPIRY_MARGIN_DAYS))
            .to_std()
            .unwrap_or_default();
        self.store.set_expiry(&key, ttl).await?;

        let new_total = previous_total + amount;
        let crossed = new_total >= threshold && previous_total < threshold;

        debug!(
            card_id = %event.card_id,
            previous_total = %previous_total,
            new_total = %new_total,
            threshold = %threshold,
            crossed,
            "Evaluated spend window"
        );

        Ok(SpendEvaluation {
            crossed,
            previous_total,
            new_total,
        })
    }

    /// Delete a customer's spend set so accumulation restarts from zero.
    ///
    /// Must run only after the reward has been published.
    pub async fn reset(&self, card_id: &str) -> Result<bool> {
        if card_id.trim().is_empty() {
            warn!("Refusing to reset spend for an empty card id");
            return Ok(false);
        }

        let removed = self.store.delete(&spend_key(card_id)).await?;
        info!(card_id = %card_id, removed, "Reset spend window");
        Ok(removed)
    }

    /// Current live total for a card, without recording anything.
    pub async fn current_total(&self, card_id: &str, window: Duration) -> Result<Decimal> {
        let cutoff = (self.clock.now() - window).timestamp() as f64;
        let entries = self.store.range_all(&spend_key(card_id)).await?;
        Ok(entries
            .iter()
            .filter(|e| e.score >= cutoff)
            .map(|e| member_amount(&e.member))
            .sum())
    }
}
