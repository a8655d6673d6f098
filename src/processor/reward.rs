//! Spend reward rule: issue a coupon when a card's rolling spend crosses the
//! threshold, then restart its accumulation.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use super::SignalRule;
use crate::clock::{Clock, SystemClock};
use crate::config::{CouponSettings, RewardSettings};
use crate::model::{DerivedEvent, LoyaltyEvent, RewardEvent};
use crate::spend::SpendWindowAggregator;
use crate::store::{StateStore, StoreError};

/// Random characters appended to the coupon prefix.
const COUPON_SUFFIX_LEN: usize = 5;

/// `{prefix}-XXXXX` with an upper-case random suffix.
pub fn coupon_code(prefix: &str) -> String {
    let suffix: String = Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(COUPON_SUFFIX_LEN)
        .collect::<String>()
        .to_uppercase();
    format!("{}-{}", prefix, suffix)
}

pub struct RewardRule {
    aggregator: SpendWindowAggregator,
    threshold: Decimal,
    window: chrono::Duration,
    coupon: CouponSettings,
    clock: Arc<dyn Clock>,
}

impl RewardRule {
    pub fn new(
        store: Arc<dyn StateStore>,
        threshold: Decimal,
        window: chrono::Duration,
        coupon: CouponSettings,
    ) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), threshold, window, coupon)
    }

    pub fn with_clock(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        threshold: Decimal,
        window: chrono::Duration,
        coupon: CouponSettings,
    ) -> Self {
        Self {
            aggregator: SpendWindowAggregator::with_clock(store, Arc::clone(&clock)),
            threshold,
            window,
            coupon,
            clock,
        }
    }

    pub fn from_settings(store: Arc<dyn StateStore>, settings: &RewardSettings) -> Self {
        Self::new(
            store,
            settings.spend_threshold,
            settings.window,
            settings.coupon.clone(),
        )
    }

    fn issue(&self, card_id: &str) -> RewardEvent {
        let now = self.clock.now();
        RewardEvent {
            card_id: card_id.to_string(),
            coupon_code: coupon_code(&self.coupon.prefix),
            description: self.coupon.description.clone(),
            expires_at: now + self.coupon.validity,
            emitted_at: now,
        }
    }
}

#[async_trait]
impl SignalRule for RewardRule {
    fn name(&self) -> &'static str {
        "reward"
    }

    async fn evaluate(&self, event: &LoyaltyEvent) -> Result<Option<DerivedEvent>, StoreError> {
        let evaluation = self
            .aggregator
            .record_and_evaluate(event, self.window, self.threshold)
            .await?;

        if !evaluation.crossed {
            return Ok(None);
        }

        let reward = self.issue(&event.card_id);
        info!(
            card_id = %event.card_id,
            total = %evaluation.new_total,
            threshold = %self.threshold,
            coupon = %reward.coupon_code,
            "Spend threshold crossed, issuing reward"
        );
        Ok(Some(DerivedEvent::Reward(reward)))
    }

    async fn on_emitted(&self, event: &LoyaltyEvent) -> Result<(), StoreError> {
        self.aggregator.reset(&event.card_id).await?;
        Ok(())
    }
}
