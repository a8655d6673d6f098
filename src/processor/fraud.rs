//! Fraud frequency rule: alert when a card transacts more often than allowed
//! within a fixed window.

use std::sync::Arc;

use async_trait::async_trait;

use super::SignalRule;
use crate::clock::{Clock, SystemClock};
use crate::config::FraudSettings;
use crate::model::{AlertSeverity, DerivedEvent, FraudAlertEvent, LoyaltyEvent};
use crate::rate::RateWindowDetector;
use crate::store::{StateStore, StoreError};

/// `tipoAllarme` of a frequency alert.
pub const ALARM_KIND_HIGH_FREQUENCY: &str = "HighFrequencyTransaction";

/// Reported when the offending event carries no transaction id.
pub const UNKNOWN_TRANSACTION: &str = "N/D";

pub struct FraudRule {
    detector: RateWindowDetector,
    max_transactions: u32,
    window_seconds: u64,
    clock: Arc<dyn Clock>,
}

impl FraudRule {
    pub fn new(store: Arc<dyn StateStore>, max_transactions: u32, window_seconds: u64) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), max_transactions, window_seconds)
    }

    pub fn with_clock(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        max_transactions: u32,
        window_seconds: u64,
    ) -> Self {
        Self {
            detector: RateWindowDetector::new(store),
            max_transactions,
            window_seconds,
            clock,
        }
    }

    pub fn from_settings(store: Arc<dyn StateStore>, settings: &FraudSettings) -> Self {
        Self::new(store, settings.max_transactions, settings.window_seconds)
    }

    fn alert(&self, event: &LoyaltyEvent, count: i64) -> FraudAlertEvent {
        let transaction_id = if event.transaction_id.trim().is_empty() {
            UNKNOWN_TRANSACTION.to_string()
        } else {
            event.transaction_id.clone()
        };

        FraudAlertEvent {
            card_id: event.card_id.clone(),
            suspicious_transaction_id: transaction_id,
            alarm_kind: ALARM_KIND_HIGH_FREQUENCY.to_string(),
            message: format!(
                "Rilevate {} transazioni in {} secondi.",
                count, self.window_seconds
            ),
            severity: AlertSeverity::Critical,
            emitted_at: self.clock.now(),
        }
    }
}

#[async_trait]
impl SignalRule for FraudRule {
    fn name(&self) -> &'static str {
        "fraud"
    }

    async fn evaluate(&self, event: &LoyaltyEvent) -> Result<Option<DerivedEvent>, StoreError> {
        let check = self
            .detector
            .register_and_check(&event.card_id, self.max_transactions, self.window_seconds)
            .await?;

        Ok(check
            .suspicious
            .then(|| DerivedEvent::FraudAlert(self.alert(event, check.count))))
    }
}
