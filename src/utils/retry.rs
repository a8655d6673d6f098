//! Retry utilities: backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter. Provides the backoff
//! for transient message-processing failures and for connection retries at
//! startup.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff between attempts at the same inbound message.
///
/// Never gives up: a message is either settled or the worker is stopped.
/// - Min delay: `min`
/// - Max delay: `max`
/// - Jitter enabled
pub fn processing_backoff(min: Duration, max: Duration) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(min)
        .with_max_delay(max)
        .without_max_times()
        .with_jitter()
}

/// Backoff for state store and broker connection retries at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}
