//! Stream processor.
//!
//! One sequential consume → evaluate → publish → commit loop per rule. A
//! message is only committed once its side effects are settled: the derived
//! event (if any) is acknowledged by the broker and the rule's post-emit
//! bookkeeping has run. Transient failures retry the same message with
//! backoff and never commit, which gives at-least-once delivery and keeps
//! per-card ordering.
//!
//! Lifecycle: `Running` → (stop requested) `Draining` → `Stopped`.

mod fraud;
mod reward;

pub use fraud::{FraudRule, ALARM_KIND_HIGH_FREQUENCY, UNKNOWN_TRANSACTION};
pub use reward::{coupon_code, RewardRule};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::bus::{BusError, EventSource, InboundMessage};
use crate::config::ProcessorSettings;
use crate::emitter::DownstreamEmitter;
use crate::model::{DecodeError, DerivedEvent, LoyaltyEvent};
use crate::store::StoreError;
use crate::utils::retry::processing_backoff;

/// Payload bytes included in logs and dead letters for malformed messages.
pub const MAX_LOGGED_PAYLOAD: usize = 1024;

/// Errors raised while handling one inbound message.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] DecodeError),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    #[error("Event log error: {0}")]
    Bus(#[from] BusError),
}

impl ProcessError {
    /// Whether handling the same message again may succeed.
    ///
    /// Malformed input never will; everything else is infrastructure.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProcessError::Malformed(_))
    }
}

/// A business rule driven by the processor.
#[async_trait]
pub trait SignalRule: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Update the rule's state for `event` and return the derived event, if
    /// the event triggered one.
    async fn evaluate(&self, event: &LoyaltyEvent) -> Result<Option<DerivedEvent>, StoreError>;

    /// Runs after the derived event for `event` has been acknowledged, before
    /// the inbound message is committed.
    async fn on_emitted(&self, _event: &LoyaltyEvent) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Processor lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Running,
    Draining,
    Stopped,
}

/// Running counters, shared with the handle.
#[derive(Debug, Default)]
pub struct ProcessorStats {
    processed: AtomicU64,
    skipped: AtomicU64,
    emitted: AtomicU64,
    retries: AtomicU64,
}

/// Point-in-time copy of `ProcessorStats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Messages decoded, evaluated and committed.
    pub processed: u64,
    /// Malformed messages committed without evaluation.
    pub skipped: u64,
    /// Derived events published.
    pub emitted: u64,
    /// Failed attempts that were retried.
    pub retries: u64,
}

impl ProcessorStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

/// Record published to the dead-letter topic for an undecodable message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub reason: String,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: String,
}

/// How a message was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Processed,
    Emitted,
    Skipped,
}

/// Outcome of waiting for something while watching for a stop request.
enum Interrupted<T> {
    Done(T),
    Stopped,
}

/// Handle to a spawned processor.
pub struct ProcessorHandle {
    cancel: watch::Sender<bool>,
    state: watch::Receiver<ProcessorState>,
    stats: Arc<ProcessorStats>,
    task: JoinHandle<()>,
}

impl ProcessorHandle {
    /// Request a graceful stop. Returns immediately.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn state(&self) -> ProcessorState {
        *self.state.borrow()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Wait until the processor reaches `target` (or has stopped).
    pub async fn wait_for_state(&mut self, target: ProcessorState) -> ProcessorState {
        match self
            .state
            .wait_for(|s| *s == target || *s == ProcessorState::Stopped)
            .await
        {
            Ok(state) => *state,
            Err(_) => ProcessorState::Stopped,
        }
    }

    /// Wait for the loop to finish.
    pub async fn join(self) -> Result<(), JoinError> {
        self.task.await
    }
}

/// Sequential consume/evaluate/publish/commit loop for one rule.
pub struct StreamProcessor {
    source: Arc<dyn EventSource>,
    emitter: DownstreamEmitter,
    rule: Arc<dyn SignalRule>,
    settings: ProcessorSettings,
    stats: Arc<ProcessorStats>,
}

impl StreamProcessor {
    pub fn new(
        source: Arc<dyn EventSource>,
        emitter: DownstreamEmitter,
        rule: Arc<dyn SignalRule>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            source,
            emitter,
            rule,
            settings,
            stats: Arc::new(ProcessorStats::default()),
        }
    }

    /// Start the loop on the runtime.
    pub fn spawn(self) -> ProcessorHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ProcessorState::Running);
        let stats = Arc::clone(&self.stats);
        let task = tokio::spawn(self.run(cancel_rx, state_tx));

        ProcessorHandle {
            cancel: cancel_tx,
            state: state_rx,
            stats,
            task,
        }
    }

    async fn run(self, mut cancel: watch::Receiver<bool>, state: watch::Sender<ProcessorState>) {
        info!(
            rule = self.rule.name(),
            outbound = %self.emitter.topic(),
            "Stream processor started"
        );

        let mut pull_backoff = self.backoff();

        loop {
            if *cancel.borrow_and_update() {
                break;
            }

            let pulled = match watch_stop(&mut cancel, self.source.next()).await {
                Interrupted::Done(pulled) => pulled,
                Interrupted::Stopped => break,
            };

            let message = match pulled {
                Ok(message) => {
                    pull_backoff = self.backoff();
                    message
                }
                Err(BusError::Closed) => {
                    warn!(rule = self.rule.name(), "Inbound source closed");
                    break;
                }
                Err(e) => {
                    let delay = pull_backoff.next().unwrap_or(self.settings.retry_max_delay);
                    error!(
                        rule = self.rule.name(),
                        error = %e,
                        delay = ?delay,
                        "Failed to pull message"
                    );
                    if self.pause(&mut cancel, delay).await {
                        break;
                    }
                    continue;
                }
            };

            if !self.settle_with_retry(&message, &mut cancel, &state).await {
                break;
            }
        }

        self.shutdown(&state).await;
    }

    /// Settle one message, retrying transient failures. Returns false when a
    /// stop request ended processing.
    async fn settle_with_retry(
        &self,
        message: &InboundMessage,
        cancel: &mut watch::Receiver<bool>,
        state: &watch::Sender<ProcessorState>,
    ) -> bool {
        let mut backoff = self.backoff();

        loop {
            let attempt = self.settle(message);
            tokio::pin!(attempt);

            let (result, stopping) = match watch_stop(cancel, &mut attempt).await {
                Interrupted::Done(result) => (result, false),
                Interrupted::Stopped => {
                    state.send_replace(ProcessorState::Draining);
                    info!(position = %message.position(), "Draining in-flight message");
                    match tokio::time::timeout(self.settings.drain_timeout, &mut attempt).await {
                        Ok(result) => (result, true),
                        Err(_) => {
                            warn!(
                                position = %message.position(),
                                timeout = ?self.settings.drain_timeout,
                                "Drain timed out, message will be redelivered"
                            );
                            return false;
                        }
                    }
                }
            };

            match result {
                Ok(outcome) => {
                    self.record(outcome);
                    return !stopping;
                }
                Err(e) => {
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    if stopping {
                        warn!(
                            position = %message.position(),
                            error = %e,
                            "Failed while draining, message will be redelivered"
                        );
                        return false;
                    }

                    let delay = backoff.next().unwrap_or(self.settings.retry_max_delay);
                    warn!(
                        rule = self.rule.name(),
                        position = %message.position(),
                        error = %e,
                        delay = ?delay,
                        "Transient failure, retrying message"
                    );
                    if self.pause(cancel, delay).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Handle one message end to end, turning malformed input into a skip.
    async fn settle(&self, message: &InboundMessage) -> Result<Outcome, ProcessError> {
        match self.handle(message).await {
            Err(e) if !e.is_retryable() => {
                self.skip(message, &e).await?;
                Ok(Outcome::Skipped)
            }
            result => result,
        }
    }

    async fn handle(&self, message: &InboundMessage) -> Result<Outcome, ProcessError> {
        let event = LoyaltyEvent::from_json(&message.payload)?;

        let outcome = match self.rule.evaluate(&event).await? {
            Some(derived) => {
                self.emitter.emit(&derived).await?;
                self.rule.on_emitted(&event).await?;
                Outcome::Emitted
            }
            None => Outcome::Processed,
        };

        self.source.commit(message).await?;
        debug!(
            rule = self.rule.name(),
            position = %message.position(),
            card_id = %event.card_id,
            "Settled message"
        );
        Ok(outcome)
    }

    /// Log, optionally dead-letter, and commit a message that cannot be decoded.
    async fn skip(
        &self,
        message: &InboundMessage,
        reason: &ProcessError,
    ) -> Result<(), ProcessError> {
        let payload = payload_preview(&message.payload);
        warn!(
            rule = self.rule.name(),
            position = %message.position(),
            error = %reason,
            payload = %payload,
            "Skipping malformed message"
        );

        if let Some(ref topic) = self.settings.dead_letter_topic {
            let letter = DeadLetter {
                reason: reason.to_string(),
                topic: message.topic.clone(),
                partition: message.partition,
                offset: message.offset,
                payload,
            };
            let body = serde_json::to_vec(&letter)
                .map_err(|e| BusError::Publish(format!("Failed to serialize dead letter: {}", e)))?;
            let key = message.key.clone().unwrap_or_else(|| message.position());
            self.emitter.publisher().publish(topic, &key, body).await?;
        }

        self.source.commit(message).await?;
        Ok(())
    }

    fn record(&self, outcome: Outcome) {
        match outcome {
            Outcome::Processed => {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Emitted => {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
                self.stats.emitted.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Skipped => {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Sleep for `delay` unless a stop is requested first. Returns true if stopped.
    async fn pause(&self, cancel: &mut watch::Receiver<bool>, delay: Duration) -> bool {
        matches!(
            watch_stop(cancel, tokio::time::sleep(delay)).await,
            Interrupted::Stopped
        )
    }

    fn backoff(&self) -> backon::ExponentialBackoff {
        processing_backoff(self.settings.retry_min_delay, self.settings.retry_max_delay).build()
    }

    async fn shutdown(&self, state: &watch::Sender<ProcessorState>) {
        state.send_replace(ProcessorState::Draining);

        if let Err(e) = self
            .emitter
            .publisher()
            .flush(self.settings.drain_timeout)
            .await
        {
            warn!(rule = self.rule.name(), error = %e, "Failed to flush publisher");
        }
        if let Err(e) = self.source.close().await {
            warn!(rule = self.rule.name(), error = %e, "Failed to close inbound source");
        }

        state.send_replace(ProcessorState::Stopped);
        info!(
            rule = self.rule.name(),
            stats = ?self.stats.snapshot(),
            "Stream processor stopped"
        );
    }
}

/// Run `work` until it completes or a stop is requested.
///
/// A dropped stop sender never counts as a stop request.
async fn watch_stop<F: std::future::Future>(
    cancel: &mut watch::Receiver<bool>,
    work: F,
) -> Interrupted<F::Output> {
    let stop = async {
        let requested = cancel.wait_for(|stop| *stop).await.is_ok();
        if !requested {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        biased;
        _ = stop => Interrupted::Stopped,
        output = work => Interrupted::Done(output),
    }
}

/// Lossy UTF-8 view of a payload, cut to `MAX_LOGGED_PAYLOAD` characters.
pub fn payload_preview(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    if text.chars().count() <= MAX_LOGGED_PAYLOAD {
        return text.into_owned();
    }
    let mut preview: String = text.chars().take(MAX_LOGGED_PAYLOAD).collect();
    preview.push_str("...");
    preview
}
