//! Loyalty Stream - stateful signals over loyalty-card events
//!
//! Consumes loyalty-card transaction events from an event log and derives two
//! per-customer signals backed by an external atomic state store:
//!
//! - rolling-window spend, edge-triggered into reward issuance
//! - fixed-window transaction frequency, flagged as fraud alerts
//!
//! Each rule runs as its own sequential consume -> evaluate -> publish ->
//! commit loop with at-least-once delivery.

pub mod bus;
pub mod clock;
pub mod config;
pub mod emitter;
pub mod model;
pub mod processor;
pub mod rate;
pub mod spend;
pub mod store;
pub mod utils;
