//! Wire model for inbound loyalty events and derived outbound events.
//!
//! Inbound field names are matched case-insensitively: object keys are
//! lower-cased before the typed decode, so `IdCarta`, `idCarta` and `IDCARTA`
//! all land on the same field.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Errors produced while decoding an inbound payload.
///
/// All variants are non-retryable: the same bytes will never decode.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Payload is empty")]
    Empty,

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}

/// Kind of a loyalty event.
///
/// Only `Purchase` feeds spend aggregation; every kind counts toward the
/// transaction rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Purchase,
    Redemption,
    Other,
}

impl EventKind {
    /// Parse a wire value (`Acquisto`, `Riscatto`, anything else).
    pub fn from_wire(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "acquisto" => EventKind::Purchase,
            "riscatto" => EventKind::Redemption,
            _ => EventKind::Other,
        }
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map(EventKind::from_wire).unwrap_or(EventKind::Other))
    }
}

/// Monetary and points details of a transaction.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EventDetails {
    #[serde(rename = "importo", default)]
    pub amount: Decimal,
    #[serde(rename = "punti", default)]
    pub points: i64,
}

/// A loyalty-card transaction event as published by the ingestion endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoyaltyEvent {
    #[serde(rename = "idcarta")]
    pub card_id: String,
    #[serde(rename = "idtransazione", default)]
    pub transaction_id: String,
    #[serde(rename = "idpuntovendita", default)]
    pub store_id: String,
    #[serde(rename = "timestamp", default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "tipoevento")]
    pub kind: EventKind,
    #[serde(rename = "dettagli", default)]
    pub details: Option<EventDetails>,
}

impl LoyaltyEvent {
    /// Decode a JSON payload, matching field names case-insensitively.
    ///
    /// `idCarta` must be present and non-empty and `tipoEvento` must be present;
    /// everything else falls back to defaults.
    pub fn from_json(payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(DecodeError::Empty);
        }

        let value: Value = serde_json::from_slice(payload)?;
        let value = lowercase_keys(value);

        if value.get("tipoevento").map_or(true, Value::is_null) {
            return Err(DecodeError::MissingField("tipoEvento"));
        }

        let event: LoyaltyEvent = serde_json::from_value(value)?;
        if event.card_id.trim().is_empty() {
            return Err(DecodeError::MissingField("idCarta"));
        }

        Ok(event)
    }

    /// Whether this event contributes to spend aggregation.
    pub fn is_spend(&self) -> bool {
        self.kind == EventKind::Purchase && self.details.is_some() && !self.card_id.is_empty()
    }

    /// Purchase amount, zero when details are absent.
    pub fn amount(&self) -> Decimal {
        self.details.as_ref().map(|d| d.amount).unwrap_or_default()
    }
}

/// Recursively lower-case object keys.
fn lowercase_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k.to_lowercase(), lowercase_keys(v)))
                .collect::<Map<String, Value>>(),
        ),
        other => other,
    }
}

/// Offset-less ISO 8601 date-time shapes, read as UTC.
const NAIVE_TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// Parse an ISO 8601 timestamp: RFC 3339, an offset-less date-time (UTC), or
/// a bare date (midnight UTC).
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    NAIVE_TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
}

/// The timestamp is informational only, so an unreadable one is dropped with
/// a warning rather than failing the whole event.
fn lenient_timestamp<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    let parsed = match &value {
        Value::Null => return Ok(None),
        Value::String(raw) => parse_timestamp(raw),
        _ => None,
    };
    if parsed.is_none() {
        warn!(timestamp = %value, "Ignoring unparseable event timestamp");
    }
    Ok(parsed)
}

/// Reward issued once a customer's rolling spend crosses the threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardEvent {
    #[serde(rename = "idCarta")]
    pub card_id: String,
    #[serde(rename = "codiceCoupon")]
    pub coupon_code: String,
    #[serde(rename = "descrizione")]
    pub description: String,
    #[serde(rename = "dataScadenza")]
    pub expires_at: DateTime<Utc>,
    #[serde(rename = "timestamp")]
    pub emitted_at: DateTime<Utc>,
}

/// Alert severity on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// Alert raised when a card's transaction frequency exceeds the limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudAlertEvent {
    #[serde(rename = "idCarta")]
    pub card_id: String,
    #[serde(rename = "idTransazioneSospetta")]
    pub suspicious_transaction_id: String,
    #[serde(rename = "tipoAllarme")]
    pub alarm_kind: String,
    #[serde(rename = "messaggio")]
    pub message: String,
    #[serde(rename = "severita")]
    pub severity: AlertSeverity,
    #[serde(rename = "timestampAllarme")]
    pub emitted_at: DateTime<Utc>,
}

/// An outbound event produced by one of the rules.
#[derive(Debug, Clone, PartialEq)]
pub enum DerivedEvent {
    Reward(RewardEvent),
    FraudAlert(FraudAlertEvent),
}

impl DerivedEvent {
    /// Customer id used as the partition key.
    pub fn card_id(&self) -> &str {
        match self {
            DerivedEvent::Reward(e) => &e.card_id,
            DerivedEvent::FraudAlert(e) => &e.card_id,
        }
    }

    /// Serialize to the outbound JSON payload.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            DerivedEvent::Reward(e) => serde_json::to_vec(e),
            DerivedEvent::FraudAlert(e) => serde_json::to_vec(e),
        }
    }
}

impl fmt::Display for DerivedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DerivedEvent::Reward(e) => write!(f, "reward {} for {}", e.coupon_code, e.card_id),
            DerivedEvent::FraudAlert(e) => write!(f, "{} alert for {}", e.alarm_kind, e.card_id),
        }
    }
}
