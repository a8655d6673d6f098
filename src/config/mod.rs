//! Application configuration.
//!
//! Loaded from YAML files and environment variables into `Config`, then
//! resolved per rule into validated settings (`RewardSettings`,
//! `FraudSettings`). A required value that is absent or out of range is a
//! fatal startup error, reported before any connection is opened.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "LOYALTY_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "LOYALTY";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "LOYALTY_LOG";

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Event log connection and inbound subscription.
    pub kafka: KafkaConfig,
    /// State store connection.
    pub redis: RedisConfig,
    /// Spend reward rule.
    pub reward: RewardConfig,
    /// Fraud frequency rule.
    pub fraud: FraudConfig,
    /// Worker loop tuning.
    pub processor: ProcessorConfig,
}

/// Kafka-specific configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers (comma-separated).
    pub bootstrap_servers: Option<String>,
    /// Consumer group ID.
    pub group_id: Option<String>,
    /// Topic carrying loyalty-card events.
    pub inbound_topic: Option<String>,
    /// SASL username (optional, for authenticated clusters).
    pub sasl_username: Option<String>,
    /// SASL password (optional, for authenticated clusters).
    pub sasl_password: Option<String>,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512).
    pub sasl_mechanism: Option<String>,
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub security_protocol: Option<String>,
    /// SSL CA certificate path (for SSL connections).
    pub ssl_ca_location: Option<String>,
}

/// Redis-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
    /// Optional namespace prepended to every key.
    pub key_prefix: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: None,
        }
    }
}

/// Spend reward rule configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    /// Topic receiving reward events.
    pub outbound_topic: Option<String>,
    /// Rolling spend that earns a reward.
    pub spend_threshold: Option<Decimal>,
    /// Rolling window length in days.
    pub window_days: Option<u32>,
    /// Coupon code prefix.
    pub coupon_prefix: String,
    /// Human-readable coupon description.
    pub coupon_description: String,
    /// Days until an issued coupon expires.
    pub coupon_validity_days: u32,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            outbound_topic: None,
            spend_threshold: None,
            window_days: None,
            coupon_prefix: "WELCOME20".to_string(),
            coupon_description: "Sconto 20% sul prossimo acquisto".to_string(),
            coupon_validity_days: 30,
        }
    }
}

/// Fraud frequency rule configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FraudConfig {
    /// Topic receiving fraud alerts.
    pub outbound_topic: Option<String>,
    /// Transactions allowed per window before alerting.
    pub max_transactions: Option<u32>,
    /// Fixed window length in seconds.
    pub window_seconds: Option<u64>,
}

/// Worker loop configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// First retry delay after a transient failure.
    pub retry_min_delay_ms: u64,
    /// Upper bound for retry delays.
    pub retry_max_delay_ms: u64,
    /// Time allowed for in-flight work and producer flush on shutdown.
    pub drain_timeout_secs: u64,
    /// Topic for undecodable messages. Disabled when absent.
    pub dead_letter_topic: Option<String>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            retry_min_delay_ms: 100,
            retry_max_delay_ms: 5000,
            drain_timeout_secs: 5,
            dead_letter_topic: None,
        }
    }
}

// ============================================================================
// Resolved settings
// ============================================================================

/// Validated event log settings.
#[derive(Debug, Clone, PartialEq)]
pub struct EventLogSettings {
    pub bootstrap_servers: String,
    pub group_id: String,
    pub inbound_topic: String,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub sasl_mechanism: Option<String>,
    pub security_protocol: Option<String>,
    pub ssl_ca_location: Option<String>,
}

/// Validated worker loop settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorSettings {
    pub retry_min_delay: Duration,
    pub retry_max_delay: Duration,
    pub drain_timeout: Duration,
    pub dead_letter_topic: Option<String>,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            retry_min_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(5),
            dead_letter_topic: None,
        }
    }
}

/// Coupon issuing parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CouponSettings {
    pub prefix: String,
    pub description: String,
    pub validity: chrono::Duration,
}

impl Default for CouponSettings {
    fn default() -> Self {
        let defaults = RewardConfig::default();
        Self {
            prefix: defaults.coupon_prefix,
            description: defaults.coupon_description,
            validity: chrono::Duration::days(i64::from(defaults.coupon_validity_days)),
        }
    }
}

/// Everything the reward engine needs, validated.
#[derive(Debug, Clone, PartialEq)]
pub struct RewardSettings {
    pub event_log: EventLogSettings,
    pub outbound_topic: String,
    pub spend_threshold: Decimal,
    pub window: chrono::Duration,
    pub coupon: CouponSettings,
    pub processor: ProcessorSettings,
}

/// Everything the fraud detector needs, validated.
#[derive(Debug, Clone, PartialEq)]
pub struct FraudSettings {
    pub event_log: EventLogSettings,
    pub outbound_topic: String,
    pub max_transactions: u32,
    pub window_seconds: u64,
    pub processor: ProcessorSettings,
}

fn required<T: Clone>(value: &Option<T>, key: &'static str) -> Result<T, ConfigError> {
    value.clone().ok_or(ConfigError::Missing(key))
}

fn required_text(value: &Option<String>, key: &'static str) -> Result<String, ConfigError> {
    match value.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => Ok(text.to_string()),
        _ => Err(ConfigError::Missing(key)),
    }
}

fn positive<T: PartialOrd + Default + std::fmt::Display>(
    value: T,
    key: &'static str,
) -> Result<T, ConfigError> {
    if value > T::default() {
        Ok(value)
    } else {
        Err(ConfigError::Invalid {
            key,
            reason: format!("must be greater than zero, got {}", value),
        })
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Resolve the inbound event log settings.
    pub fn event_log(&self) -> Result<EventLogSettings, ConfigError> {
        let kafka = &self.kafka;
        Ok(EventLogSettings {
            bootstrap_servers: required_text(&kafka.bootstrap_servers, "kafka.bootstrap_servers")?,
            group_id: required_text(&kafka.group_id, "kafka.group_id")?,
            inbound_topic: required_text(&kafka.inbound_topic, "kafka.inbound_topic")?,
            sasl_username: kafka.sasl_username.clone(),
            sasl_password: kafka.sasl_password.clone(),
            sasl_mechanism: kafka.sasl_mechanism.clone(),
            security_protocol: kafka.security_protocol.clone(),
            ssl_ca_location: kafka.ssl_ca_location.clone(),
        })
    }

    /// Resolve the worker loop settings.
    pub fn processor_settings(&self) -> Result<ProcessorSettings, ConfigError> {
        let p = &self.processor;
        positive(p.retry_min_delay_ms, "processor.retry_min_delay_ms")?;
        if p.retry_max_delay_ms < p.retry_min_delay_ms {
            return Err(ConfigError::Invalid {
                key: "processor.retry_max_delay_ms",
                reason: format!(
                    "must not be below retry_min_delay_ms ({})",
                    p.retry_min_delay_ms
                ),
            });
        }

        Ok(ProcessorSettings {
            retry_min_delay: Duration::from_millis(p.retry_min_delay_ms),
            retry_max_delay: Duration::from_millis(p.retry_max_delay_ms),
            drain_timeout: Duration::from_secs(p.drain_timeout_secs),
            dead_letter_topic: p
                .dead_letter_topic
                .clone()
                .filter(|t| !t.trim().is_empty()),
        })
    }

    /// Validate and resolve everything the reward engine needs.
    pub fn reward_settings(&self) -> Result<RewardSettings, ConfigError> {
        let reward = &self.reward;
        let threshold = positive(
            required(&reward.spend_threshold, "reward.spend_threshold")?,
            "reward.spend_threshold",
        )?;
        let window_days = positive(
            required(&reward.window_days, "reward.window_days")?,
            "reward.window_days",
        )?;

        Ok(RewardSettings {
            event_log: self.event_log()?,
            outbound_topic: required_text(&reward.outbound_topic, "reward.outbound_topic")?,
            spend_threshold: threshold,
            window: chrono::Duration::days(i64::from(window_days)),
            coupon: CouponSettings {
                prefix: reward.coupon_prefix.clone(),
                description: reward.coupon_description.clone(),
                validity: chrono::Duration::days(i64::from(reward.coupon_validity_days)),
            },
            processor: self.processor_settings()?,
        })
    }

    /// Validate and resolve everything the fraud detector needs.
    pub fn fraud_settings(&self) -> Result<FraudSettings, ConfigError> {
        let fraud = &self.fraud;
        // Zero is allowed: every transaction is then over the limit.
        let max_transactions = required(&fraud.max_transactions, "fraud.max_transactions")?;
        let window_seconds = positive(
            required(&fraud.window_seconds, "fraud.window_seconds")?,
            "fraud.window_seconds",
        )?;

        Ok(FraudSettings {
            event_log: self.event_log()?,
            outbound_topic: required_text(&fraud.outbound_topic, "fraud.outbound_topic")?,
            max_transactions,
            window_seconds,
            processor: self.processor_settings()?,
        })
    }
}
