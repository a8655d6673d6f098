//! reward-engine: spend reward worker
//!
//! Consumes loyalty-card events, keeps each card's rolling spend in Redis and
//! publishes a coupon once the spend threshold is crossed.
//!
//! ## Architecture
//! ```text
//! [inbound topic] --> [reward-engine] --> [reward topic]
//!                           |
//!                           v
//!                   customer_spend:{card}
//! ```
//!
//! ## Configuration
//! - `--config <path>` / LOYALTY_CONFIG: YAML configuration file
//! - LOYALTY__SECTION__KEY: per-setting overrides (e.g. LOYALTY__REWARD__SPEND_THRESHOLD)
//! - LOYALTY_LOG: tracing filter (default: info)

use std::sync::Arc;

use tracing::{error, info};

use loyalty_stream::bus::{KafkaBusConfig, KafkaEventPublisher, KafkaEventSource};
use loyalty_stream::config::Config;
use loyalty_stream::emitter::DownstreamEmitter;
use loyalty_stream::processor::{RewardRule, StreamProcessor};
use loyalty_stream::store::RedisStateStore;
use loyalty_stream::utils::bootstrap::{connect_with_retry, init_tracing, parse_config_path};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path(std::env::args().skip(1));
    let config = Config::load(config_path.as_deref())
        .inspect_err(|e| error!(error = %e, "Failed to load configuration"))?;
    let settings = config
        .reward_settings()
        .inspect_err(|e| error!(error = %e, "Invalid configuration"))?;

    let redis = &config.redis;
    let store = connect_with_retry("redis", || {
        RedisStateStore::new(&redis.url, redis.key_prefix.as_deref())
    })
    .await?;

    let kafka = KafkaBusConfig::from_settings(&settings.event_log);
    let source = KafkaEventSource::new(&kafka, settings.event_log.inbound_topic.as_str())?;
    let publisher = KafkaEventPublisher::new(&kafka)?;

    let processor = StreamProcessor::new(
        Arc::new(source),
        DownstreamEmitter::new(Arc::new(publisher), settings.outbound_topic.as_str()),
        Arc::new(RewardRule::from_settings(Arc::new(store), &settings)),
        settings.processor.clone(),
    );
    let handle = processor.spawn();

    info!(
        inbound = %settings.event_log.inbound_topic,
        outbound = %settings.outbound_topic,
        threshold = %settings.spend_threshold,
        window_days = settings.window.num_days(),
        "reward-engine started"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    handle.stop();
    handle.join().await?;

    Ok(())
}
