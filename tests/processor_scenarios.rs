//! End-to-end worker scenarios over the in-memory event log and state store.
//!
//! Run with: cargo test --test processor_scenarios

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;

use loyalty_stream::bus::ChannelBus;
use loyalty_stream::config::{CouponSettings, ProcessorSettings};
use loyalty_stream::emitter::DownstreamEmitter;
use loyalty_stream::processor::{
    FraudRule, ProcessorHandle, RewardRule, SignalRule, StreamProcessor,
};
use loyalty_stream::rate::RateWindowDetector;
use loyalty_stream::spend::SpendWindowAggregator;
use loyalty_stream::store::InMemoryStateStore;

const INBOUND: &str = "loyalty-events";
const REWARDS: &str = "reward-events";
const ALERTS: &str = "fraud-alerts";

fn settings() -> ProcessorSettings {
    ProcessorSettings {
        retry_min_delay: Duration::from_millis(5),
        retry_max_delay: Duration::from_millis(20),
        ..ProcessorSettings::default()
    }
}

fn event(card: &str, tx: &str, kind: &str, details: &str) -> String {
    format!(
        r#"{{"IDCARTA":"{}","idTransazione":"{}","idPuntoVendita":"PV-9","timestamp":"2024-05-01T10:00:00","tipoEvento":"{}","dettagli":{}}}"#,
        card, tx, kind, details
    )
}

fn purchase(card: &str, tx: &str, amount: &str) -> String {
    event(
        card,
        tx,
        "Acquisto",
        &format!(r#"{{"importo":{},"punti":5}}"#, amount),
    )
}

fn spawn(
    bus: &Arc<ChannelBus>,
    group: &str,
    outbound: &str,
    rule: Arc<dyn SignalRule>,
) -> ProcessorHandle {
    StreamProcessor::new(
        Arc::new(bus.source(group, INBOUND)),
        DownstreamEmitter::new(Arc::new(bus.publisher()), outbound),
        rule,
        settings(),
    )
    .spawn()
}

async fn wait_for_commit(bus: &ChannelBus, group: &str, offset: i64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while bus.committed_offset(group, INBOUND) != Some(offset) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "{} never committed up to {}",
            group,
            offset
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn shutdown(handle: ProcessorHandle) {
    handle.stop();
    handle.join().await.expect("processor task panicked");
}

fn reward_rule(store: &Arc<InMemoryStateStore>) -> Arc<dyn SignalRule> {
    Arc::new(RewardRule::new(
        store.clone(),
        Decimal::new(10000, 2),
        chrono::Duration::days(30),
        CouponSettings::default(),
    ))
}

#[tokio::test]
async fn scenario_a_spend_crossing_rewards_once_and_restarts() {
    let bus = ChannelBus::new();
    let store = Arc::new(InMemoryStateStore::new());
    let handle = spawn(&bus, "reward-engine", REWARDS, reward_rule(&store));

    bus.append(INBOUND, Some("CARD-A"), purchase("CARD-A", "T1", "60.00"));
    bus.append(INBOUND, Some("CARD-A"), purchase("CARD-A", "T2", "50.00"));
    bus.append(INBOUND, Some("CARD-A"), purchase("CARD-A", "T3", "20.00"));
    wait_for_commit(&bus, "reward-engine", 3).await;

    let rewards = bus.records(REWARDS);
    assert_eq!(rewards.len(), 1);
    let reward: serde_json::Value = serde_json::from_slice(&rewards[0].payload).unwrap();
    assert_eq!(reward["idCarta"], "CARD-A");
    assert!(reward["codiceCoupon"]
        .as_str()
        .unwrap()
        .starts_with("WELCOME20-"));

    // Only the purchase after the reset is still counted.
    let spend = SpendWindowAggregator::new(store.clone());
    assert_eq!(
        spend
            .current_total("CARD-A", chrono::Duration::days(30))
            .await
            .unwrap(),
        Decimal::new(2000, 2)
    );
    shutdown(handle).await;
}

#[tokio::test]
async fn scenario_b_frequency_alert_on_sixth_transaction() {
    let bus = ChannelBus::new();
    let store = Arc::new(InMemoryStateStore::new());
    let rule = Arc::new(FraudRule::new(store.clone(), 5, 60));
    let handle = spawn(&bus, "fraud-detector", ALERTS, rule);

    for i in 1..=6 {
        bus.append(
            INBOUND,
            Some("CARD-B"),
            purchase("CARD-B", &format!("T{}", i), "1.00"),
        );
    }
    wait_for_commit(&bus, "fraud-detector", 6).await;

    let alerts = bus.records(ALERTS);
    assert_eq!(alerts.len(), 1);
    let alert: serde_json::Value = serde_json::from_slice(&alerts[0].payload).unwrap();
    assert_eq!(alert["idCarta"], "CARD-B");
    assert_eq!(alert["idTransazioneSospetta"], "T6");
    assert_eq!(alert["tipoAllarme"], "HighFrequencyTransaction");
    assert_eq!(alert["severita"], "Critical");
    assert_eq!(alert["messaggio"], "Rilevate 6 transazioni in 60 secondi.");

    let detector = RateWindowDetector::new(store.clone());
    assert_eq!(detector.current_count("CARD-B").await.unwrap(), 6);
    shutdown(handle).await;
}

#[tokio::test]
async fn scenario_c_malformed_message_between_purchases() {
    let bus = ChannelBus::new();
    let store = Arc::new(InMemoryStateStore::new());
    let handle = spawn(&bus, "reward-engine", REWARDS, reward_rule(&store));

    bus.append(INBOUND, Some("CARD-C"), purchase("CARD-C", "T1", "30.00"));
    bus.append(INBOUND, Some("CARD-C"), "{\"idCarta\": \"CARD-C\", oops");
    bus.append(INBOUND, Some("CARD-C"), purchase("CARD-C", "T2", "40.00"));
    wait_for_commit(&bus, "reward-engine", 3).await;

    let spend = SpendWindowAggregator::new(store.clone());
    assert_eq!(
        spend
            .current_total("CARD-C", chrono::Duration::days(30))
            .await
            .unwrap(),
        Decimal::new(7000, 2)
    );
    let stats = handle.stats();
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.skipped, 1);
    assert!(bus.records(REWARDS).is_empty());
    shutdown(handle).await;
}

#[tokio::test]
async fn scenario_d_redemption_leaves_spend_untouched() {
    let bus = ChannelBus::new();
    let store = Arc::new(InMemoryStateStore::new());
    let handle = spawn(&bus, "reward-engine", REWARDS, reward_rule(&store));

    bus.append(
        INBOUND,
        Some("CARD-D"),
        event("CARD-D", "R1", "Riscatto", r#"{"importo":0,"punti":10}"#),
    );
    wait_for_commit(&bus, "reward-engine", 1).await;

    assert_eq!(store.write_count(), 0);
    assert_eq!(handle.stats().processed, 1);
    shutdown(handle).await;
}

#[tokio::test]
async fn both_rules_consume_the_same_stream_independently() {
    let bus = ChannelBus::new();
    let store = Arc::new(InMemoryStateStore::new());
    let rewards = spawn(&bus, "reward-engine", REWARDS, reward_rule(&store));
    let alerts = spawn(
        &bus,
        "fraud-detector",
        ALERTS,
        Arc::new(FraudRule::new(store.clone(), 1, 60)),
    );

    bus.append(INBOUND, Some("CARD-E"), purchase("CARD-E", "T1", "80.00"));
    bus.append(INBOUND, Some("CARD-E"), purchase("CARD-E", "T2", "80.00"));
    wait_for_commit(&bus, "reward-engine", 2).await;
    wait_for_commit(&bus, "fraud-detector", 2).await;

    assert_eq!(bus.records(REWARDS).len(), 1);
    assert_eq!(bus.records(ALERTS).len(), 1);
    shutdown(rewards).await;
    shutdown(alerts).await;
}

#[tokio::test]
async fn redelivered_purchase_does_not_double_count() {
    let bus = ChannelBus::new();
    let store = Arc::new(InMemoryStateStore::new());
    let handle = spawn(&bus, "reward-engine", REWARDS, reward_rule(&store));

    let payload = purchase("CARD-F", "T1", "70.00");
    bus.append(INBOUND, Some("CARD-F"), payload.clone());
    bus.append(INBOUND, Some("CARD-F"), payload);
    wait_for_commit(&bus, "reward-engine", 2).await;

    let spend = SpendWindowAggregator::new(store.clone());
    assert_eq!(
        spend
            .current_total("CARD-F", chrono::Duration::days(30))
            .await
            .unwrap(),
        Decimal::new(7000, 2)
    );
    assert!(bus.records(REWARDS).is_empty());
    shutdown(handle).await;
}
