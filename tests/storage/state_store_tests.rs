//! StateStore interface tests.
//!
//! These tests verify the contract of the StateStore trait.
//! Each storage implementation should run these tests.

use std::time::Duration;

use uuid::Uuid;

use loyalty_stream::store::StateStore;

/// Unique key so runs against a shared store never collide.
pub fn unique_key(name: &str) -> String {
    format!("{}:{}", name, Uuid::new_v4().simple())
}

// =============================================================================
// Counter tests
// =============================================================================

pub async fn test_increment_from_absent<S: StateStore>(store: &S) {
    let key = unique_key("counter_new");

    assert_eq!(store.get(&key).await.expect("get should succeed"), None);
    assert_eq!(store.increment(&key).await.expect("increment"), 1);
    assert_eq!(store.increment(&key).await.expect("increment"), 2);
    assert_eq!(store.get(&key).await.expect("get should succeed"), Some(2));
}

pub async fn test_expiry_on_missing_key<S: StateStore>(store: &S) {
    let key = unique_key("expiry_missing");

    let applied = store
        .set_expiry(&key, Duration::from_secs(10))
        .await
        .expect("set_expiry should succeed");
    assert!(!applied, "expiry on a missing key should report false");
}

pub async fn test_counter_expires<S: StateStore>(store: &S) {
    let key = unique_key("counter_ttl");

    store.increment(&key).await.expect("increment");
    assert!(store
        .set_expiry(&key, Duration::from_secs(1))
        .await
        .expect("set_expiry should succeed"));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(store.get(&key).await.expect("get should succeed"), None);
    assert_eq!(
        store.increment(&key).await.expect("increment"),
        1,
        "an expired counter starts a fresh window"
    );
}

pub async fn test_windowed_counter_expires_from_first_hit<S: StateStore>(store: &S) {
    let key = unique_key("window");
    let window = Duration::from_secs(2);

    assert_eq!(store.increment_with_expiry(&key, window).await.expect("increment"), 1);
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(store.increment_with_expiry(&key, window).await.expect("increment"), 2);

    // A later hit must not push the deadline out.
    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert_eq!(store.get(&key).await.expect("get should succeed"), None);
    assert_eq!(store.increment_with_expiry(&key, window).await.expect("increment"), 1);
}

pub async fn test_windowed_counter_heals_missing_expiry<S: StateStore>(store: &S) {
    let key = unique_key("window_heal");

    store.increment(&key).await.expect("increment");
    assert_eq!(
        store
            .increment_with_expiry(&key, Duration::from_secs(1))
            .await
            .expect("increment"),
        2
    );

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(
        store.get(&key).await.expect("get should succeed"),
        None,
        "a counter found without expiry gets one"
    );
}

pub async fn test_delete<S: StateStore>(store: &S) {
    let key = unique_key("delete");

    store.increment(&key).await.expect("increment");
    assert!(store.delete(&key).await.expect("delete should succeed"));
    assert!(!store.delete(&key).await.expect("delete should succeed"));
    assert_eq!(store.get(&key).await.expect("get should succeed"), None);
}

// =============================================================================
// Ordered set tests
// =============================================================================

pub async fn test_range_orders_by_score<S: StateStore>(store: &S) {
    let key = unique_key("set_order");

    store.add_scored(&key, "b:1", 20.0).await.expect("add");
    store.add_scored(&key, "a:1", 10.0).await.expect("add");
    store.add_scored(&key, "c:1", 30.0).await.expect("add");

    let members: Vec<String> = store
        .range_all(&key)
        .await
        .expect("range should succeed")
        .into_iter()
        .map(|m| m.member)
        .collect();
    assert_eq!(members, vec!["a:1", "b:1", "c:1"]);
}

pub async fn test_add_overwrites_score<S: StateStore>(store: &S) {
    let key = unique_key("set_overwrite");

    store.add_scored(&key, "tx:5", 10.0).await.expect("add");
    store.add_scored(&key, "tx:5", 99.0).await.expect("add");

    let entries = store.range_all(&key).await.expect("range should succeed");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].score, 99.0);
}

pub async fn test_purge_is_strictly_below<S: StateStore>(store: &S) {
    let key = unique_key("set_purge");

    store.add_scored(&key, "old:1", 99.0).await.expect("add");
    store.add_scored(&key, "edge:1", 100.0).await.expect("add");
    store.add_scored(&key, "new:1", 101.0).await.expect("add");

    let removed = store.purge_below(&key, 100.0).await.expect("purge");
    assert_eq!(removed, 1);

    let members: Vec<String> = store
        .range_all(&key)
        .await
        .expect("range should succeed")
        .into_iter()
        .map(|m| m.member)
        .collect();
    assert_eq!(members, vec!["edge:1", "new:1"]);
}

pub async fn test_remove_members<S: StateStore>(store: &S) {
    let key = unique_key("set_remove");

    store.add_scored(&key, "tx1:5", 1.0).await.expect("add");
    store.add_scored(&key, "tx2:5", 2.0).await.expect("add");

    let removed = store
        .remove(&key, &["tx1:5".to_string(), "absent:1".to_string()])
        .await
        .expect("remove should succeed");
    assert_eq!(removed, 1);
    assert_eq!(store.range_all(&key).await.expect("range").len(), 1);
}

pub async fn test_missing_set_is_empty<S: StateStore>(store: &S) {
    let key = unique_key("set_missing");

    assert!(store.range_all(&key).await.expect("range").is_empty());
    assert_eq!(store.purge_below(&key, 1e12).await.expect("purge"), 0);
}

/// Run all StateStore tests against an implementation.
#[macro_export]
macro_rules! run_state_store_tests {
    ($store:expr) => {
        use $crate::storage::state_store_tests::*;

        // counter tests
        test_increment_from_absent($store).await;
        println!("  test_increment_from_absent: PASSED");

        test_expiry_on_missing_key($store).await;
        println!("  test_expiry_on_missing_key: PASSED");

        test_counter_expires($store).await;
        println!("  test_counter_expires: PASSED");

        test_windowed_counter_expires_from_first_hit($store).await;
        println!("  test_windowed_counter_expires_from_first_hit: PASSED");

        test_windowed_counter_heals_missing_expiry($store).await;
        println!("  test_windowed_counter_heals_missing_expiry: PASSED");

        test_delete($store).await;
        println!("  test_delete: PASSED");

        // ordered set tests
        test_range_orders_by_score($store).await;
        println!("  test_range_orders_by_score: PASSED");

        test_add_overwrites_score($store).await;
        println!("  test_add_overwrites_score: PASSED");

        test_purge_is_strictly_below($store).await;
        println!("  test_purge_is_strictly_below: PASSED");

        test_remove_members($store).await;
        println!("  test_remove_members: PASSED");

        test_missing_set_is_empty($store).await;
        println!("  test_missing_set_is_empty: PASSED");
    };
}
