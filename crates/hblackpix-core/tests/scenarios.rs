//! End-to-end scenarios across the public services.
//!
//! Each test drives the services the way the billing UI does: through the
//! crate root exports, with a manual clock or a paused tokio clock.

use chrono::{TimeZone, Utc};
use hblackpix_core::offline::{handler_fn, ConnectivityState, OfflineEvent};
use hblackpix_core::realtime::{ChangeEventKind, SubscribeOptions};
use hblackpix_core::{
    ActionHandlers, CacheConfig, CacheManager, ChangePayload, Clock, ConnectivityMonitor,
    CoreError, InMemoryChangeFeed, KeyValueStore, ManualClock, MemoryStore, OfflineConfig,
    OfflineSync, RateLimiter, RealtimeConfig, RealtimeManager, Runtime, SecurityConfig,
    SecurityService,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const FIFTEEN_MINUTES: Duration = Duration::from_secs(15 * 60);

fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()))
}

async fn wait_for_listener(feed: &InMemoryChangeFeed) {
    while feed.listener_count() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[test]
fn test_cache_entry_expires_after_ttl() {
    let clock = manual_clock();
    let cache = CacheManager::build(
        CacheConfig::default(),
        Some(Arc::new(MemoryStore::new()) as Arc<dyn KeyValueStore>),
        clock.clone() as Arc<dyn Clock>,
    );

    cache.set("k", json!({"a": 1}), Some(Duration::from_secs(1)));
    assert_eq!(cache.get("k"), Some(json!({"a": 1})));

    clock.advance(Duration::from_millis(1500));
    assert_eq!(cache.get("k"), None);

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.persisted_entries, 0);
}

#[test]
fn test_cache_counts_every_lookup() {
    let cache = CacheManager::new(CacheConfig::default());
    cache.set("present", json!(true), None);

    let keys = ["present", "absent", "present", "other", "present"];
    for key in keys {
        cache.get(key);
    }

    let stats = cache.stats();
    assert_eq!(stats.hits + stats.misses, keys.len() as u64);
    assert_eq!(stats.hits, 3);
}

#[test]
fn test_cache_evicts_oldest_when_full() {
    let clock = manual_clock();
    let cache = CacheManager::build(
        CacheConfig::default().with_max_entries(3),
        Some(Arc::new(MemoryStore::new()) as Arc<dyn KeyValueStore>),
        clock.clone() as Arc<dyn Clock>,
    );

    for key in ["a", "b", "c", "d"] {
        cache.set(key, json!(key), None);
        clock.advance(Duration::from_secs(1));
    }

    let stats = cache.stats();
    assert_eq!(stats.memory_entries, 3);
    assert_eq!(stats.evictions, 1);
    // The evicted entry is gone from storage too, so it cannot be rehydrated
    assert_eq!(cache.get("a"), None);
    assert_eq!(cache.get("d"), Some(json!("d")));
}

#[test]
fn test_login_limit_sequence() {
    let limiter = RateLimiter::new();
    let results: Vec<bool> = (0..6)
        .map(|_| limiter.check_rate_limit("user@x.com", "login", 5, FIFTEEN_MINUTES))
        .collect();
    assert_eq!(results, vec![true, true, true, true, true, false]);

    // Other identifiers and actions are counted separately
    assert!(limiter.check_rate_limit("other@x.com", "login", 5, FIFTEEN_MINUTES));
    assert!(limiter.check_rate_limit("user@x.com", "signup", 3, FIFTEEN_MINUTES));
}

#[test]
fn test_login_limit_sequence_is_audited() {
    let security = SecurityService::open_in_memory(SecurityConfig::default()).unwrap();

    let results: Vec<bool> = (0..6)
        .map(|_| {
            security
                .check_rate_limit("user@x.com", "login", 5, FIFTEEN_MINUTES)
                .unwrap()
        })
        .collect();
    assert_eq!(results, vec![true, true, true, true, true, false]);

    let events = security.recent_audit_events(10).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].actor, "user@x.com");

    assert!(security.reset("user@x.com", "login").unwrap());
    assert!(security
        .check_rate_limit("user@x.com", "login", 5, FIFTEEN_MINUTES)
        .unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_changes_reaches_callback_once() {
    let feed = Arc::new(InMemoryChangeFeed::new());
    let manager = RealtimeManager::new(feed.clone(), RealtimeConfig::default());
    let seen: Arc<Mutex<Vec<ChangePayload>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    manager
        .subscribe(
            "invoice-changes",
            "invoices",
            Arc::new(move |change: ChangePayload| sink.lock().unwrap().push(change)),
            SubscribeOptions::new(),
        )
        .unwrap();
    wait_for_listener(&feed).await;

    for seq in 1..=10 {
        feed.publish(
            ChangePayload::new("invoices", ChangeEventKind::Update).with_new(json!({"seq": seq})),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].new, Some(json!({"seq": 10})));
}

#[tokio::test]
async fn test_offline_action_dropped_after_three_failures() {
    let connectivity = Arc::new(ConnectivityMonitor::new(ConnectivityState::Online));
    let sync = OfflineSync::new(
        connectivity,
        Some(Arc::new(MemoryStore::new()) as Arc<dyn KeyValueStore>),
        OfflineConfig::default(),
    );
    let mut events = sync.events();
    let handlers = ActionHandlers::new().with(
        "create_client",
        handler_fn(|_data: Value| async {
            Err(CoreError::Handler {
                message: "HTTP 503".to_string(),
            })
        }),
    );

    sync.queue_action("create_client", json!({"name": "Ana"}));
    for _ in 0..3 {
        sync.sync_pending_actions(&handlers).await;
    }

    assert_eq!(sync.pending_count(), 0);
    let mut abandoned = None;
    while let Ok(event) = events.try_recv() {
        if let OfflineEvent::ActionAbandoned { action, .. } = event {
            abandoned = Some(action);
        }
    }
    let abandoned = abandoned.unwrap();
    assert_eq!(abandoned.action_type, "create_client");
    assert_eq!(abandoned.retry_count, 3);
}

#[tokio::test]
async fn test_offline_action_removed_after_late_success() {
    let connectivity = Arc::new(ConnectivityMonitor::new(ConnectivityState::Online));
    let sync = OfflineSync::new(connectivity, None, OfflineConfig::default());
    let attempts = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&attempts);
    let handlers = ActionHandlers::new().with(
        "pay_invoice",
        handler_fn(move |_data: Value| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt < 2 {
                    Err(CoreError::Handler {
                        message: "timeout".to_string(),
                    })
                } else {
                    Ok(())
                }
            }
        }),
    );

    sync.queue_action("pay_invoice", json!({"invoice_id": "i-1"}));

    let first = sync.sync_pending_actions(&handlers).await;
    assert_eq!(first.failed, 1);
    assert_eq!(sync.pending_actions()[0].retry_count, 1);

    let second = sync.sync_pending_actions(&handlers).await;
    assert_eq!(second.succeeded, 1);
    assert_eq!(sync.pending_count(), 0);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_replays_queued_actions() {
    let feed = Arc::new(InMemoryChangeFeed::new());
    let connectivity = Arc::new(ConnectivityMonitor::new(ConnectivityState::Offline));
    let runtime = Runtime::builder()
        .with_feed(feed)
        .with_connectivity(connectivity.clone())
        .build()
        .await
        .unwrap();

    let replayed = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&replayed);
    runtime.start_offline_sync(ActionHandlers::new().with(
        "update_invoice",
        handler_fn(move |_data: Value| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        }),
    ));

    runtime
        .offline()
        .queue_action("update_invoice", json!({"status": "paid"}));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(replayed.load(Ordering::SeqCst), 0);

    connectivity.set_online();
    while runtime.offline().pending_count() > 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(replayed.load(Ordering::SeqCst), 1);
    runtime.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_table_change_invalidates_dashboard_cache() {
    let feed = Arc::new(InMemoryChangeFeed::new());
    let runtime = Runtime::builder().with_feed(feed.clone()).build().await.unwrap();
    runtime.bind_invalidation("invoices", "stats_").unwrap();
    wait_for_listener(&feed).await;

    let fetches = &AtomicU32::new(0);
    let fetch = move || async move {
        let n = fetches.fetch_add(1, Ordering::SeqCst) + 1;
        Ok::<_, String>(json!({"total_invoices": n}))
    };

    let first = runtime
        .fetch_cached("stats_u1_false", None, "dashboard_stats", fetch)
        .await
        .unwrap();
    assert_eq!(first, json!({"total_invoices": 1}));

    feed.publish(ChangePayload::new("invoices", ChangeEventKind::Insert));
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let second = runtime
        .fetch_cached("stats_u1_false", None, "dashboard_stats", fetch)
        .await
        .unwrap();
    assert_eq!(second, json!({"total_invoices": 2}));
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
    runtime.dispose().await;
}
