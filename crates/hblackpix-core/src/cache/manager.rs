//! Two-tier TTL cache: in-memory map mirrored to a [`KeyValueStore`].
//!
//! Reads go memory → storage → miss. Storage failures are logged and the cache
//! keeps working from memory alone.

use super::types::{CacheConfig, CacheEntry, CacheStats, PersistedEntry};
use crate::cancel::CancellationToken;
use crate::clock::{Clock, SystemClock};
use crate::error::{CoreError, Result};
use crate::storage::KeyValueStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type FetchOutcome = std::result::Result<Value, String>;

/// Process-wide key/value cache with TTL expiry.
///
/// Keys are opaque strings built by callers from a resource name plus its
/// scoping parameters, e.g. `stats_{user_id}_{is_admin}`.
pub struct CacheManager {
    memory: Mutex<HashMap<String, CacheEntry>>,
    store: Option<Arc<dyn KeyValueStore>>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    /// Set after the first storage failure so later ones log at debug.
    storage_degraded: AtomicBool,
    /// Keys deleted from memory whose stored copy could not be removed.
    /// They are never rehydrated until a later write or remove succeeds.
    tombstones: Mutex<HashSet<String>>,
    in_flight: Mutex<HashMap<String, broadcast::Sender<FetchOutcome>>>,
}

impl CacheManager {
    /// Memory-only cache.
    pub fn new(config: CacheConfig) -> Self {
        Self::build(config, None, Arc::new(SystemClock))
    }

    /// Cache mirrored to persistent storage.
    pub fn with_store(config: CacheConfig, store: Arc<dyn KeyValueStore>) -> Self {
        Self::build(config, Some(store), Arc::new(SystemClock))
    }

    pub fn build(
        config: CacheConfig,
        store: Option<Arc<dyn KeyValueStore>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            memory: Mutex::new(HashMap::new()),
            store,
            clock,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            storage_degraded: AtomicBool::new(false),
            tombstones: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn memory(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tombstones(&self) -> MutexGuard<'_, HashSet<String>> {
        self.tombstones.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn storage_failed(&self, operation: &str, key: &str, err: &CoreError) {
        if self.storage_degraded.swap(true, Ordering::Relaxed) {
            debug!("Cache storage {} for '{}' failed: {}", operation, key, err);
        } else {
            warn!(
                "Cache storage {} for '{}' failed, continuing memory-only: {}",
                operation, key, err
            );
        }
    }

    // === Persistent tier ===

    fn persist(&self, key: &str, entry: &CacheEntry) {
        let Some(store) = &self.store else { return };

        let serialized = match serde_json::to_string(&PersistedEntry::from(entry)) {
            Ok(s) => s,
            Err(e) => {
                self.storage_failed("serialize", key, &e.into());
                return;
            }
        };

        match store.set(&self.config.namespace, key, &serialized) {
            Ok(()) => {
                self.tombstones().remove(key);
            }
            Err(e) => self.storage_failed("write", key, &e),
        }
    }

    fn unpersist(&self, key: &str) {
        let Some(store) = &self.store else { return };
        match store.remove(&self.config.namespace, key) {
            Ok(_) => {
                self.tombstones().remove(key);
            }
            Err(e) => {
                self.storage_failed("remove", key, &e);
                self.tombstones().insert(key.to_string());
            }
        }
    }

    fn load_persisted(&self, key: &str) -> Option<CacheEntry> {
        let store = self.store.as_ref()?;

        if self.tombstones().contains(key) {
            // Retry the removal that failed earlier; the stored copy is stale either way
            if store.remove(&self.config.namespace, key).is_ok() {
                self.tombstones().remove(key);
            }
            return None;
        }

        let raw = match store.get(&self.config.namespace, key) {
            Ok(raw) => raw?,
            Err(e) => {
                self.storage_failed("read", key, &e);
                return None;
            }
        };

        match serde_json::from_str::<PersistedEntry>(&raw) {
            Ok(persisted) => Some(persisted.into()),
            Err(e) => {
                warn!("Discarding unreadable cache entry '{}': {}", key, e);
                self.unpersist(key);
                None
            }
        }
    }

    // === Public operations ===

    /// Store `data` under `key`. `ttl` defaults to the configured TTL.
    ///
    /// If the memory tier then holds more than `max_entries`, the entry with
    /// the oldest `stored_at` is evicted from both tiers.
    pub fn set(&self, key: &str, data: Value, ttl: Option<Duration>) {
        let entry = CacheEntry {
            data,
            stored_at: self.clock.now(),
            ttl: ttl.unwrap_or(self.config.default_ttl),
        };

        let evicted = self.insert_memory(key.to_string(), entry.clone());
        if let Some(evicted) = evicted {
            self.unpersist(&evicted);
        }
        self.persist(key, &entry);
    }

    /// Serialize `value` and store it.
    pub fn set_as<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
        let data = serde_json::to_value(value)?;
        self.set(key, data, ttl);
        Ok(())
    }

    /// Insert into memory and enforce the size bound. Returns the evicted key.
    /// The entry just inserted is never the one evicted, even when it ties on
    /// `stored_at` with older entries.
    fn insert_memory(&self, key: String, entry: CacheEntry) -> Option<String> {
        let mut memory = self.memory();
        memory.insert(key.clone(), entry);

        if memory.len() <= self.config.max_entries {
            return None;
        }

        let oldest = memory
            .iter()
            .filter(|(k, _)| **k != key)
            .min_by_key(|(_, entry)| entry.stored_at)
            .map(|(k, _)| k.clone())?;
        memory.remove(&oldest);
        self.evictions.fetch_add(1, Ordering::Relaxed);
        debug!("Evicted oldest cache entry '{}'", oldest);
        Some(oldest)
    }

    /// Look up `key`, rehydrating from storage on a memory miss.
    ///
    /// Expired entries are deleted and reported as absent. Every call counts
    /// as exactly one hit or one miss.
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = self.clock.now();

        let cached = self.memory().get(key).cloned();
        let entry = match cached {
            Some(entry) => Some(entry),
            None => self.load_persisted(key).map(|entry| {
                if entry.is_valid_at(now) {
                    debug!("Rehydrated cache entry '{}' from storage", key);
                    if let Some(evicted) = self.insert_memory(key.to_string(), entry.clone()) {
                        self.unpersist(&evicted);
                    }
                }
                entry
            }),
        };

        match entry {
            Some(entry) if entry.is_valid_at(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.data)
            }
            Some(_) => {
                debug!("Cache entry '{}' expired", key);
                self.delete(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Typed variant of [`get`](Self::get). A value of the wrong shape is
    /// treated as absent.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                warn!("Cache entry '{}' has an unexpected shape: {}", key, e);
                None
            }
        }
    }

    /// Valid memory entry without touching the hit/miss counters.
    fn peek(&self, key: &str) -> Option<Value> {
        let now = self.clock.now();
        self.memory()
            .get(key)
            .filter(|entry| entry.is_valid_at(now))
            .map(|entry| entry.data.clone())
    }

    /// Remove one entry from both tiers.
    pub fn delete(&self, key: &str) {
        self.memory().remove(key);
        self.unpersist(key);
    }

    /// Remove every entry whose key starts with `prefix`. Returns how many
    /// distinct keys were removed.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut removed: Vec<String> = {
            let mut memory = self.memory();
            let keys: Vec<String> = memory
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect();
            for key in &keys {
                memory.remove(key);
            }
            keys
        };

        if let Some(store) = &self.store {
            match store.keys(&self.config.namespace) {
                Ok(keys) => {
                    for key in keys.into_iter().filter(|k| k.starts_with(prefix)) {
                        self.unpersist(&key);
                        if !removed.contains(&key) {
                            removed.push(key);
                        }
                    }
                }
                Err(e) => {
                    self.storage_failed("list", prefix, &e);
                    for key in &removed {
                        self.unpersist(key);
                    }
                }
            }
        }

        if !removed.is_empty() {
            debug!("Invalidated {} cache entries with prefix '{}'", removed.len(), prefix);
        }
        removed.len()
    }

    /// Remove all entries from both tiers.
    pub fn clear(&self) {
        let in_memory: Vec<String> = self.memory().drain().map(|(k, _)| k).collect();
        let Some(store) = &self.store else { return };

        match store.clear(&self.config.namespace) {
            Ok(_) => self.tombstones().clear(),
            Err(e) => {
                self.storage_failed("clear", "*", &e);
                let stored = store.keys(&self.config.namespace).unwrap_or_default();
                self.tombstones().extend(in_memory.into_iter().chain(stored));
            }
        }
    }

    /// Purge expired entries from both tiers. Returns the number of distinct
    /// keys purged.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();

        let mut purged: Vec<String> = {
            let mut memory = self.memory();
            let expired: Vec<String> = memory
                .iter()
                .filter(|(_, entry)| !entry.is_valid_at(now))
                .map(|(k, _)| k.clone())
                .collect();
            for key in &expired {
                memory.remove(key);
            }
            expired
        };

        if let Some(store) = &self.store {
            let keys = match store.keys(&self.config.namespace) {
                Ok(keys) => keys,
                Err(e) => {
                    self.storage_failed("list", "*", &e);
                    Vec::new()
                }
            };
            for key in keys {
                let expired = self
                    .load_persisted(&key)
                    .map(|entry| !entry.is_valid_at(now))
                    .unwrap_or(false);
                if expired {
                    self.unpersist(&key);
                    if !purged.contains(&key) {
                        purged.push(key);
                    }
                }
            }
        }

        if !purged.is_empty() {
            debug!("Purged {} expired cache entries", purged.len());
        }
        purged.len()
    }

    /// Spawn the periodic sweep. It stops when `shutdown` is cancelled.
    pub fn start_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick fires immediately; skip it so the sweep is periodic
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Cache sweeper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        cache.purge_expired();
                    }
                }
            }
        })
    }

    /// Hit/miss accounting plus entry counts.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let persisted_entries = self
            .store
            .as_ref()
            .and_then(|store| store.keys(&self.config.namespace).ok())
            .map(|keys| keys.len())
            .unwrap_or(0);

        CacheStats {
            hits,
            misses,
            hit_rate: CacheStats::hit_rate_percent(hits, misses),
            memory_entries: self.memory().len(),
            persisted_entries,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    // === Single-flight read-through ===

    /// Return the cached value for `key`, or run `fetch` and cache its result.
    ///
    /// Concurrent callers that miss on the same key share a single `fetch`;
    /// only the first one runs it and the rest wait for its outcome. Fetch
    /// errors are not cached.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        fetch: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Value, E>>,
        E: std::fmt::Display,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let mut waiter = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match in_flight.get(key) {
                Some(sender) => Some(sender.subscribe()),
                None => {
                    // A leader may have finished between our miss and this lock
                    if let Some(value) = self.peek(key) {
                        return Ok(value);
                    }
                    let (sender, _) = broadcast::channel(1);
                    in_flight.insert(key.to_string(), sender);
                    None
                }
            }
        };

        if let Some(receiver) = waiter.as_mut() {
            debug!("Joining in-flight fetch for '{}'", key);
            return match receiver.recv().await {
                Ok(outcome) => outcome.map_err(|message| CoreError::Fetch {
                    key: key.to_string(),
                    message,
                }),
                Err(_) => Err(CoreError::Fetch {
                    key: key.to_string(),
                    message: "in-flight fetch was dropped before completing".to_string(),
                }),
            };
        }

        let guard = InFlightGuard { cache: self, key };
        let outcome: FetchOutcome = fetch().await.map_err(|e| e.to_string());

        if let Ok(value) = &outcome {
            self.set(key, value.clone(), ttl);
        }

        if let Some(sender) = guard.finish() {
            // No receivers is fine: nobody else was waiting
            let _ = sender.send(outcome.clone());
        }

        outcome.map_err(|message| CoreError::Fetch {
            key: key.to_string(),
            message,
        })
    }
}

/// Removes the in-flight marker if the leader is dropped mid-fetch, which
/// closes the channel and releases any waiters with an error.
struct InFlightGuard<'a> {
    cache: &'a CacheManager,
    key: &'a str,
}

impl InFlightGuard<'_> {
    fn finish(self) -> Option<broadcast::Sender<FetchOutcome>> {
        let sender = self.take();
        std::mem::forget(self);
        sender
    }

    fn take(&self) -> Option<broadcast::Sender<FetchOutcome>> {
        self.cache
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(self.key)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::flaky::FlakyStore;
    use crate::storage::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn manual_cache(max_entries: usize) -> (ManualClock, Arc<MemoryStore>, CacheManager) {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::new());
        let cache = CacheManager::build(
            CacheConfig::new().with_max_entries(max_entries),
            Some(store.clone() as Arc<dyn KeyValueStore>),
            Arc::new(clock.clone()),
        );
        (clock, store, cache)
    }

    #[test]
    fn test_stats_scenario_ttl() {
        let (clock, _store, cache) = manual_cache(100);

        cache.set("stats_user1_false", json!({"total": 5}), Some(Duration::from_millis(2000)));
        assert_eq!(cache.get("stats_user1_false"), Some(json!({"total": 5})));

        clock.advance(Duration::from_millis(2100));
        assert_eq!(cache.get("stats_user1_false"), None);
    }

    #[test]
    fn test_expired_entry_is_deleted_from_both_tiers() {
        let (clock, store, cache) = manual_cache(100);

        cache.set("k", json!(1), Some(Duration::from_millis(10)));
        clock.advance(Duration::from_millis(11));

        assert_eq!(cache.get("k"), None);
        assert_eq!(store.get("cache", "k").unwrap(), None);
        assert_eq!(cache.stats().memory_entries, 0);
    }

    #[test]
    fn test_hits_and_misses_sum_to_reads() {
        let (_clock, _store, cache) = manual_cache(100);

        cache.set("a", json!("x"), None);
        cache.get("a");
        cache.get("a");
        cache.get("b");
        cache.get("a");

        let stats = cache.stats();
        assert_eq!(stats.hits + stats.misses, 4);
        assert_eq!(stats.hits, 3);
        assert!((stats.hit_rate - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_evicts_entry_with_oldest_stored_at() {
        let (clock, store, cache) = manual_cache(3);

        for key in ["a", "b", "c"] {
            cache.set(key, json!(key), None);
            clock.advance(Duration::from_millis(5));
        }
        // Reading "a" does not refresh it: eviction is by insertion time
        assert!(cache.get("a").is_some());

        cache.set("d", json!("d"), None);

        assert_eq!(cache.stats().memory_entries, 3);
        assert_eq!(store.get("cache", "a").unwrap(), None);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("d").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_rehydrates_from_storage() {
        let clock = ManualClock::default();
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());

        let first = CacheManager::build(CacheConfig::new(), Some(store.clone()), Arc::new(clock.clone()));
        first.set("clients_user1", json!([1, 2, 3]), None);

        let second = CacheManager::build(CacheConfig::new(), Some(store), Arc::new(clock));
        assert_eq!(second.get("clients_user1"), Some(json!([1, 2, 3])));
        assert_eq!(second.stats().memory_entries, 1);
        assert_eq!(second.stats().hits, 1);
    }

    #[test]
    fn test_degrades_to_memory_when_storage_full() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::with_quota(0));
        let cache = CacheManager::with_store(CacheConfig::new(), store.clone());

        cache.set("invoices_user1", json!({"count": 2}), None);

        assert_eq!(cache.get("invoices_user1"), Some(json!({"count": 2})));
        assert!(store.keys("cache").unwrap().is_empty());
    }

    #[test]
    fn test_invalidate_prefix() {
        let (_clock, store, cache) = manual_cache(100);

        cache.set("stats_user1_false", json!(1), None);
        cache.set("stats_user2_true", json!(2), None);
        cache.set("clients_user1", json!(3), None);
        // Only present in storage
        store
            .set(
                "cache",
                "stats_user3_false",
                &serde_json::to_string(&json!({"data": 4, "stored_at": chrono::Utc::now(), "ttl_ms": 60000}))
                    .unwrap(),
            )
            .unwrap();

        assert_eq!(cache.invalidate_prefix("stats_"), 3);
        assert!(cache.get("clients_user1").is_some());
        assert!(store.keys("cache").unwrap() == vec!["clients_user1".to_string()]);
    }

    #[test]
    fn test_eviction_spares_new_entry_on_tied_timestamps() {
        let (_clock, _store, cache) = manual_cache(2);

        for key in ["a", "b", "c", "d", "e"] {
            cache.set(key, json!(key), None);
            assert_eq!(cache.get(key), Some(json!(key)));
        }
        assert_eq!(cache.stats().memory_entries, 2);
    }

    fn flaky_cache() -> (Arc<FlakyStore>, CacheManager) {
        let store = Arc::new(FlakyStore::new());
        let cache = CacheManager::build(
            CacheConfig::new(),
            Some(store.clone() as Arc<dyn KeyValueStore>),
            Arc::new(ManualClock::default()),
        );
        (store, cache)
    }

    #[test]
    fn test_invalidated_entry_not_rehydrated_when_remove_fails() {
        let (store, cache) = flaky_cache();
        cache.set("stats_u1", json!(1), None);
        cache.set("clients_u1", json!(2), None);

        store.fail_removes(true);
        assert_eq!(cache.invalidate_prefix("stats_"), 1);
        assert!(store.get("cache", "stats_u1").unwrap().is_some());
        assert_eq!(cache.get("stats_u1"), None);

        // Once storage recovers the stale copy is removed on the next read
        store.fail_removes(false);
        assert_eq!(cache.get("stats_u1"), None);
        assert!(store.get("cache", "stats_u1").unwrap().is_none());

        cache.set("stats_u1", json!(3), None);
        assert_eq!(cache.get("stats_u1"), Some(json!(3)));
    }

    #[test]
    fn test_cleared_entries_not_rehydrated_when_clear_fails() {
        let (store, cache) = flaky_cache();
        cache.set("plans", json!(["pro"]), None);

        store.fail_removes(true);
        cache.clear();
        assert_eq!(cache.get("plans"), None);
    }

    #[test]
    fn test_purge_expired() {
        let (clock, store, cache) = manual_cache(100);

        cache.set("short", json!(1), Some(Duration::from_secs(1)));
        cache.set("long", json!(2), Some(Duration::from_secs(600)));
        clock.advance(Duration::from_secs(2));

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(store.keys("cache").unwrap(), vec!["long".to_string()]);
        // The sweep does not count as reads
        assert_eq!(cache.stats().hits + cache.stats().misses, 0);
    }

    #[test]
    fn test_typed_roundtrip() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct DashboardStats {
            total: u32,
        }

        let cache = CacheManager::new(CacheConfig::new());
        cache.set_as("stats", &DashboardStats { total: 5 }, None).unwrap();
        assert_eq!(cache.get_as::<DashboardStats>("stats"), Some(DashboardStats { total: 5 }));
        assert_eq!(cache.get_as::<Vec<u32>>("stats"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_coalesces_concurrent_misses() {
        let cache = CacheManager::new(CacheConfig::new());
        let calls = &AtomicU32::new(0);

        let fetch = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, String>(json!({"plans": 3}))
        };

        let (a, b, c) = tokio::join!(
            cache.get_or_fetch("plans", None, fetch),
            cache.get_or_fetch("plans", None, fetch),
            cache.get_or_fetch("plans", None, fetch),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap(), json!({"plans": 3}));
        assert_eq!(b.unwrap(), json!({"plans": 3}));
        assert_eq!(c.unwrap(), json!({"plans": 3}));
        assert_eq!(cache.get("plans"), Some(json!({"plans": 3})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_shares_errors_without_caching() {
        let cache = CacheManager::new(CacheConfig::new());

        let (a, b) = tokio::join!(
            cache.get_or_fetch("plans", None, || async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err::<Value, _>("upstream 503")
            }),
            cache.get_or_fetch("plans", None, || async { Ok::<_, String>(json!("unused")) }),
        );

        assert!(matches!(a, Err(CoreError::Fetch { ref message, .. }) if message == "upstream 503"));
        assert!(matches!(b, Err(CoreError::Fetch { .. })));
        assert_eq!(cache.get("plans"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_without_reads() {
        let clock = ManualClock::default();
        let cache = Arc::new(CacheManager::build(
            CacheConfig::new().with_sweep_interval(Duration::from_secs(10)),
            None,
            Arc::new(clock.clone()),
        ));
        let shutdown = CancellationToken::new();
        let handle = cache.start_sweeper(shutdown.clone());

        cache.set("k", json!(1), Some(Duration::from_secs(1)));
        clock.advance(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(cache.stats().memory_entries, 0);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
