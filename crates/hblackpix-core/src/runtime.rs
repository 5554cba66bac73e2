//! Owner of the service instances and their background tasks.

use crate::cache::CacheManager;
use crate::cancel::CancellationToken;
use crate::clock::{Clock, SystemClock};
use crate::config::{MonitorDefaults, RuntimeConfig, StorageDefaults};
use crate::error::Result;
use crate::monitor::{PerformanceMonitor, ThresholdTable};
use crate::offline::{ActionHandlers, ConnectivityMonitor, OfflineSync};
use crate::rate_limit::{CounterStore, KeyValueCounterStore, RateLimiter, SecurityService};
use crate::realtime::{ChangeFeed, ChangePayload, InMemoryChangeFeed, RealtimeManager, SubscribeOptions};
use crate::storage::{KeyValueStore, SqliteStore};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Builder for a [`Runtime`].
///
/// # Example
///
/// ```rust,ignore
/// use hblackpix_core::Runtime;
///
/// let runtime = Runtime::builder()
///     .with_sqlite("./state.sqlite")
///     .build()
///     .await?;
/// ```
#[derive(Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    sqlite_path: Option<PathBuf>,
    feed: Option<Arc<dyn ChangeFeed>>,
    clock: Option<Arc<dyn Clock>>,
    connectivity: Option<Arc<ConnectivityMonitor>>,
    security: Option<Arc<SecurityService>>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Persistent storage shared by the cache, the limiter and the offline
    /// queue. Without one they run memory-only.
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a SQLite state file for storage and for the security tables.
    pub fn with_sqlite(mut self, path: impl Into<PathBuf>) -> Self {
        self.sqlite_path = Some(path.into());
        self
    }

    pub fn with_feed(mut self, feed: Arc<dyn ChangeFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_connectivity(mut self, connectivity: Arc<ConnectivityMonitor>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    pub fn with_security(mut self, security: Arc<SecurityService>) -> Self {
        self.security = Some(security);
        self
    }

    /// Construct the services and start the cache sweeper.
    pub async fn build(self) -> Result<Runtime> {
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let mut security = self.security;
        let mut store = self.store;
        if let Some(path) = &self.sqlite_path {
            if store.is_none() {
                store = Some(Arc::new(SqliteStore::open_with_quota(
                    path,
                    StorageDefaults::DEFAULT_QUOTA_BYTES,
                )?));
            }
            if security.is_none() {
                security = Some(Arc::new(SecurityService::open(
                    path,
                    self.config.security.clone(),
                )?));
            }
        }

        let cache = Arc::new(CacheManager::build(
            self.config.cache.clone(),
            store.clone(),
            Arc::clone(&clock),
        ));

        let feed: Arc<dyn ChangeFeed> = self
            .feed
            .unwrap_or_else(|| Arc::new(InMemoryChangeFeed::new()));
        let realtime = Arc::new(RealtimeManager::new(feed, self.config.realtime.clone()));

        let rate_limiter = Arc::new(RateLimiter::build(
            store
                .clone()
                .map(|s| Arc::new(KeyValueCounterStore::new(s)) as Arc<dyn CounterStore>),
            Arc::clone(&clock),
        ));

        let monitor = Arc::new(PerformanceMonitor::with_clock(
            self.config.monitor.clone(),
            Arc::clone(&clock),
        ));

        let connectivity = self.connectivity.unwrap_or_default();
        let offline = Arc::new(OfflineSync::with_clock(
            Arc::clone(&connectivity),
            store,
            self.config.offline.clone(),
            Arc::clone(&clock),
        ));

        let shutdown = CancellationToken::new();
        let sweeper = cache.start_sweeper(shutdown.clone());
        info!("Runtime initialized");

        Ok(Runtime {
            cache,
            realtime,
            rate_limiter,
            security,
            monitor,
            offline,
            connectivity,
            config: self.config,
            shutdown,
            tasks: Mutex::new(vec![sweeper]),
        })
    }
}

/// One instance of each service, with an explicit lifecycle.
///
/// [`init`](Self::init) starts the background tasks and
/// [`dispose`](Self::dispose) stops them and tears down realtime channels.
pub struct Runtime {
    cache: Arc<CacheManager>,
    realtime: Arc<RealtimeManager>,
    rate_limiter: Arc<RateLimiter>,
    security: Option<Arc<SecurityService>>,
    monitor: Arc<PerformanceMonitor>,
    offline: Arc<OfflineSync>,
    connectivity: Arc<ConnectivityMonitor>,
    config: RuntimeConfig,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("disposed", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Memory-only runtime with `config`.
    pub async fn init(config: RuntimeConfig) -> Result<Self> {
        RuntimeBuilder::new().config(config).build().await
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn realtime(&self) -> &Arc<RealtimeManager> {
        &self.realtime
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn security(&self) -> Option<&Arc<SecurityService>> {
        self.security.as_ref()
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn offline(&self) -> &Arc<OfflineSync> {
        &self.offline
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    /// Start replaying offline actions on every reconnect.
    pub fn start_offline_sync(&self, handlers: ActionHandlers) {
        let task = self.offline.run(Arc::new(handlers), self.shutdown.clone());
        self.track(task);
    }

    /// Drop every cache key starting with `key_prefix` whenever `table`
    /// changes.
    pub fn bind_invalidation(&self, table: &str, key_prefix: &str) -> Result<()> {
        let cache = Arc::clone(&self.cache);
        let prefix = key_prefix.to_string();
        let channel = format!("invalidate:{}:{}", table, key_prefix);

        self.realtime.subscribe(
            &channel,
            table,
            Arc::new(move |change: ChangePayload| {
                let removed = cache.invalidate_prefix(&prefix);
                debug!(
                    "Change on '{}' invalidated {} entries under '{}'",
                    change.table, removed, prefix
                );
            }),
            SubscribeOptions::new(),
        )
    }

    /// Read-through fetch: cache first, then `fetch` timed as
    /// `api_{name}`. Records the cache hit rate after each read once the
    /// cache has seen enough lookups for the rate to mean something.
    pub async fn fetch_cached<F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        name: &str,
        fetch: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Value, E>>,
        E: fmt::Display,
    {
        let monitor = &self.monitor;
        let result = self
            .cache
            .get_or_fetch(key, ttl, || monitor.measure_api_call(name, fetch()))
            .await;

        let stats = self.cache.stats();
        if stats.hits + stats.misses >= MonitorDefaults::MIN_HIT_RATE_SAMPLES {
            self.monitor
                .record_metric(ThresholdTable::CACHE_HIT_RATE, stats.hit_rate, None);
        }
        result
    }

    pub fn is_disposed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop background tasks and tear down realtime channels.
    pub async fn dispose(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let channels = self.realtime.unsubscribe_all();

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                debug!("Background task ended abnormally: {}", e);
            }
        }
        info!("Runtime disposed ({} realtime channels closed)", channels);
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
