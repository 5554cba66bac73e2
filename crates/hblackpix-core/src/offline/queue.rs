//! Persisted queue of mutations made while offline, replayed on reconnect.

use super::connectivity::{ConnectivityMonitor, ConnectivityState};
use crate::cancel::CancellationToken;
use crate::clock::{Clock, SystemClock};
use crate::config::OfflineDefaults;
use crate::error::{CoreError, Result};
use crate::storage::KeyValueStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A mutation waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineAction {
    pub id: String,
    #[serde(rename = "type")]
    pub action_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
}

/// Replays one action type against the backend.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, data: &Value) -> Result<()>;
}

/// Adapter turning an async closure into an [`ActionHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, data: &Value) -> Result<()> {
        (self.0)(data.clone()).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ActionHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Handlers keyed by action type.
#[derive(Default, Clone)]
pub struct ActionHandlers {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, action_type: &str, handler: Arc<dyn ActionHandler>) -> Self {
        self.register(action_type, handler);
        self
    }

    pub fn register(&mut self, action_type: &str, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(action_type.to_string(), handler);
    }

    pub fn get(&self, action_type: &str) -> Option<&Arc<dyn ActionHandler>> {
        self.handlers.get(action_type)
    }
}

/// Configuration for [`OfflineSync`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Failed replays before an action is abandoned.
    pub max_retries: u32,
    pub namespace: String,
    pub queue_key: String,
    pub event_capacity: usize,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            max_retries: OfflineDefaults::MAX_RETRIES,
            namespace: OfflineDefaults::NAMESPACE.to_string(),
            queue_key: OfflineDefaults::QUEUE_KEY.to_string(),
            event_capacity: OfflineDefaults::EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl OfflineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OfflineEvent {
    ActionQueued {
        id: String,
        action_type: String,
    },
    ActionSynced {
        id: String,
        action_type: String,
    },
    ActionFailed {
        id: String,
        action_type: String,
        retry_count: u32,
        error: String,
    },
    /// Dropped after exhausting its retries.
    ActionAbandoned {
        action: OfflineAction,
        last_error: String,
    },
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub abandoned: usize,
    /// Nothing ran because the network was offline.
    pub skipped_offline: bool,
}

/// Offline action queue.
///
/// The queue is mirrored to key/value storage as one JSON array so it
/// survives restarts. Storage failures are logged and the in-memory queue
/// stays authoritative. A snapshot that could not be written is retried on
/// the next change or replay pass. Until then a restart restores the last
/// snapshot that did land, so replay is at-least-once and handlers should
/// tolerate seeing an action twice.
pub struct OfflineSync {
    queue: Mutex<Vec<OfflineAction>>,
    store: Option<Arc<dyn KeyValueStore>>,
    connectivity: Arc<ConnectivityMonitor>,
    clock: Arc<dyn Clock>,
    config: OfflineConfig,
    events: broadcast::Sender<OfflineEvent>,
    /// Serializes replay passes.
    sync_lock: tokio::sync::Mutex<()>,
    storage_degraded: AtomicBool,
    /// Storage holds an older snapshot than memory.
    snapshot_dirty: AtomicBool,
}

impl OfflineSync {
    pub fn new(
        connectivity: Arc<ConnectivityMonitor>,
        store: Option<Arc<dyn KeyValueStore>>,
        config: OfflineConfig,
    ) -> Self {
        Self::with_clock(connectivity, store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        connectivity: Arc<ConnectivityMonitor>,
        store: Option<Arc<dyn KeyValueStore>>,
        config: OfflineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let sync = Self {
            queue: Mutex::new(Vec::new()),
            store,
            connectivity,
            clock,
            config,
            events,
            sync_lock: tokio::sync::Mutex::new(()),
            storage_degraded: AtomicBool::new(false),
            snapshot_dirty: AtomicBool::new(false),
        };
        let restored = sync.load_persisted();
        if !restored.is_empty() {
            info!("Restored {} pending offline actions", restored.len());
        }
        *sync.queue() = restored;
        sync
    }

    fn queue(&self) -> MutexGuard<'_, Vec<OfflineAction>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn storage_failed(&self, operation: &str, err: &CoreError) {
        if self.storage_degraded.swap(true, Ordering::Relaxed) {
            debug!("Offline queue storage {} failed: {}", operation, err);
        } else {
            warn!(
                "Offline queue storage {} failed, keeping queue in memory: {}",
                operation, err
            );
        }
    }

    fn load_persisted(&self) -> Vec<OfflineAction> {
        let Some(store) = &self.store else {
            return Vec::new();
        };
        let raw = match store.get(&self.config.namespace, &self.config.queue_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                self.storage_failed("read", &e);
                return Vec::new();
            }
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!("Discarding unreadable offline queue: {}", e);
            Vec::new()
        })
    }

    /// Write the queue to storage. Callers pass a snapshot taken under lock.
    fn persist(&self, snapshot: &[OfflineAction]) {
        let Some(store) = &self.store else { return };
        let (namespace, key) = (&self.config.namespace, &self.config.queue_key);
        let result = serde_json::to_string(snapshot)
            .map_err(CoreError::from)
            .and_then(|raw| store.set(namespace, key, &raw));
        let Err(e) = result else {
            self.snapshot_dirty.store(false, Ordering::Relaxed);
            return;
        };
        self.storage_failed("write", &e);

        // An empty queue is recorded just as well by dropping the stored copy
        if snapshot.is_empty() {
            match store.remove(namespace, key) {
                Ok(_) => {
                    self.snapshot_dirty.store(false, Ordering::Relaxed);
                    return;
                }
                Err(e) => self.storage_failed("remove", &e),
            }
        }
        self.snapshot_dirty.store(true, Ordering::Relaxed);
    }

    /// Retry a snapshot write that failed earlier.
    fn flush_dirty(&self) {
        if self.snapshot_dirty.load(Ordering::Relaxed) {
            let snapshot = self.pending_actions();
            self.persist(&snapshot);
        }
    }

    /// Mutate the queue and persist the result.
    fn update_queue<R>(&self, f: impl FnOnce(&mut Vec<OfflineAction>) -> R) -> R {
        let (result, snapshot) = {
            let mut queue = self.queue();
            let result = f(&mut queue);
            (result, queue.clone())
        };
        self.persist(&snapshot);
        result
    }

    fn emit(&self, event: OfflineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Queue a mutation for later replay. Returns its id.
    pub fn queue_action(&self, action_type: &str, data: Value) -> String {
        let action = OfflineAction {
            id: uuid::Uuid::new_v4().to_string(),
            action_type: action_type.to_string(),
            data,
            timestamp: self.clock.now(),
            retry_count: 0,
        };
        let id = action.id.clone();

        self.update_queue(|queue| queue.push(action));
        debug!("Queued offline action {} ({})", id, action_type);
        self.emit(OfflineEvent::ActionQueued {
            id: id.clone(),
            action_type: action_type.to_string(),
        });
        id
    }

    /// Replay every pending action once, in queue order.
    ///
    /// Does nothing while offline, and stops early if connectivity drops
    /// mid-pass. A missing handler counts as a failure.
    pub async fn sync_pending_actions(&self, handlers: &ActionHandlers) -> SyncReport {
        self.flush_dirty();
        let mut report = SyncReport::default();
        if !self.connectivity.is_online() {
            report.skipped_offline = true;
            return report;
        }

        let _pass = self.sync_lock.lock().await;
        let pending = self.pending_actions();
        if pending.is_empty() {
            return report;
        }
        info!("Replaying {} offline actions", pending.len());

        for action in pending {
            if !self.connectivity.is_online() {
                debug!("Connectivity lost during replay, stopping");
                break;
            }
            report.attempted += 1;

            let outcome = match handlers.get(&action.action_type) {
                Some(handler) => handler.handle(&action.data).await,
                None => Err(CoreError::HandlerMissing {
                    action_type: action.action_type.clone(),
                }),
            };

            match outcome {
                Ok(()) => {
                    report.succeeded += 1;
                    self.update_queue(|queue| queue.retain(|a| a.id != action.id));
                    debug!("Offline action {} synced", action.id);
                    self.emit(OfflineEvent::ActionSynced {
                        id: action.id,
                        action_type: action.action_type,
                    });
                }
                Err(e) => {
                    let error = e.to_string();
                    let max_retries = self.config.max_retries;
                    let updated = self.update_queue(|queue| {
                        let index = queue.iter().position(|a| a.id == action.id)?;
                        queue[index].retry_count += 1;
                        if queue[index].retry_count >= max_retries {
                            Some((queue.remove(index), true))
                        } else {
                            Some((queue[index].clone(), false))
                        }
                    });

                    match updated {
                        Some((dropped, true)) => {
                            report.abandoned += 1;
                            warn!(
                                "Abandoning offline action {} ({}) after {} attempts: {}",
                                dropped.id, dropped.action_type, dropped.retry_count, error
                            );
                            self.emit(OfflineEvent::ActionAbandoned {
                                action: dropped,
                                last_error: error,
                            });
                        }
                        Some((retained, false)) => {
                            report.failed += 1;
                            warn!(
                                "Offline action {} ({}) failed, attempt {}/{}: {}",
                                retained.id, retained.action_type, retained.retry_count, max_retries, error
                            );
                            self.emit(OfflineEvent::ActionFailed {
                                id: retained.id,
                                action_type: retained.action_type,
                                retry_count: retained.retry_count,
                                error,
                            });
                        }
                        // Removed concurrently
                        None => report.failed += 1,
                    }
                }
            }
        }

        report
    }

    /// Replay on every transition to online until `shutdown` is cancelled.
    pub fn run(
        self: &Arc<Self>,
        handlers: Arc<ActionHandlers>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let sync = Arc::clone(self);
        let mut connectivity = self.connectivity.subscribe();

        tokio::spawn(async move {
            if sync.connectivity.is_online() && sync.pending_count() > 0 {
                sync.sync_pending_actions(&handlers).await;
            }

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Offline replay loop stopping");
                        break;
                    }
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *connectivity.borrow_and_update();
                        if state == ConnectivityState::Online {
                            sync.sync_pending_actions(&handlers).await;
                        }
                    }
                }
            }
        })
    }

    pub fn pending_actions(&self) -> Vec<OfflineAction> {
        self.queue().clone()
    }

    pub fn pending_count(&self) -> usize {
        self.queue().len()
    }

    /// Drop every pending action without replaying it.
    pub fn clear(&self) -> usize {
        self.update_queue(|queue| {
            let count = queue.len();
            queue.clear();
            count
        })
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn events(&self) -> broadcast::Receiver<OfflineEvent> {
        self.events.subscribe()
    }
}
