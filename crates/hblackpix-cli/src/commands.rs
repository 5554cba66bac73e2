//! Command implementations. Each returns the JSON document to print.

use anyhow::{anyhow, Context, Result};
use hblackpix_core::config::StorageDefaults;
use hblackpix_core::offline::ConnectivityState;
use hblackpix_core::{
    CacheManager, CancellationToken, ConnectivityMonitor, KeyValueStore, OfflineSync,
    ParsedReference, RateLimitPolicy, RuntimeConfig, SecurityService, SqliteStore,
};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Services opened on one state file.
pub struct State {
    store: Arc<dyn KeyValueStore>,
    cache: Arc<CacheManager>,
    security: SecurityService,
    offline: OfflineSync,
}

impl State {
    pub fn open(path: &Path, config: RuntimeConfig) -> Result<Self> {
        let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open_with_quota(
            path,
            StorageDefaults::DEFAULT_QUOTA_BYTES,
        )?);
        let cache = Arc::new(CacheManager::with_store(config.cache, Arc::clone(&store)));
        let security = SecurityService::open(path, config.security)?;
        // The CLI never replays, so the connectivity state only labels output
        let offline = OfflineSync::new(
            Arc::new(ConnectivityMonitor::new(ConnectivityState::Offline)),
            Some(Arc::clone(&store)),
            config.offline,
        );

        Ok(Self {
            store,
            cache,
            security,
            offline,
        })
    }
}

fn parse_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("'{}' is not valid JSON", raw))
}

// === Cache ===

pub fn cache_stats(state: &State) -> Value {
    json!(state.cache.stats())
}

pub fn cache_get(state: &State, key: &str) -> Value {
    json!({ "key": key, "value": state.cache.get(key) })
}

pub fn cache_set(state: &State, key: &str, raw: &str, ttl_secs: Option<u64>) -> Result<Value> {
    let value = parse_json(raw)?;
    let ttl = ttl_secs
        .map(Duration::from_secs)
        .unwrap_or(state.cache.config().default_ttl);
    state.cache.set(key, value, Some(ttl));
    Ok(json!({ "key": key, "ttl_secs": ttl.as_secs() }))
}

pub fn cache_delete(state: &State, key: &str) -> Value {
    state.cache.delete(key);
    json!({ "deleted": key })
}

pub fn cache_invalidate(state: &State, prefix: &str) -> Value {
    json!({ "prefix": prefix, "removed": state.cache.invalidate_prefix(prefix) })
}

pub fn cache_clear(state: &State) -> Value {
    state.cache.clear();
    json!({ "cleared": true })
}

pub fn cache_sweep(state: &State) -> Value {
    json!({ "purged": state.cache.purge_expired() })
}

/// Run the periodic sweeper until Ctrl-C.
pub async fn cache_watch(state: State) -> Result<Value> {
    let shutdown = CancellationToken::new();
    let sweeper = state.cache.start_sweeper(shutdown.clone());
    info!(
        "Sweeping every {:?}, press Ctrl-C to stop",
        state.cache.config().sweep_interval
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping sweeper");
    shutdown.cancel();
    sweeper.await?;

    Ok(json!(state.cache.stats()))
}

// === Rate limits ===

pub fn limit_check(
    state: &State,
    identifier: &str,
    action: &str,
    override_policy: Option<(u32, u64)>,
) -> Result<Value> {
    let decision = match override_policy {
        Some((max, window_secs)) => {
            let policy = RateLimitPolicy::new(max, Duration::from_secs(window_secs));
            state.security.check(identifier, action, &policy)?
        }
        None => state.security.check_action(identifier, action)?,
    };
    Ok(json!({
        "identifier": identifier,
        "action": action,
        "decision": decision,
    }))
}

pub fn limit_reset(state: &State, identifier: &str, action: &str) -> Result<Value> {
    let removed = state.security.reset(identifier, action)?;
    Ok(json!({ "identifier": identifier, "action": action, "removed": removed }))
}

pub fn limit_show(state: &State, identifier: &str, action: &str) -> Result<Value> {
    Ok(json!({
        "counter": state.security.counter(identifier, action)?,
        "risk_level": state.security.risk_level(identifier)?,
    }))
}

pub fn audit(state: &State, limit: usize) -> Result<Value> {
    Ok(json!(state.security.recent_audit_events(limit)?))
}

// === Offline queue ===

pub fn offline_list(state: &State) -> Value {
    json!(state.offline.pending_actions())
}

pub fn offline_queue(state: &State, action_type: &str, raw: &str) -> Result<Value> {
    let data = parse_json(raw)?;
    let id = state.offline.queue_action(action_type, data);
    Ok(json!({ "id": id, "pending": state.offline.pending_count() }))
}

pub fn offline_clear(state: &State) -> Value {
    json!({ "cleared": state.offline.clear() })
}

// === Misc ===

pub fn reference(raw: &str) -> Result<Value> {
    let parsed = ParsedReference::parse(raw);
    if !parsed.is_known() {
        return Err(anyhow!("unrecognized payment reference '{}'", raw));
    }
    Ok(json!(parsed))
}

pub fn usage(state: &State) -> Result<Value> {
    Ok(json!(state.store.usage()?))
}
