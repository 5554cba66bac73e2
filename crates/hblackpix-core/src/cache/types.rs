//! Cache configuration, entry and statistics types.

use crate::clock::elapsed_between;
use crate::config::CacheDefaults;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Configuration for cache behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL used when `set` is called without one.
    pub default_ttl: Duration,
    /// Maximum number of in-memory entries before the oldest is evicted.
    pub max_entries: usize,
    /// Interval of the background expiry sweep.
    pub sweep_interval: Duration,
    /// Storage namespace for mirrored entries.
    pub namespace: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: CacheDefaults::DEFAULT_TTL,
            max_entries: CacheDefaults::MAX_ENTRIES,
            sweep_interval: CacheDefaults::SWEEP_INTERVAL,
            namespace: CacheDefaults::NAMESPACE.to_string(),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// A cached value with its bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub data: Value,
    pub stored_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl CacheEntry {
    /// An entry is valid iff `now - stored_at <= ttl`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        elapsed_between(self.stored_at, now) <= self.ttl
    }
}

/// On-disk shape of an entry.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct PersistedEntry {
    pub data: Value,
    pub stored_at: DateTime<Utc>,
    pub ttl_ms: u64,
}

impl From<&CacheEntry> for PersistedEntry {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            data: entry.data.clone(),
            stored_at: entry.stored_at,
            ttl_ms: entry.ttl.as_millis().min(u64::MAX as u128) as u64,
        }
    }
}

impl From<PersistedEntry> for CacheEntry {
    fn from(persisted: PersistedEntry) -> Self {
        Self {
            data: persisted.data,
            stored_at: persisted.stored_at,
            ttl: Duration::from_millis(persisted.ttl_ms),
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses) * 100`, or 0 before the first read.
    pub hit_rate: f64,
    pub memory_entries: usize,
    pub persisted_entries: usize,
    pub evictions: u64,
}

impl CacheStats {
    pub(crate) fn hit_rate_percent(hits: u64, misses: u64) -> f64 {
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64 * 100.0
        }
    }
}
