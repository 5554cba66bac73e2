//! Centralized configuration for the client infrastructure layer.
//!
//! Constant holders carry the defaults; each service has its own `*Config`
//! struct next to its implementation, and [`RuntimeConfig`] aggregates them.

use crate::cache::CacheConfig;
use crate::error::{CoreError, Result};
use crate::monitor::MonitorConfig;
use crate::offline::OfflineConfig;
use crate::rate_limit::SecurityConfig;
use crate::realtime::RealtimeConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Cache defaults.
pub struct CacheDefaults;

impl CacheDefaults {
    pub const NAMESPACE: &'static str = "cache";
    pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
    pub const MAX_ENTRIES: usize = 100;
    pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
}

/// Realtime subscription defaults.
pub struct RealtimeDefaults;

impl RealtimeDefaults {
    pub const THROTTLE_INTERVAL: Duration = Duration::from_millis(1000);
    pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
    pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
    pub const EVENT_CHANNEL_CAPACITY: usize = 64;
    pub const FEED_BUFFER: usize = 256;
}

/// Rate-limit presets for the known call sites.
pub struct RateLimitDefaults;

impl RateLimitDefaults {
    pub const NAMESPACE: &'static str = "rate_limit";

    pub const LOGIN_MAX_ATTEMPTS: u32 = 5;
    pub const LOGIN_WINDOW: Duration = Duration::from_secs(15 * 60);

    pub const SIGNUP_MAX_ATTEMPTS: u32 = 3;
    pub const SIGNUP_WINDOW: Duration = Duration::from_secs(60 * 60);

    pub const NOTIFICATION_MAX_ATTEMPTS: u32 = 20;
    pub const NOTIFICATION_WINDOW: Duration = Duration::from_secs(60);

    /// Blocks within [`ESCALATION_WINDOW`](Self::ESCALATION_WINDOW) before an
    /// identifier is flagged high risk.
    pub const ESCALATION_THRESHOLD: u32 = 3;
    pub const ESCALATION_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
}

/// Performance monitor defaults.
pub struct MonitorDefaults;

impl MonitorDefaults {
    pub const MAX_METRICS: usize = 1000;
    pub const MAX_ALERTS: usize = 100;
    pub const STATS_WINDOW: Duration = Duration::from_secs(60);
    pub const ALERT_CHANNEL_CAPACITY: usize = 64;
    /// Cache lookups needed before the hit rate is worth reporting.
    pub const MIN_HIT_RATE_SAMPLES: u64 = 20;
}

/// Offline replay defaults.
pub struct OfflineDefaults;

impl OfflineDefaults {
    pub const NAMESPACE: &'static str = "offline";
    pub const QUEUE_KEY: &'static str = "pending_actions";
    pub const MAX_RETRIES: u32 = 3;
    pub const EVENT_CHANNEL_CAPACITY: usize = 64;
}

/// Storage defaults.
pub struct StorageDefaults;

impl StorageDefaults {
    pub const DATA_DIR_NAME: &'static str = "hblackpix";
    pub const DB_FILE_NAME: &'static str = "state.sqlite";
    /// Same order of magnitude as a browser's per-origin Web Storage quota.
    pub const DEFAULT_QUOTA_BYTES: u64 = 5 * 1024 * 1024;
}

/// Aggregated configuration for a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub cache: CacheConfig,
    pub realtime: RealtimeConfig,
    pub security: SecurityConfig,
    pub monitor: MonitorConfig,
    pub offline: OfflineConfig,
}

impl RuntimeConfig {
    /// Load a configuration from a JSON file. Missing sections use defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents =
            std::fs::read_to_string(path).map_err(|e| CoreError::io_with_path(e, path))?;
        serde_json::from_str(&contents).map_err(|e| CoreError::Config {
            message: format!("Invalid config file {}: {}", path.display(), e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_reasonable() {
        assert!(CacheDefaults::SWEEP_INTERVAL > Duration::ZERO);
        assert!(RealtimeDefaults::RECONNECT_BASE_DELAY < RealtimeDefaults::RECONNECT_MAX_DELAY);
        assert_eq!(OfflineDefaults::MAX_RETRIES, 3);
        assert_eq!(RateLimitDefaults::LOGIN_WINDOW, Duration::from_millis(900_000));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "cache": { "max_entries": 7 } }"#).unwrap();

        let config = RuntimeConfig::from_json_file(&path).unwrap();
        assert_eq!(config.cache.max_entries, 7);
        assert_eq!(config.cache.default_ttl, CacheDefaults::DEFAULT_TTL);
        assert_eq!(config.offline.max_retries, OfflineDefaults::MAX_RETRIES);
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = RuntimeConfig::from_json_file(&path).unwrap_err();
        assert!(matches!(err, CoreError::Config { .. }));
    }
}
