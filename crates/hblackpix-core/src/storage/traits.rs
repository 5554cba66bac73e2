//! Key/value storage trait and types.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Usage information for one namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceUsage {
    /// Namespace name.
    pub namespace: String,
    /// Number of keys in this namespace.
    pub entry_count: usize,
    /// Total size of all values in bytes.
    pub total_size_bytes: u64,
    /// When the namespace was last written.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Usage across all namespaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageUsage {
    pub total_entries: usize,
    pub total_size_bytes: u64,
    /// Byte quota, if the store enforces one.
    pub quota_bytes: Option<u64>,
    pub namespaces: Vec<NamespaceUsage>,
}

/// Synchronous, string-only, namespaced key/value storage.
///
/// This mirrors the browser's Web Storage contract: values are strings, writes
/// may fail when a quota is exceeded, and every caller is expected to handle
/// that failure instead of assuming durability.
pub trait KeyValueStore: Send + Sync {
    /// Read a value. `None` if the key is absent.
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any existing one.
    ///
    /// Returns [`CoreError::QuotaExceeded`](crate::CoreError::QuotaExceeded)
    /// if the write would push the store past its quota.
    fn set(&self, namespace: &str, key: &str, value: &str) -> Result<()>;

    /// Remove a key. Returns whether it existed.
    fn remove(&self, namespace: &str, key: &str) -> Result<bool>;

    /// All keys in a namespace, in no particular order.
    fn keys(&self, namespace: &str) -> Result<Vec<String>>;

    /// Remove every key in a namespace. Returns the number removed.
    fn clear(&self, namespace: &str) -> Result<usize>;

    /// Usage statistics.
    fn usage(&self) -> Result<StorageUsage>;
}
