//! In-process key/value store with an optional byte quota.

use super::traits::{KeyValueStore, NamespaceUsage, StorageUsage};
use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Namespace {
    values: HashMap<String, String>,
    last_modified: Option<DateTime<Utc>>,
}

/// Volatile store. A quota of `Some(0)` makes every write fail, which is how
/// tests exercise the degrade-to-memory paths of the services.
#[derive(Default)]
pub struct MemoryStore {
    namespaces: Mutex<BTreeMap<String, Namespace>>,
    quota_bytes: Option<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            namespaces: Mutex::default(),
            quota_bytes: Some(quota_bytes),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Namespace>> {
        self.namespaces.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn used_bytes(namespaces: &BTreeMap<String, Namespace>) -> u64 {
    namespaces
        .values()
        .flat_map(|ns| ns.values.values())
        .map(|v| v.len() as u64)
        .sum()
}

impl KeyValueStore for MemoryStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .lock()
            .get(namespace)
            .and_then(|ns| ns.values.get(key).cloned()))
    }

    fn set(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        let mut namespaces = self.lock();

        if let Some(quota) = self.quota_bytes {
            let existing = namespaces
                .get(namespace)
                .and_then(|ns| ns.values.get(key))
                .map(|v| v.len() as u64)
                .unwrap_or(0);
            let used = used_bytes(&namespaces) - existing;
            let needed = value.len() as u64;
            if used + needed > quota {
                return Err(CoreError::QuotaExceeded {
                    namespace: namespace.to_string(),
                    needed,
                    available: quota.saturating_sub(used),
                });
            }
        }

        let ns = namespaces.entry(namespace.to_string()).or_default();
        ns.values.insert(key.to_string(), value.to_string());
        ns.last_modified = Some(Utc::now());
        Ok(())
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<bool> {
        let mut namespaces = self.lock();
        let Some(ns) = namespaces.get_mut(namespace) else {
            return Ok(false);
        };
        let removed = ns.values.remove(key).is_some();
        if removed {
            ns.last_modified = Some(Utc::now());
        }
        Ok(removed)
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .get(namespace)
            .map(|ns| ns.values.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn clear(&self, namespace: &str) -> Result<usize> {
        Ok(self
            .lock()
            .remove(namespace)
            .map(|ns| ns.values.len())
            .unwrap_or(0))
    }

    fn usage(&self) -> Result<StorageUsage> {
        let namespaces = self.lock();
        let per_namespace: Vec<NamespaceUsage> = namespaces
            .iter()
            .map(|(name, ns)| NamespaceUsage {
                namespace: name.clone(),
                entry_count: ns.values.len(),
                total_size_bytes: ns.values.values().map(|v| v.len() as u64).sum(),
                last_modified: ns.last_modified,
            })
            .collect();

        Ok(StorageUsage {
            total_entries: per_namespace.iter().map(|ns| ns.entry_count).sum(),
            total_size_bytes: used_bytes(&namespaces),
            quota_bytes: self.quota_bytes,
            namespaces: per_namespace,
        })
    }
}
