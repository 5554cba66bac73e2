//! Test store whose writes and removes can be switched to fail.

use super::memory::MemoryStore;
use super::traits::{KeyValueStore, StorageUsage};
use crate::error::{CoreError, Result};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    fail_writes: AtomicBool,
    fail_removes: AtomicBool,
}

impl FlakyStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    fn locked(flag: &AtomicBool) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(CoreError::Database {
                message: "database is locked".to_string(),
                source: None,
            });
        }
        Ok(())
    }
}

impl KeyValueStore for FlakyStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        self.inner.get(namespace, key)
    }

    fn set(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        Self::locked(&self.fail_writes)?;
        self.inner.set(namespace, key, value)
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<bool> {
        Self::locked(&self.fail_removes)?;
        self.inner.remove(namespace, key)
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        self.inner.keys(namespace)
    }

    fn clear(&self, namespace: &str) -> Result<usize> {
        Self::locked(&self.fail_removes)?;
        self.inner.clear(namespace)
    }

    fn usage(&self) -> Result<StorageUsage> {
        self.inner.usage()
    }
}
