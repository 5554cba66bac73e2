//! Client-side rate limiter persisted in key/value storage.

use super::counter::{RateLimitCounter, RateLimitDecision};
use super::policy::RateLimitPolicy;
use crate::clock::{Clock, SystemClock};
use crate::config::RateLimitDefaults;
use crate::error::{CoreError, Result};
use crate::storage::KeyValueStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// Persistence for rate-limit counters.
pub trait CounterStore: Send + Sync {
    fn load(&self, identifier: &str, action: &str) -> Result<Option<RateLimitCounter>>;
    fn save(&self, counter: &RateLimitCounter) -> Result<()>;
    fn delete(&self, identifier: &str, action: &str) -> Result<()>;
}

/// Counters stored as JSON under `{action}:{identifier}`.
pub struct KeyValueCounterStore {
    store: Arc<dyn KeyValueStore>,
    namespace: String,
}

impl KeyValueCounterStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            namespace: RateLimitDefaults::NAMESPACE.to_string(),
        }
    }

    fn key(identifier: &str, action: &str) -> String {
        format!("{}:{}", action, identifier)
    }
}

impl CounterStore for KeyValueCounterStore {
    fn load(&self, identifier: &str, action: &str) -> Result<Option<RateLimitCounter>> {
        let Some(raw) = self.store.get(&self.namespace, &Self::key(identifier, action))? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    fn save(&self, counter: &RateLimitCounter) -> Result<()> {
        let raw = serde_json::to_string(counter)?;
        self.store.set(
            &self.namespace,
            &Self::key(&counter.identifier, &counter.action),
            &raw,
        )
    }

    fn delete(&self, identifier: &str, action: &str) -> Result<()> {
        self.store
            .remove(&self.namespace, &Self::key(identifier, action))
            .map(|_| ())
    }
}

type CounterKey = (String, String);

/// Fixed-window limiter keyed by `(identifier, action)`.
///
/// Counters are written through to the [`CounterStore`] when one is
/// configured, and read back from it so separate instances sharing a store see
/// each other's attempts. If the store fails the limiter keeps counting in
/// memory, and a stale stored copy never replaces a counter that is ahead.
pub struct RateLimiter {
    counters: Mutex<HashMap<CounterKey, RateLimitCounter>>,
    store: Option<Arc<dyn CounterStore>>,
    clock: Arc<dyn Clock>,
    storage_degraded: AtomicBool,
}

impl RateLimiter {
    /// Memory-only limiter.
    pub fn new() -> Self {
        Self::build(None, Arc::new(SystemClock))
    }

    /// Limiter persisted in `store` under the `rate_limit` namespace.
    pub fn with_store(store: Arc<dyn KeyValueStore>) -> Self {
        Self::build(
            Some(Arc::new(KeyValueCounterStore::new(store))),
            Arc::new(SystemClock),
        )
    }

    pub fn build(store: Option<Arc<dyn CounterStore>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            store,
            clock,
            storage_degraded: AtomicBool::new(false),
        }
    }

    fn counters(&self) -> MutexGuard<'_, HashMap<CounterKey, RateLimitCounter>> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn storage_failed(&self, operation: &str, err: &CoreError) {
        if self.storage_degraded.swap(true, Ordering::Relaxed) {
            debug!("Rate-limit storage {} failed: {}", operation, err);
        } else {
            warn!(
                "Rate-limit storage {} failed, counting in memory: {}",
                operation, err
            );
        }
    }

    /// `true` if the attempt is allowed.
    pub fn check_rate_limit(
        &self,
        identifier: &str,
        action: &str,
        max_attempts: u32,
        window: Duration,
    ) -> bool {
        self.check(identifier, action, &RateLimitPolicy::new(max_attempts, window))
            .allowed
    }

    /// Count one attempt under `policy`.
    pub fn check(
        &self,
        identifier: &str,
        action: &str,
        policy: &RateLimitPolicy,
    ) -> RateLimitDecision {
        let now = self.clock.now();
        let key = (identifier.to_string(), action.to_string());

        // Held across load/save so concurrent checks in this process serialize
        let mut counters = self.counters();

        let stored = self.store.as_ref().and_then(|store| {
            store
                .load(identifier, action)
                .unwrap_or_else(|e| {
                    self.storage_failed("read", &e);
                    None
                })
        });
        let mut counter = most_advanced(stored, counters.get(&key).cloned())
            .unwrap_or_else(|| RateLimitCounter::new(identifier, action, now));

        let decision = counter.register_attempt(policy, now);

        if let Some(store) = &self.store {
            if let Err(e) = store.save(&counter) {
                self.storage_failed("write", &e);
            }
        }
        counters.insert(key, counter);

        if decision.newly_blocked {
            warn!(
                "Rate limit exceeded for '{}' on '{}': blocked for {:?}",
                identifier, action, policy.block_duration
            );
        } else if !decision.allowed {
            debug!("Rate limit refused '{}' on '{}'", identifier, action);
        }
        decision
    }

    /// Forget the counter, e.g. after a successful login.
    pub fn reset(&self, identifier: &str, action: &str) {
        self.counters()
            .remove(&(identifier.to_string(), action.to_string()));
        if let Some(store) = &self.store {
            if let Err(e) = store.delete(identifier, action) {
                self.storage_failed("delete", &e);
            }
        }
    }

    /// Current counter without counting an attempt.
    pub fn counter(&self, identifier: &str, action: &str) -> Option<RateLimitCounter> {
        let counters = self.counters();
        let stored = self
            .store
            .as_ref()
            .and_then(|store| store.load(identifier, action).ok().flatten());
        let memory = counters
            .get(&(identifier.to_string(), action.to_string()))
            .cloned();
        most_advanced(stored, memory)
    }
}

/// Pick whichever copy of a counter has seen more.
///
/// A failed save leaves storage behind memory, while another instance sharing
/// the store can leave memory behind storage. The newer window wins, then the
/// higher attempt count.
fn most_advanced(
    stored: Option<RateLimitCounter>,
    memory: Option<RateLimitCounter>,
) -> Option<RateLimitCounter> {
    match (stored, memory) {
        (Some(stored), Some(memory)) => {
            if (memory.window_start, memory.attempts) > (stored.window_start, stored.attempts) {
                Some(memory)
            } else {
                Some(stored)
            }
        }
        (stored, memory) => stored.or(memory),
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
