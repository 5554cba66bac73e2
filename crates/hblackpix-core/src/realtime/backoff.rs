//! Reconnect backoff for realtime channels.
//!
//! Delay for reconnect attempt `n` (0-indexed) is `base_delay * 2^n`, capped at
//! `max_delay`, with optional jitter.

use crate::config::RealtimeDefaults;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for channel reconnects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Reconnect attempts before the channel is abandoned.
    pub max_attempts: u32,
    /// Delay before the first reconnect.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Exponential base (2.0 for doubling).
    pub exponential_base: f64,
    /// Whether to spread delays with random jitter.
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: RealtimeDefaults::MAX_RECONNECT_ATTEMPTS,
            base_delay: RealtimeDefaults::RECONNECT_BASE_DELAY,
            max_delay: RealtimeDefaults::RECONNECT_MAX_DELAY,
            exponential_base: 2.0,
            jitter: false,
        }
    }
}

impl BackoffConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before reconnect attempt `attempt` (0-indexed).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let multiplier = self.exponential_base.powi(exponent);
        let max_secs = self.max_delay.as_secs_f64();
        let capped_secs = (self.base_delay.as_secs_f64() * multiplier).min(max_secs);

        let final_secs = if self.jitter {
            // Factor in 0.5..1.5 keeps the mean and never collapses to zero
            let jitter_factor = rand::rng().random_range(0.5..1.5);
            (capped_secs * jitter_factor).min(max_secs)
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs.max(0.0))
    }

    /// Whether another reconnect is allowed after `attempts` failed ones.
    pub fn can_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
