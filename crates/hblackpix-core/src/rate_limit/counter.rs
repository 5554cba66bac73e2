//! Fixed-window attempt counter.

use super::policy::RateLimitPolicy;
use crate::clock::{add_duration, elapsed_between};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Attempts by one identifier on one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitCounter {
    pub identifier: String,
    pub action: String,
    pub window_start: DateTime<Utc>,
    pub attempts: u32,
    pub blocked_until: Option<DateTime<Utc>>,
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Attempts counted in the current window.
    pub attempts: u32,
    /// Attempts left before a block.
    pub remaining: u32,
    /// Time until the block lifts, when refused.
    pub retry_after: Option<Duration>,
    /// This check is the one that put the counter into a block.
    pub newly_blocked: bool,
}

impl RateLimitCounter {
    pub fn new(identifier: &str, action: &str, now: DateTime<Utc>) -> Self {
        Self {
            identifier: identifier.to_string(),
            action: action.to_string(),
            window_start: now,
            attempts: 0,
            blocked_until: None,
        }
    }

    pub fn is_blocked_at(&self, now: DateTime<Utc>) -> bool {
        self.blocked_until.is_some_and(|until| now < until)
    }

    /// Count one attempt at `now`.
    ///
    /// An active block refuses without counting. A block that has run out
    /// starts a fresh window, as does a window older than `policy.window`.
    pub fn register_attempt(
        &mut self,
        policy: &RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        if let Some(until) = self.blocked_until {
            if now < until {
                return RateLimitDecision {
                    allowed: false,
                    attempts: self.attempts,
                    remaining: 0,
                    retry_after: Some(elapsed_between(now, until)),
                    newly_blocked: false,
                };
            }
            self.reset_window(now);
        }

        if elapsed_between(self.window_start, now) > policy.window {
            self.reset_window(now);
        }

        self.attempts = self.attempts.saturating_add(1);

        if self.attempts > policy.max_attempts {
            let until = add_duration(now, policy.block_duration);
            self.blocked_until = Some(until);
            return RateLimitDecision {
                allowed: false,
                attempts: self.attempts,
                remaining: 0,
                retry_after: Some(policy.block_duration),
                newly_blocked: true,
            };
        }

        RateLimitDecision {
            allowed: true,
            attempts: self.attempts,
            remaining: policy.max_attempts - self.attempts,
            retry_after: None,
            newly_blocked: false,
        }
    }

    fn reset_window(&mut self, now: DateTime<Utc>) {
        self.window_start = now;
        self.attempts = 0;
        self.blocked_until = None;
    }
}
