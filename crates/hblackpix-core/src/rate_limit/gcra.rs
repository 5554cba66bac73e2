//! GCRA limiter for callers that need a strict bound.
//!
//! The fixed-window counter can admit up to twice its maximum across a window
//! boundary. This limiter allows a burst of `max_attempts` and then refills
//! one attempt per full window, so no interval of one window ever admits more
//! than `max_attempts`. The price is a lower sustained rate: once the burst is
//! spent, attempts come back one per window. State is in memory only.

use super::counter::RateLimitDecision;
use super::policy::RateLimitPolicy;
use crate::error::{CoreError, Result};
use governor::clock::{Clock as _, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use tracing::debug;

/// Keyed GCRA limiter for one policy.
pub struct GcraLimiter {
    limiter: DefaultKeyedRateLimiter<String>,
    clock: DefaultClock,
    policy: RateLimitPolicy,
}

impl GcraLimiter {
    pub fn new(policy: RateLimitPolicy) -> Result<Self> {
        let invalid = |message: &str| CoreError::Validation {
            field: "policy".to_string(),
            message: message.to_string(),
        };

        let burst = NonZeroU32::new(policy.max_attempts)
            .ok_or_else(|| invalid("max_attempts must be at least 1"))?;
        let quota = Quota::with_period(policy.window)
            .ok_or_else(|| invalid("window must be longer than zero"))?
            .allow_burst(burst);

        Ok(Self {
            limiter: RateLimiter::keyed(quota),
            clock: DefaultClock::default(),
            policy,
        })
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Count one attempt. `attempts` and `remaining` are not tracked by GCRA
    /// and are reported as 0.
    pub fn check(&self, identifier: &str, action: &str) -> RateLimitDecision {
        let key = format!("{}:{}", action, identifier);
        match self.limiter.check_key(&key) {
            Ok(()) => RateLimitDecision {
                allowed: true,
                attempts: 0,
                remaining: 0,
                retry_after: None,
                newly_blocked: false,
            },
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.clock.now());
                debug!("GCRA refused '{}' on '{}', retry in {:?}", identifier, action, wait);
                RateLimitDecision {
                    allowed: false,
                    attempts: 0,
                    remaining: 0,
                    retry_after: Some(wait),
                    newly_blocked: false,
                }
            }
        }
    }

    /// Drop state for keys that are back to a full burst.
    pub fn shrink(&self) {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.limiter.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiter.is_empty()
    }
}
