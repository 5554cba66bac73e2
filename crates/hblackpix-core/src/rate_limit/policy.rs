//! Rate-limit policies and the presets for the known call sites.

use crate::config::RateLimitDefaults;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How many attempts a window admits and how long a violator stays blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub max_attempts: u32,
    pub window: Duration,
    pub block_duration: Duration,
}

impl RateLimitPolicy {
    /// Policy whose block lasts one window.
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            block_duration: window,
        }
    }

    pub fn with_block_duration(mut self, block_duration: Duration) -> Self {
        self.block_duration = block_duration;
        self
    }

    /// 5 attempts per 15 minutes.
    pub fn login() -> Self {
        Self::new(
            RateLimitDefaults::LOGIN_MAX_ATTEMPTS,
            RateLimitDefaults::LOGIN_WINDOW,
        )
    }

    /// 3 attempts per hour.
    pub fn signup() -> Self {
        Self::new(
            RateLimitDefaults::SIGNUP_MAX_ATTEMPTS,
            RateLimitDefaults::SIGNUP_WINDOW,
        )
    }

    /// 20 notifications per minute.
    pub fn notification() -> Self {
        Self::new(
            RateLimitDefaults::NOTIFICATION_MAX_ATTEMPTS,
            RateLimitDefaults::NOTIFICATION_WINDOW,
        )
    }

    /// Preset by action name.
    pub fn preset(action: &str) -> Option<Self> {
        match action {
            "login" => Some(Self::login()),
            "signup" => Some(Self::signup()),
            "notification" | "create_notification" => Some(Self::notification()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        assert_eq!(RateLimitPolicy::login().max_attempts, 5);
        assert_eq!(RateLimitPolicy::login().window, Duration::from_secs(900));
        assert_eq!(RateLimitPolicy::signup().window, Duration::from_secs(3600));
        assert_eq!(RateLimitPolicy::preset("notification"), Some(RateLimitPolicy::notification()));
        assert_eq!(RateLimitPolicy::preset("delete_account"), None);
    }

    #[test]
    fn test_block_defaults_to_window() {
        let policy = RateLimitPolicy::new(2, Duration::from_secs(10));
        assert_eq!(policy.block_duration, Duration::from_secs(10));
        let policy = policy.with_block_duration(Duration::from_secs(60));
        assert_eq!(policy.block_duration, Duration::from_secs(60));
    }
}
