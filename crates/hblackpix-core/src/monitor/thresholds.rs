//! Static alert thresholds.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// Warning and critical levels for one metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub warning: f64,
    pub critical: f64,
    /// Lower values are worse (e.g. hit rates).
    #[serde(default)]
    pub lower_is_worse: bool,
}

impl Threshold {
    pub const fn upper(warning: f64, critical: f64) -> Self {
        Self {
            warning,
            critical,
            lower_is_worse: false,
        }
    }

    pub const fn lower(warning: f64, critical: f64) -> Self {
        Self {
            warning,
            critical,
            lower_is_worse: true,
        }
    }

    /// Severity `value` crosses, if any.
    pub fn evaluate(&self, value: f64) -> Option<(AlertSeverity, f64)> {
        let crosses = |limit: f64| {
            if self.lower_is_worse {
                value <= limit
            } else {
                value >= limit
            }
        };

        if crosses(self.critical) {
            Some((AlertSeverity::Critical, self.critical))
        } else if crosses(self.warning) {
            Some((AlertSeverity::Warning, self.warning))
        } else {
            None
        }
    }
}

/// Metric name → threshold, with `api_*` latencies sharing one entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdTable {
    thresholds: HashMap<String, Threshold>,
}

impl ThresholdTable {
    pub const PAGE_LOAD_TIME: &'static str = "page_load_time";
    pub const API_RESPONSE_TIME: &'static str = "api_response_time";
    pub const RENDER_TIME: &'static str = "render_time";
    pub const MEMORY_USAGE: &'static str = "memory_usage";
    pub const CACHE_HIT_RATE: &'static str = "cache_hit_rate";
    pub const ERROR_RATE: &'static str = "error_rate";

    pub fn empty() -> Self {
        Self {
            thresholds: HashMap::new(),
        }
    }

    pub fn with(mut self, name: &str, threshold: Threshold) -> Self {
        self.thresholds.insert(name.to_string(), threshold);
        self
    }

    pub fn set(&mut self, name: &str, threshold: Threshold) {
        self.thresholds.insert(name.to_string(), threshold);
    }

    /// Threshold for a metric name.
    ///
    /// An exact entry wins. Otherwise `api_{name}` latencies use
    /// `api_response_time`; `api_{name}_error` latencies have no threshold.
    pub fn lookup(&self, metric: &str) -> Option<&Threshold> {
        if let Some(threshold) = self.thresholds.get(metric) {
            return Some(threshold);
        }
        if metric.starts_with("api_") && !metric.ends_with("_error") {
            return self.thresholds.get(Self::API_RESPONSE_TIME);
        }
        None
    }
}

impl Default for ThresholdTable {
    /// Times in milliseconds, usage and rates in percent.
    fn default() -> Self {
        Self::empty()
            .with(Self::PAGE_LOAD_TIME, Threshold::upper(3000.0, 5000.0))
            .with(Self::API_RESPONSE_TIME, Threshold::upper(1000.0, 3000.0))
            .with(Self::RENDER_TIME, Threshold::upper(16.0, 33.0))
            .with(Self::MEMORY_USAGE, Threshold::upper(80.0, 95.0))
            .with(Self::CACHE_HIT_RATE, Threshold::lower(70.0, 50.0))
            .with(Self::ERROR_RATE, Threshold::upper(5.0, 10.0))
    }
}
