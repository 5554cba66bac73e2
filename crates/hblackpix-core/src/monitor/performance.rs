//! Rolling metric buffer with threshold alerts.

use super::thresholds::{AlertSeverity, ThresholdTable};
use crate::clock::{add_duration, Clock, SystemClock};
use crate::config::MonitorDefaults;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Configuration for [`PerformanceMonitor`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Metrics kept before the oldest is dropped.
    pub max_metrics: usize,
    /// Alerts kept before the oldest is dropped.
    pub max_alerts: usize,
    /// Span aggregated by [`PerformanceMonitor::stats`].
    pub stats_window: Duration,
    pub alert_capacity: usize,
    pub thresholds: ThresholdTable,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_metrics: MonitorDefaults::MAX_METRICS,
            max_alerts: MonitorDefaults::MAX_ALERTS,
            stats_window: MonitorDefaults::STATS_WINDOW,
            alert_capacity: MonitorDefaults::ALERT_CHANNEL_CAPACITY,
            thresholds: ThresholdTable::default(),
        }
    }
}

impl MonitorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_metrics(mut self, max: usize) -> Self {
        self.max_metrics = max;
        self
    }

    pub fn with_thresholds(mut self, thresholds: ThresholdTable) -> Self {
        self.thresholds = thresholds;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceAlert {
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub severity: AlertSeverity,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate over the stats window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

impl MetricStats {
    fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let sum: f64 = values.iter().sum();
        Some(Self {
            avg: sum / values.len() as f64,
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            count: values.len(),
        })
    }
}

/// Records named measurements and raises alerts on threshold crossings.
pub struct PerformanceMonitor {
    metrics: Mutex<VecDeque<PerformanceMetric>>,
    alerts: Mutex<VecDeque<PerformanceAlert>>,
    alert_tx: broadcast::Sender<PerformanceAlert>,
    clock: Arc<dyn Clock>,
    config: MonitorConfig,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: MonitorConfig, clock: Arc<dyn Clock>) -> Self {
        let (alert_tx, _) = broadcast::channel(config.alert_capacity.max(1));
        Self {
            metrics: Mutex::new(VecDeque::new()),
            alerts: Mutex::new(VecDeque::new()),
            alert_tx,
            clock,
            config,
        }
    }

    /// Append a measurement and check it against its threshold.
    ///
    /// Returns the alert raised, if any.
    pub fn record_metric(
        &self,
        name: &str,
        value: f64,
        metadata: Option<Value>,
    ) -> Option<PerformanceAlert> {
        let now = self.clock.now();

        {
            let mut metrics = lock(&self.metrics);
            metrics.push_back(PerformanceMetric {
                name: name.to_string(),
                value,
                timestamp: now,
                metadata,
            });
            while metrics.len() > self.config.max_metrics {
                metrics.pop_front();
            }
        }

        let (severity, threshold) = self.config.thresholds.lookup(name)?.evaluate(value)?;
        let alert = PerformanceAlert {
            metric: name.to_string(),
            value,
            threshold,
            severity,
            timestamp: now,
        };

        warn!(
            "Performance {:?}: {} = {:.2} (threshold {:.2})",
            severity, name, value, threshold
        );

        {
            let mut alerts = lock(&self.alerts);
            alerts.push_back(alert.clone());
            while alerts.len() > self.config.max_alerts {
                alerts.pop_front();
            }
        }
        // No subscribers is fine
        let _ = self.alert_tx.send(alert.clone());
        Some(alert)
    }

    /// Time `call`, record it as `api_{name}` or `api_{name}_error`, and
    /// return its result untouched.
    pub async fn measure_api_call<F, T, E>(&self, name: &str, call: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let start = tokio::time::Instant::now();
        let result = call.await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        match &result {
            Ok(_) => {
                self.record_metric(&format!("api_{}", name), elapsed_ms, None);
            }
            Err(e) => {
                debug!("API call '{}' failed after {:.1}ms: {}", name, elapsed_ms, e);
                self.record_metric(
                    &format!("api_{}_error", name),
                    elapsed_ms,
                    Some(json!({ "error": e.to_string() })),
                );
            }
        }
        result
    }

    /// Per-name aggregates over the last stats window.
    pub fn stats(&self) -> BTreeMap<String, MetricStats> {
        let now = self.clock.now();
        let mut grouped: BTreeMap<String, Vec<f64>> = BTreeMap::new();

        for metric in lock(&self.metrics).iter() {
            if add_duration(metric.timestamp, self.config.stats_window) >= now {
                grouped.entry(metric.name.clone()).or_default().push(metric.value);
            }
        }

        grouped
            .into_iter()
            .filter_map(|(name, values)| MetricStats::from_values(&values).map(|s| (name, s)))
            .collect()
    }

    /// Aggregate for one name over the last stats window.
    pub fn metric_stats(&self, name: &str) -> Option<MetricStats> {
        self.stats().remove(name)
    }

    /// All retained metrics, oldest first.
    pub fn metrics(&self) -> Vec<PerformanceMetric> {
        lock(&self.metrics).iter().cloned().collect()
    }

    /// Retained alerts, oldest first.
    pub fn alerts(&self) -> Vec<PerformanceAlert> {
        lock(&self.alerts).iter().cloned().collect()
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<PerformanceAlert> {
        self.alert_tx.subscribe()
    }

    pub fn clear(&self) {
        lock(&self.metrics).clear();
        lock(&self.alerts).clear();
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}
