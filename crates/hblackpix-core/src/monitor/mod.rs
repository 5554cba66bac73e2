//! Performance metrics and threshold alerts.

mod performance;
mod thresholds;

pub use performance::{
    MetricStats, MonitorConfig, PerformanceAlert, PerformanceMetric, PerformanceMonitor,
};
pub use thresholds::{AlertSeverity, Threshold, ThresholdTable};
