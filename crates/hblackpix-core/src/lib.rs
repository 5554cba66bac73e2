//! HBLACKPIX Core - client-side caching, realtime invalidation and rate limiting.
//!
//! The services here sit between the billing UI and the hosted backend:
//!
//! - [`CacheManager`]: TTL cache mirrored to persistent storage
//! - [`RealtimeManager`]: throttled row-change subscriptions with reconnects
//! - [`RateLimiter`] / [`SecurityService`]: fixed-window attempt limits
//! - [`PerformanceMonitor`]: metrics with threshold alerts
//! - [`OfflineSync`]: queued mutations replayed on reconnect
//!
//! A [`Runtime`] owns one of each and their background tasks.
//!
//! # Example
//!
//! ```rust,ignore
//! use hblackpix_core::{Runtime, RuntimeConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> hblackpix_core::Result<()> {
//!     let runtime = Runtime::init(RuntimeConfig::default()).await?;
//!     runtime.bind_invalidation("invoices", "stats_")?;
//!
//!     let stats = runtime
//!         .fetch_cached("stats_user1_false", Some(Duration::from_secs(120)), "dashboard_stats", || async {
//!             fetch_dashboard_stats().await
//!         })
//!         .await?;
//!     println!("{}", stats);
//!
//!     runtime.dispose().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod error;
pub mod monitor;
pub mod offline;
pub mod rate_limit;
pub mod realtime;
pub mod reference;
pub mod storage;

mod runtime;

// Re-export commonly used types
pub use cache::{CacheConfig, CacheEntry, CacheManager, CacheStats};
pub use cancel::CancellationToken;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RuntimeConfig;
pub use error::{CoreError, Result};
pub use monitor::{MonitorConfig, PerformanceAlert, PerformanceMonitor};
pub use offline::{
    ActionHandler, ActionHandlers, ConnectivityMonitor, OfflineAction, OfflineConfig, OfflineSync,
};
pub use rate_limit::{RateLimitPolicy, RateLimiter, SecurityConfig, SecurityService};
pub use realtime::{ChangeFeed, ChangePayload, InMemoryChangeFeed, RealtimeConfig, RealtimeManager};
pub use reference::ParsedReference;
pub use runtime::{Runtime, RuntimeBuilder};
pub use storage::{KeyValueStore, MemoryStore, SqliteStore};
