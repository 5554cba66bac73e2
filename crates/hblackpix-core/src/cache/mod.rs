//! TTL cache with an in-memory tier mirrored to persistent storage.
//!
//! Entries are opaque JSON values keyed by caller-built strings. The manager
//! counts hits and misses, bounds the memory tier, and sweeps expired entries
//! on a fixed interval.

mod manager;
mod types;

pub use manager::CacheManager;
pub use types::{CacheConfig, CacheEntry, CacheStats};
