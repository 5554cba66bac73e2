//! Persistent key/value storage shared by the cache, the client-side rate
//! limiter and the offline queue.
//!
//! All three use one store with namespace isolation, the way a browser app
//! shares a single origin's Web Storage between features.

#[cfg(test)]
pub(crate) mod flaky;
mod memory;
pub(crate) mod sqlite;
mod traits;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{KeyValueStore, NamespaceUsage, StorageUsage};
