//! Offline mutation queue with replay on reconnect.
//!
//! [`ConnectivityMonitor`] publishes online/offline transitions and
//! [`OfflineSync`] replays queued actions through registered
//! [`ActionHandler`]s when the network comes back.

mod connectivity;
mod queue;

pub use connectivity::{ConnectivityMonitor, ConnectivityState};
pub use queue::{
    handler_fn, ActionHandler, ActionHandlers, FnHandler, OfflineAction, OfflineConfig,
    OfflineEvent, OfflineSync, SyncReport,
};
