//! Realtime change subscriptions.
//!
//! [`RealtimeManager`] keeps at most one channel per name, throttles each
//! channel's callback on the trailing edge, and reconnects broken channels with
//! exponential backoff before abandoning them.

mod backoff;
mod feed;
mod manager;
mod throttle;

pub use backoff::BackoffConfig;
pub use feed::{
    ChangeEventKind, ChangeFeed, ChangePayload, ChannelSpec, FeedMessage, InMemoryChangeFeed,
    RowFilter,
};
pub use manager::{
    ChangeCallback, ChannelStatus, RealtimeConfig, RealtimeEvent, RealtimeManager,
    SubscribeOptions,
};
pub use throttle::Throttle;
