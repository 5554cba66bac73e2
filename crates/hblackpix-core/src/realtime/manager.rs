//! Named realtime channels with throttled callbacks and auto-reconnect.

use super::backoff::BackoffConfig;
use super::feed::{ChangeEventKind, ChangeFeed, ChangePayload, ChannelSpec, FeedMessage, RowFilter};
use super::throttle::Throttle;
use crate::cancel::CancellationToken;
use crate::config::RealtimeDefaults;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Callback invoked with (throttled) row changes.
pub type ChangeCallback = Arc<dyn Fn(ChangePayload) + Send + Sync>;

/// Configuration for realtime channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Minimum spacing between callback invocations on one channel.
    pub throttle_interval: Duration,
    pub backoff: BackoffConfig,
    /// Capacity of the [`RealtimeEvent`] broadcast.
    pub event_capacity: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            throttle_interval: RealtimeDefaults::THROTTLE_INTERVAL,
            backoff: BackoffConfig::default(),
            event_capacity: RealtimeDefaults::EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl RealtimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_throttle_interval(mut self, interval: Duration) -> Self {
        self.throttle_interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Per-channel connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ChannelStatus {
    Connecting,
    Subscribed,
    /// Waiting before reconnect attempt `attempt` (1-based).
    Reconnecting { attempt: u32 },
    /// Gave up after exhausting reconnect attempts.
    Abandoned,
    Unsubscribed,
}

impl ChannelStatus {
    pub fn is_active(self) -> bool {
        !matches!(self, ChannelStatus::Abandoned | ChannelStatus::Unsubscribed)
    }
}

/// Lifecycle notifications for observers.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    StatusChanged {
        channel: String,
        status: ChannelStatus,
    },
    ChannelAbandoned {
        channel: String,
        table: String,
        attempts: u32,
        last_error: String,
    },
}

/// Options for [`RealtimeManager::subscribe`].
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub event: ChangeEventKind,
    /// Row filter in `column=eq.value` form.
    pub filter: Option<String>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event(mut self, event: ChangeEventKind) -> Self {
        self.event = event;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

struct ChannelHandle {
    table: String,
    status: Arc<Mutex<ChannelStatus>>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ChannelHandle {
    fn status(&self) -> ChannelStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop(self) {
        self.token.cancel();
        self.task.abort();
    }
}

/// Everything a channel task needs, detached from the manager.
struct ChannelContext {
    name: String,
    spec: ChannelSpec,
    feed: Arc<dyn ChangeFeed>,
    callback: ChangeCallback,
    throttle_interval: Duration,
    backoff: BackoffConfig,
    status: Arc<Mutex<ChannelStatus>>,
    events: broadcast::Sender<RealtimeEvent>,
    token: CancellationToken,
}

impl ChannelContext {
    fn set_status(&self, status: ChannelStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
        // No subscribers is fine
        let _ = self.events.send(RealtimeEvent::StatusChanged {
            channel: self.name.clone(),
            status,
        });
    }
}

/// Registry of named change subscriptions. At most one channel per name.
pub struct RealtimeManager {
    feed: Arc<dyn ChangeFeed>,
    config: RealtimeConfig,
    channels: Mutex<HashMap<String, ChannelHandle>>,
    events: broadcast::Sender<RealtimeEvent>,
}

impl RealtimeManager {
    pub fn new(feed: Arc<dyn ChangeFeed>, config: RealtimeConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            feed,
            config,
            channels: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, ChannelHandle>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Listen for changes on `table` under `channel_name`.
    ///
    /// Replaces any existing channel with the same name. `callback` is wrapped
    /// in a trailing-edge throttle. Fails only on a malformed row filter.
    pub fn subscribe(
        &self,
        channel_name: &str,
        table: &str,
        callback: ChangeCallback,
        options: SubscribeOptions,
    ) -> Result<()> {
        let filter = options.filter.as_deref().map(RowFilter::parse).transpose()?;
        let spec = ChannelSpec {
            table: table.to_string(),
            event: options.event,
            filter,
        };

        let status = Arc::new(Mutex::new(ChannelStatus::Connecting));
        let token = CancellationToken::new();
        let ctx = ChannelContext {
            name: channel_name.to_string(),
            spec,
            feed: Arc::clone(&self.feed),
            callback,
            throttle_interval: self.config.throttle_interval,
            backoff: self.config.backoff.clone(),
            status: Arc::clone(&status),
            events: self.events.clone(),
            token: token.clone(),
        };

        let mut channels = self.channels();
        if let Some(previous) = channels.remove(channel_name) {
            debug!("Replacing realtime channel '{}'", channel_name);
            previous.stop();
        }

        ctx.set_status(ChannelStatus::Connecting);
        let task = tokio::spawn(run_channel(ctx));
        channels.insert(
            channel_name.to_string(),
            ChannelHandle {
                table: table.to_string(),
                status,
                token,
                task,
            },
        );
        Ok(())
    }

    /// Tear down one channel. Returns whether it existed.
    pub fn unsubscribe(&self, channel_name: &str) -> bool {
        let Some(handle) = self.channels().remove(channel_name) else {
            return false;
        };
        handle.stop();
        let _ = self.events.send(RealtimeEvent::StatusChanged {
            channel: channel_name.to_string(),
            status: ChannelStatus::Unsubscribed,
        });
        debug!("Unsubscribed realtime channel '{}'", channel_name);
        true
    }

    /// Tear down every channel, e.g. on logout. Returns how many were removed.
    pub fn unsubscribe_all(&self) -> usize {
        let drained: Vec<(String, ChannelHandle)> = self.channels().drain().collect();
        let count = drained.len();
        for (name, handle) in drained {
            handle.stop();
            let _ = self.events.send(RealtimeEvent::StatusChanged {
                channel: name,
                status: ChannelStatus::Unsubscribed,
            });
        }
        if count > 0 {
            info!("Unsubscribed {} realtime channels", count);
        }
        count
    }

    /// Current status, or `None` for unknown names.
    pub fn status(&self, channel_name: &str) -> Option<ChannelStatus> {
        self.channels().get(channel_name).map(ChannelHandle::status)
    }

    /// Names of channels that have not been abandoned, sorted.
    pub fn active_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .channels()
            .iter()
            .filter(|(_, handle)| handle.status().is_active())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Table a channel listens on.
    pub fn channel_table(&self, channel_name: &str) -> Option<String> {
        self.channels().get(channel_name).map(|h| h.table.clone())
    }

    /// Subscribe to status changes and abandonment notices.
    pub fn events(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.events.subscribe()
    }
}

impl Drop for RealtimeManager {
    fn drop(&mut self) {
        for (_, handle) in self.channels().drain() {
            handle.stop();
        }
    }
}

async fn run_channel(ctx: ChannelContext) {
    let throttle = Throttle::new(ctx.throttle_interval, Arc::clone(&ctx.callback));
    let mut attempts: u32 = 0;

    loop {
        let opened = tokio::select! {
            _ = ctx.token.cancelled() => return,
            opened = ctx.feed.listen(&ctx.spec) => opened,
        };

        let failure = match opened {
            Ok(mut receiver) => {
                if attempts > 0 {
                    info!("Realtime channel '{}' reconnected after {} attempts", ctx.name, attempts);
                }
                attempts = 0;
                ctx.set_status(ChannelStatus::Subscribed);

                loop {
                    let message = tokio::select! {
                        _ = ctx.token.cancelled() => return,
                        message = receiver.recv() => message,
                    };
                    match message {
                        Some(FeedMessage::Change(payload)) => throttle.call(payload),
                        Some(FeedMessage::Error(message)) => break message,
                        None => break "change feed closed".to_string(),
                    }
                }
            }
            Err(e) => e.to_string(),
        };

        if !ctx.backoff.can_retry(attempts) {
            error!(
                "Realtime channel '{}' on '{}' abandoned after {} reconnect attempts: {}",
                ctx.name, ctx.spec.table, attempts, failure
            );
            ctx.set_status(ChannelStatus::Abandoned);
            let _ = ctx.events.send(RealtimeEvent::ChannelAbandoned {
                channel: ctx.name.clone(),
                table: ctx.spec.table.clone(),
                attempts,
                last_error: failure,
            });
            return;
        }

        let delay = ctx.backoff.calculate_delay(attempts);
        attempts += 1;
        warn!(
            "Realtime channel '{}' error: {}. Reconnect {}/{} in {:?}",
            ctx.name, failure, attempts, ctx.backoff.max_attempts, delay
        );
        ctx.set_status(ChannelStatus::Reconnecting { attempt: attempts });

        tokio::select! {
            _ = ctx.token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::InMemoryChangeFeed;
    use serde_json::json;

    async fn wait_for_status(manager: &RealtimeManager, channel: &str, status: ChannelStatus) {
        for _ in 0..1000 {
            if manager.status(channel) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("channel '{}' never reached {:?}", channel, status);
    }

    fn counting_callback() -> (Arc<Mutex<Vec<ChangePayload>>>, ChangeCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, Arc::new(move |p| sink.lock().unwrap().push(p)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_yields_one_callback_with_latest_payload() {
        let feed = Arc::new(InMemoryChangeFeed::new());
        let manager = RealtimeManager::new(feed.clone(), RealtimeConfig::default());
        let (seen, callback) = counting_callback();

        manager
            .subscribe("invoices-changes", "invoices", callback, SubscribeOptions::new())
            .unwrap();
        wait_for_status(&manager, "invoices-changes", ChannelStatus::Subscribed).await;

        for i in 1..=10 {
            feed.publish(
                ChangePayload::new("invoices", ChangeEventKind::Update).with_new(json!({"seq": i})),
            );
        }
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].new, Some(json!({"seq": 10})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_replaces_channel() {
        let feed = Arc::new(InMemoryChangeFeed::new());
        let manager = RealtimeManager::new(feed.clone(), RealtimeConfig::default());
        let (first_seen, first) = counting_callback();
        let (second_seen, second) = counting_callback();

        manager.subscribe("clients", "clients", first, SubscribeOptions::new()).unwrap();
        wait_for_status(&manager, "clients", ChannelStatus::Subscribed).await;
        manager.subscribe("clients", "clients", second, SubscribeOptions::new()).unwrap();
        wait_for_status(&manager, "clients", ChannelStatus::Subscribed).await;

        assert_eq!(feed.listener_count(), 1);
        feed.publish(ChangePayload::new("clients", ChangeEventKind::Insert));
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(first_seen.lock().unwrap().is_empty());
        assert_eq!(second_seen.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_is_applied() {
        let feed = Arc::new(InMemoryChangeFeed::new());
        let manager = RealtimeManager::new(feed.clone(), RealtimeConfig::default());
        let (seen, callback) = counting_callback();

        manager
            .subscribe(
                "my-invoices",
                "invoices",
                callback,
                SubscribeOptions::new().with_filter("user_id=eq.u1"),
            )
            .unwrap();
        wait_for_status(&manager, "my-invoices", ChannelStatus::Subscribed).await;

        feed.publish(ChangePayload::new("invoices", ChangeEventKind::Insert).with_new(json!({"user_id": "u2"})));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(seen.lock().unwrap().is_empty());

        feed.publish(ChangePayload::new("invoices", ChangeEventKind::Insert).with_new(json!({"user_id": "u1"})));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let manager = RealtimeManager::new(Arc::new(InMemoryChangeFeed::new()), RealtimeConfig::default());
        let (_, callback) = counting_callback();

        let err = manager
            .subscribe("c", "invoices", callback, SubscribeOptions::new().with_filter("user_id"))
            .unwrap_err();
        assert!(matches!(err, crate::CoreError::InvalidFilter(_)));
        assert!(manager.status("c").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_with_backoff_then_recovers() {
        let feed = Arc::new(InMemoryChangeFeed::new());
        let manager = RealtimeManager::new(feed.clone(), RealtimeConfig::default());
        let (_, callback) = counting_callback();

        manager.subscribe("plans", "plans", callback, SubscribeOptions::new()).unwrap();
        wait_for_status(&manager, "plans", ChannelStatus::Subscribed).await;

        feed.fail_next_listens(1);
        feed.inject_error("plans", "socket closed");
        wait_for_status(&manager, "plans", ChannelStatus::Reconnecting { attempt: 1 }).await;

        // 1s for the first retry (refused), 2s for the second
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(manager.status("plans"), Some(ChannelStatus::Reconnecting { attempt: 1 }));
        wait_for_status(&manager, "plans", ChannelStatus::Reconnecting { attempt: 2 }).await;
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(manager.status("plans"), Some(ChannelStatus::Subscribed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandons_after_max_attempts() {
        let feed = Arc::new(InMemoryChangeFeed::new());
        let config = RealtimeConfig::default()
            .with_backoff(BackoffConfig::new().with_max_attempts(2).with_base_delay(Duration::from_millis(100)));
        let manager = RealtimeManager::new(feed.clone(), config);
        let mut events = manager.events();
        let (_, callback) = counting_callback();

        feed.fail_next_listens(10);
        manager.subscribe("stats", "invoices", callback, SubscribeOptions::new()).unwrap();

        let abandoned = loop {
            match events.recv().await.unwrap() {
                RealtimeEvent::ChannelAbandoned { channel, attempts, .. } => break (channel, attempts),
                RealtimeEvent::StatusChanged { .. } => continue,
            }
        };
        assert_eq!(abandoned, ("stats".to_string(), 2));
        assert_eq!(manager.status("stats"), Some(ChannelStatus::Abandoned));
        assert!(manager.active_channels().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_all_clears_channels() {
        let feed = Arc::new(InMemoryChangeFeed::new());
        let manager = RealtimeManager::new(feed.clone(), RealtimeConfig::default());

        for name in ["a", "b"] {
            let (_, callback) = counting_callback();
            manager.subscribe(name, "clients", callback, SubscribeOptions::new()).unwrap();
            wait_for_status(&manager, name, ChannelStatus::Subscribed).await;
        }
        assert_eq!(manager.active_channels(), vec!["a".to_string(), "b".to_string()]);

        assert_eq!(manager.unsubscribe_all(), 2);
        assert!(manager.active_channels().is_empty());
        assert!(!manager.unsubscribe("a"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(feed.listener_count(), 0);
    }
}
