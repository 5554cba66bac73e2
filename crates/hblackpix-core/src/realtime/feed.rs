//! Database change-feed abstraction.
//!
//! A [`ChangeFeed`] opens a listener scoped to one table, an event mask and an
//! optional row filter, and streams [`FeedMessage`]s until the channel breaks.

use crate::config::RealtimeDefaults;
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Row event kinds a subscription can listen for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeEventKind {
    Insert,
    Update,
    Delete,
    #[default]
    #[serde(rename = "*")]
    All,
}

impl ChangeEventKind {
    /// Whether a subscription with this mask receives `event`.
    pub fn accepts(self, event: ChangeEventKind) -> bool {
        self == ChangeEventKind::All || self == event
    }
}

/// A single row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePayload {
    pub table: String,
    pub event: ChangeEventKind,
    /// Row after the change (absent for deletes).
    pub new: Option<Value>,
    /// Row before the change (absent for inserts).
    pub old: Option<Value>,
    pub commit_timestamp: DateTime<Utc>,
}

impl ChangePayload {
    pub fn new(table: impl Into<String>, event: ChangeEventKind) -> Self {
        Self {
            table: table.into(),
            event,
            new: None,
            old: None,
            commit_timestamp: Utc::now(),
        }
    }

    pub fn with_new(mut self, row: Value) -> Self {
        self.new = Some(row);
        self
    }

    pub fn with_old(mut self, row: Value) -> Self {
        self.old = Some(row);
        self
    }
}

/// Equality filter on one column, written `column=eq.value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFilter {
    pub column: String,
    pub value: String,
}

impl RowFilter {
    pub fn parse(expr: &str) -> Result<Self> {
        let (column, rest) = expr
            .split_once('=')
            .ok_or_else(|| CoreError::InvalidFilter(expr.to_string()))?;
        let value = rest
            .strip_prefix("eq.")
            .ok_or_else(|| CoreError::InvalidFilter(expr.to_string()))?;

        let column = column.trim();
        if column.is_empty() || value.is_empty() {
            return Err(CoreError::InvalidFilter(expr.to_string()));
        }

        Ok(Self {
            column: column.to_string(),
            value: value.to_string(),
        })
    }

    /// Match against the new row, or the old row for deletes.
    pub fn matches(&self, payload: &ChangePayload) -> bool {
        let row = payload.new.as_ref().or(payload.old.as_ref());
        let Some(field) = row.and_then(|row| row.get(&self.column)) else {
            return false;
        };
        match field {
            Value::String(s) => *s == self.value,
            Value::Null => self.value == "null",
            other => other.to_string() == self.value,
        }
    }
}

/// What a channel listens to.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    pub table: String,
    pub event: ChangeEventKind,
    pub filter: Option<RowFilter>,
}

impl ChannelSpec {
    pub fn matches(&self, payload: &ChangePayload) -> bool {
        payload.table == self.table
            && self.event.accepts(payload.event)
            && self.filter.as_ref().is_none_or(|f| f.matches(payload))
    }
}

/// Message delivered on an open listener.
#[derive(Debug, Clone)]
pub enum FeedMessage {
    Change(ChangePayload),
    /// The channel broke; no further messages follow.
    Error(String),
}

/// Source of row-change notifications.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a listener. The receiver closing counts as a channel error.
    async fn listen(&self, spec: &ChannelSpec) -> Result<mpsc::Receiver<FeedMessage>>;
}

struct Listener {
    spec: ChannelSpec,
    sender: mpsc::Sender<FeedMessage>,
}

/// In-process change feed. Producers call [`publish`](Self::publish); tests use
/// the error hooks to exercise reconnects.
pub struct InMemoryChangeFeed {
    listeners: Mutex<Vec<Listener>>,
    fail_listens: AtomicU32,
    buffer: usize,
}

impl Default for InMemoryChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryChangeFeed {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            fail_listens: AtomicU32::new(0),
            buffer: RealtimeDefaults::FEED_BUFFER,
        }
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<Listener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver a change to every matching listener. Returns how many got it.
    pub fn publish(&self, payload: ChangePayload) -> usize {
        let mut listeners = self.listeners();
        listeners.retain(|l| !l.sender.is_closed());

        let mut delivered = 0;
        for listener in listeners.iter().filter(|l| l.spec.matches(&payload)) {
            match listener.sender.try_send(FeedMessage::Change(payload.clone())) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Dropping change for '{}': {}", payload.table, e),
            }
        }
        delivered
    }

    /// Break every listener on `table` with `message`.
    pub fn inject_error(&self, table: &str, message: &str) -> usize {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|l| {
            if l.spec.table != table {
                return true;
            }
            let _ = l.sender.try_send(FeedMessage::Error(message.to_string()));
            false
        });
        before - listeners.len()
    }

    /// Make the next `count` calls to `listen` fail.
    pub fn fail_next_listens(&self, count: u32) {
        self.fail_listens.store(count, Ordering::SeqCst);
    }

    pub fn listener_count(&self) -> usize {
        let mut listeners = self.listeners();
        listeners.retain(|l| !l.sender.is_closed());
        listeners.len()
    }
}

#[async_trait]
impl ChangeFeed for InMemoryChangeFeed {
    async fn listen(&self, spec: &ChannelSpec) -> Result<mpsc::Receiver<FeedMessage>> {
        let failing = self
            .fail_listens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CoreError::Channel {
                channel: spec.table.clone(),
                message: "listen refused".to_string(),
            });
        }

        let (sender, receiver) = mpsc::channel(self.buffer);
        self.listeners().push(Listener {
            spec: spec.clone(),
            sender,
        });
        debug!("Opened change listener on '{}'", spec.table);
        Ok(receiver)
    }
}
