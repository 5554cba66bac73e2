//! Connectivity state published to interested tasks.

use std::fmt;
use tokio::sync::watch;
use tracing::info;

/// Network connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectivityState::Online => write!(f, "online"),
            ConnectivityState::Offline => write!(f, "offline"),
        }
    }
}

/// Holds the current connectivity and notifies watchers on transitions.
///
/// Whoever observes the network (a browser `online` event, a failed request,
/// a probe) calls [`set_online`](Self::set_online) or
/// [`set_offline`](Self::set_offline); consumers react to the edge instead of
/// polling.
pub struct ConnectivityMonitor {
    state: watch::Sender<ConnectivityState>,
}

impl ConnectivityMonitor {
    pub fn new(initial: ConnectivityState) -> Self {
        let (state, _) = watch::channel(initial);
        Self { state }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state() == ConnectivityState::Online
    }

    pub fn set_online(&self) {
        self.set(ConnectivityState::Online);
    }

    pub fn set_offline(&self) {
        self.set(ConnectivityState::Offline);
    }

    /// Update the state. Watchers are only woken on a change.
    pub fn set(&self, next: ConnectivityState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            match next {
                ConnectivityState::Online => info!("Network connectivity restored"),
                ConnectivityState::Offline => info!("Network connectivity lost"),
            }
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    /// Assume online until told otherwise.
    fn default() -> Self {
        Self::new(ConnectivityState::Online)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_watchers_see_transitions_only() {
        let monitor = ConnectivityMonitor::default();
        let mut rx = monitor.subscribe();

        monitor.set_online();
        assert!(!rx.has_changed().unwrap());

        monitor.set_offline();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectivityState::Offline);
        assert!(!monitor.is_online());

        monitor.set_online();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectivityState::Online);
    }
}
