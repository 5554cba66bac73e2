//! Trailing-edge throttle.
//!
//! The first call in a quiet period arms a timer for one interval. Calls that
//! arrive while the timer is armed only replace the pending value. When the
//! timer fires the callback receives the most recent value, so the last event
//! of a burst is always delivered and the callback runs at most once per
//! interval.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

struct ThrottleState<T> {
    pending: Option<T>,
    timer: Option<JoinHandle<()>>,
}

struct ThrottleInner<T> {
    interval: Duration,
    callback: Arc<dyn Fn(T) + Send + Sync>,
    state: Mutex<ThrottleState<T>>,
}

impl<T> ThrottleInner<T> {
    fn state(&self) -> MutexGuard<'_, ThrottleState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Throttled wrapper around a callback. Must be used inside a tokio runtime.
pub struct Throttle<T: Send + 'static> {
    inner: Arc<ThrottleInner<T>>,
}

impl<T: Send + 'static> Throttle<T> {
    pub fn new(interval: Duration, callback: Arc<dyn Fn(T) + Send + Sync>) -> Self {
        Self {
            inner: Arc::new(ThrottleInner {
                interval,
                callback,
                state: Mutex::new(ThrottleState {
                    pending: None,
                    timer: None,
                }),
            }),
        }
    }

    /// Record `value` as the latest and arm the timer if it is idle.
    pub fn call(&self, value: T) {
        let mut state = self.inner.state();
        state.pending = Some(value);
        if state.timer.is_some() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.interval).await;
            let value = {
                let mut state = inner.state();
                state.timer = None;
                state.pending.take()
            };
            if let Some(value) = value {
                (inner.callback)(value);
            }
        }));
    }

    /// Whether a value is waiting for the timer.
    pub fn is_pending(&self) -> bool {
        self.inner.state().pending.is_some()
    }

    /// Drop any pending value and disarm the timer.
    pub fn cancel(&self) {
        let mut state = self.inner.state();
        state.pending = None;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }
}

impl<T: Send + 'static> Drop for Throttle<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, Arc<dyn Fn(u32) + Send + Sync>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback = Arc::new(move |v: u32| sink.lock().unwrap().push(v));
        (seen, callback)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_delivers_only_latest() {
        let (seen, callback) = recorder();
        let throttle = Throttle::new(Duration::from_millis(1000), callback);

        for i in 1..=10 {
            throttle.call(i);
        }
        assert!(seen.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert_eq!(*seen.lock().unwrap(), vec![10]);
        assert!(!throttle.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_at_most_once_per_interval() {
        let (seen, callback) = recorder();
        let throttle = Throttle::new(Duration::from_millis(100), callback);

        // One call every 30ms for 600ms
        for i in 0..20 {
            throttle.call(i);
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let seen = seen.lock().unwrap();
        assert!(seen.len() <= 7, "fired {} times", seen.len());
        assert_eq!(seen.last(), Some(&19));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_pending() {
        let (seen, callback) = recorder();
        let throttle = Throttle::new(Duration::from_millis(100), callback);

        throttle.call(1);
        throttle.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(seen.lock().unwrap().is_empty());
    }
}
