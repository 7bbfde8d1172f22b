//! Input pacing for scroll and keystroke driven calls.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Lets at most one call through per interval; the rest are dropped.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: Mutex::new(None) }
    }

    /// `true` if the caller may proceed now.
    pub fn try_pass(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        match *last {
            Some(at) if now.duration_since(at) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    pub fn call<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        self.try_pass().then(f)
    }
}

/// Runs only the most recent call, once `wait` has passed without another.
#[derive(Debug)]
pub struct Debouncer {
    wait: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new(wait: Duration) -> Self {
        Self { wait, pending: Mutex::new(None) }
    }

    /// Schedules `task`, cancelling whatever was scheduled before it.
    pub fn call<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let wait = self.wait;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            task.await;
        });
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = pending.replace(handle) {
            previous.abort();
        }
    }

    pub fn cancel(&self) {
        if let Some(previous) = self.pending.lock().unwrap_or_else(PoisonError::into_inner).take() {
            previous.abort();
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}
