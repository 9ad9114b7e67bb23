use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio::time::Duration;

/// Bookkeeping of outstanding one-shot timers so close can await their
/// drain before tearing connections down.
#[derive(Clone)]
pub struct TimerManager {
    inner: Arc<TimerInner>,
}

struct TimerInner {
    timers: Mutex<HashMap<u64, AbortHandle>>,
    next_id: AtomicU64,
    idle: Notify,
}

impl TimerManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TimerInner {
                timers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                idle: Notify::new(),
            }),
        }
    }

    /// Arm a one-shot: after `delay`, run `fut` to completion, then retire
    /// the timer. Returns an id usable with `clear_timer`.
    pub fn set_timer(&self, delay: Duration, fut: BoxFuture<'static, ()>) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.clone();
        // Hold the registry lock across spawn + insert so the task cannot
        // retire itself before it is registered.
        let mut timers = self.inner.timers.lock().expect("timer registry poisoned");
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fut.await;
            inner.retire(id);
        });
        timers.insert(id, handle.abort_handle());
        id
    }

    /// Cancel an armed timer. Cancelling an already-fired id is a no-op.
    pub fn clear_timer(&self, id: u64) {
        let mut timers = self.inner.timers.lock().expect("timer registry poisoned");
        if let Some(handle) = timers.remove(&id) {
            handle.abort();
        }
        if timers.is_empty() {
            self.inner.idle.notify_waiters();
        }
    }

    pub fn outstanding(&self) -> usize {
        self.inner.timers.lock().expect("timer registry poisoned").len()
    }

    /// Resolves once no one-shot timers are outstanding.
    pub async fn idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerInner {
    fn retire(&self, id: u64) {
        let mut timers = self.timers.lock().expect("timer registry poisoned");
        timers.remove(&id);
        if timers.is_empty() {
            self.idle.notify_waiters();
        }
    }
}
