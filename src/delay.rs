use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::events::{EventBus, QueueEvent};
use crate::store::QueueStore;
use crate::timers::TimerManager;

/// Tracks the earliest delayed-job release timestamp and keeps at most one
/// one-shot timer armed for it. A guardian interval re-runs the promotion
/// regardless of pub/sub health, so liveness is bounded by the polling
/// interval even when the subscriber misses a wakeup.
#[derive(Clone)]
pub(crate) struct DelayController {
    inner: Arc<DelayInner>,
}

struct DelayInner {
    store: QueueStore,
    events: EventBus,
    timers: TimerManager,
    closing: Arc<AtomicBool>,
    /// Earliest armed release timestamp; `i64::MAX` when nothing is armed.
    delayed_ts: AtomicI64,
    timer_id: std::sync::Mutex<Option<u64>>,
    polling_interval_ms: i64,
    max_timeout_ms: i64,
}

impl DelayController {
    pub fn new(
        store: QueueStore,
        events: EventBus,
        timers: TimerManager,
        closing: Arc<AtomicBool>,
        polling_interval_ms: i64,
        max_timeout_ms: i64,
    ) -> Self {
        Self {
            inner: Arc::new(DelayInner {
                store,
                events,
                timers,
                closing,
                delayed_ts: AtomicI64::new(i64::MAX),
                timer_id: std::sync::Mutex::new(None),
                polling_interval_ms,
                max_timeout_ms,
            }),
        }
    }

    pub fn armed_ts(&self) -> i64 {
        self.inner.delayed_ts.load(Ordering::SeqCst)
    }

    /// Arm (or re-arm) the one-shot for an earlier release timestamp.
    /// Later timestamps and timestamps beyond the maximum timer span are
    /// ignored.
    pub fn update_delay_timer(&self, ts: i64) {
        let now = Utc::now().timestamp_millis();
        if ts >= self.armed_ts() || ts - now >= self.inner.max_timeout_ms {
            return;
        }

        self.clear_armed_timer();
        self.inner.delayed_ts.store(ts, Ordering::SeqCst);

        let delay = (ts - now).max(0) as u64;
        let this = self.clone();
        let id = self.inner.timers.set_timer(
            Duration::from_millis(delay),
            Box::pin(async move {
                this.fire().await;
            }),
        );
        *self.inner.timer_id.lock().expect("delay timer slot poisoned") = Some(id);
    }

    async fn fire(&self) {
        if self.inner.closing.load(Ordering::SeqCst) {
            return;
        }
        *self.inner.timer_id.lock().expect("delay timer slot poisoned") = None;
        self.promote().await;
    }

    /// Run the promotion script and re-arm for whatever remains delayed.
    pub async fn promote(&self) {
        let now = Utc::now().timestamp_millis();
        match self.inner.store.update_delay_set(now).await {
            Ok(next) => {
                self.inner.delayed_ts.store(i64::MAX, Ordering::SeqCst);
                if let Some(next) = next {
                    self.update_delay_timer(next);
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "delayed-job promotion failed");
                self.inner.events.emit(QueueEvent::Error {
                    message: format!("delayed-job promotion failed: {err}"),
                });
            }
        }
    }

    /// Safety net for lost pub/sub wakeups: whenever the armed timestamp is
    /// in the past (timer missed) or further out than one polling interval
    /// (re-verify), re-run the promotion.
    pub fn spawn_guardian(&self) -> JoinHandle<()> {
        let this = self.clone();
        let period = Duration::from_millis(self.inner.polling_interval_ms as u64);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if this.inner.closing.load(Ordering::SeqCst) {
                    return;
                }
                let armed = this.armed_ts();
                let now = Utc::now().timestamp_millis();
                if armed < now || armed - now > this.inner.polling_interval_ms {
                    this.clear_armed_timer();
                    this.promote().await;
                }
            }
        })
    }

    /// Disarm the one-shot. Used by close and before re-arming.
    pub fn cancel(&self) {
        self.clear_armed_timer();
        self.inner.delayed_ts.store(i64::MAX, Ordering::SeqCst);
    }

    fn clear_armed_timer(&self) {
        let id = self
            .inner
            .timer_id
            .lock()
            .expect("delay timer slot poisoned")
            .take();
        if let Some(id) = id {
            self.inner.timers.clear_timer(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RedisTestContext;

    fn build_controller(ctx: &RedisTestContext) -> (DelayController, Arc<AtomicBool>) {
        let closing = Arc::new(AtomicBool::new(false));
        let controller = DelayController::new(
            ctx.store.clone(),
            EventBus::new(16),
            TimerManager::new(),
            closing.clone(),
            ctx.settings.polling_interval_ms,
            ctx.settings.max_timeout_ms,
        );
        (controller, closing)
    }

    #[tokio::test]
    async fn timer_promotes_ready_job_into_wait() {
        let ctx = RedisTestContext::new().await.unwrap();
        let (controller, _closing) = build_controller(&ctx);
        let now = Utc::now().timestamp_millis();
        ctx.store.add_delayed_job("1", now + 100).await.unwrap();

        controller.update_delay_timer(now + 100);
        assert_eq!(controller.armed_ts(), now + 100);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(ctx.store.wait_ids().await.unwrap(), vec!["1".to_string()]);
        assert_eq!(controller.armed_ts(), i64::MAX);
    }

    #[tokio::test]
    async fn earlier_timestamp_rearms_later_is_ignored() {
        let ctx = RedisTestContext::new().await.unwrap();
        let (controller, _closing) = build_controller(&ctx);
        let now = Utc::now().timestamp_millis();

        controller.update_delay_timer(now + 60_000);
        assert_eq!(controller.armed_ts(), now + 60_000);

        controller.update_delay_timer(now + 90_000);
        assert_eq!(controller.armed_ts(), now + 60_000);

        controller.update_delay_timer(now + 30_000);
        assert_eq!(controller.armed_ts(), now + 30_000);
        controller.cancel();
    }

    #[tokio::test]
    async fn timestamps_beyond_max_span_are_rejected() {
        let ctx = RedisTestContext::new().await.unwrap();
        let (controller, _closing) = build_controller(&ctx);
        let now = Utc::now().timestamp_millis();
        controller.update_delay_timer(now + ctx.settings.max_timeout_ms + 1_000);
        assert_eq!(controller.armed_ts(), i64::MAX);
    }

    #[tokio::test]
    async fn guardian_recovers_without_pubsub() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        ctx.settings.polling_interval_ms = 100;
        let (controller, closing) = build_controller(&ctx);
        let now = Utc::now().timestamp_millis();
        // Delayed entry exists but no timer was ever armed, as if the
        // pub/sub wakeup had been lost.
        ctx.store.add_delayed_job("1", now + 150).await.unwrap();

        let guardian = controller.spawn_guardian();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(ctx.store.wait_ids().await.unwrap(), vec!["1".to_string()]);

        closing.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        guardian.abort();
    }
}
