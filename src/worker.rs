use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use chrono::Utc;
use futures_util::future::BoxFuture;
use rand::Rng;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::constants::STALL_LIMIT_REASON;
use crate::events::QueueEvent;
use crate::job::Job;
use crate::queue::QueueCore;

/// Data a handler may return: any serializable value, type-erased so that
/// serialization happens once at finalization. A value that cannot
/// serialize routes the job through the failure path.
pub trait HandlerReturn: Send {
    fn to_json(&self) -> serde_json::Result<String>;
}

impl<T> HandlerReturn for T
where
    T: serde::Serialize + Send,
{
    fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// The user-supplied job handler. Its return value becomes the job's
/// return value; an error routes the job through the failure path.
pub type JobHandler =
    Arc<dyn Fn(Job) -> BoxFuture<'static, Result<Box<dyn HandlerReturn>>> + Send + Sync>;

/// One logical worker: await the local-pause gate, fetch, process, repeat.
/// Errors are logged and the loop continues; a closing queue ends it.
pub(crate) async fn worker_loop(core: Arc<QueueCore>) {
    let mut paused_rx = core.paused_rx.clone();
    loop {
        if core.is_closing() {
            return;
        }
        let paused = *paused_rx.borrow_and_update();
        if paused {
            if paused_rx.changed().await.is_err() {
                return;
            }
            continue;
        }

        match get_next_job(&core).await {
            Ok(Some(job)) => {
                if let Err(err) = process_job(&core, job).await {
                    tracing::error!(error = %err, "job processing error");
                    core.events.emit(QueueEvent::Error {
                        message: format!("job processing error: {err}"),
                    });
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::error!(error = %err, "failed to retrieve next job");
                core.events.emit(QueueEvent::Error {
                    message: format!("failed to retrieve next job: {err}"),
                });
                sleep_with_closing(&core, jittered_delay(1.0, 0.5)).await;
            }
        }
    }
}

/// Move one id `wait -> active` and load its job. Returns nothing when the
/// queue is closing, locally paused, or the pop times out; a nothing
/// result emits `no-job-retrieved` for shutdown accounting.
pub(crate) async fn get_next_job(core: &Arc<QueueCore>) -> Result<Option<Job>> {
    if core.is_closing() || core.locally_paused() {
        return Ok(None);
    }

    core.retrieving.fetch_add(1, Ordering::SeqCst);
    let fetched = fetch_next_job(core).await;
    core.retrieving.fetch_sub(1, Ordering::SeqCst);

    match fetched {
        Ok(Some(job)) => {
            core.processing.fetch_add(1, Ordering::SeqCst);
            Ok(Some(job))
        }
        Ok(None) => {
            core.events.emit(QueueEvent::NoJobRetrieved);
            core.note_drain_progress();
            Ok(None)
        }
        Err(err) => {
            core.note_drain_progress();
            Err(err)
        }
    }
}

async fn fetch_next_job(core: &Arc<QueueCore>) -> Result<Option<Job>> {
    // The blocking pop timeout matches the lock renew interval to bound
    // liveness under disconnects.
    let timeout_secs = (core.settings.lock_renew_time_ms / 1000).max(1) as f64;
    let popped = {
        // At most one blocking move per instance may be in flight.
        let mut conn = core.blocking.lock().await;
        if core.is_closing() || core.locally_paused() {
            return Ok(None);
        }
        if core.settings.block {
            core.store
                .move_to_active_blocking(&mut conn, timeout_secs)
                .await?
        } else {
            core.store.move_to_active(&mut conn).await?
        }
    };

    let job_id = match popped {
        Some(job_id) => job_id,
        None => return Ok(None),
    };

    // Best-effort trim, not atomic with the move. Accepted ordering hazard
    // affecting only priority jobs.
    if let Err(err) = core.store.remove_priority(&job_id).await {
        tracing::debug!(job_id = %job_id, error = %err, "priority trim failed");
    }

    match Job::from_id(&core.store, &job_id).await? {
        Some(job) => Ok(Some(job)),
        None => {
            tracing::warn!(job_id = %job_id, "popped id without a payload record");
            core.store.remove_from_active(&job_id).await?;
            Ok(None)
        }
    }
}

/// Run the handler under lock and finalize to completed or failed.
pub(crate) async fn process_job(core: &Arc<QueueCore>, mut job: Job) -> Result<()> {
    let lock_ttl = core.settings.lock_duration_ms;
    let took = job
        .take_lock(&core.store, &core.token, lock_ttl, true, false)
        .await?;
    if !took {
        // The job stalled and another worker owns it now.
        tracing::warn!(job_id = %job.id, "lock held elsewhere, skipping job");
        core.processing.fetch_sub(1, Ordering::SeqCst);
        core.note_drain_progress();
        return Ok(());
    }
    core.dist_emit(QueueEvent::Active { job: job.clone() }).await;

    let renewer = LockRenewer::start(core.clone(), job.id.clone());
    let handler = {
        let slot = core.handler.lock().expect("handler slot poisoned");
        slot.clone()
    };
    let handler = match handler {
        Some(handler) => handler,
        None => {
            renewer.stop();
            core.processing.fetch_sub(1, Ordering::SeqCst);
            core.note_drain_progress();
            anyhow::bail!("no handler installed for job {}", job.id);
        }
    };

    let fut = handler(job.clone());
    let outcome = match job.opts.timeout {
        Some(ms) if ms > 0 => {
            match tokio::time::timeout(Duration::from_millis(ms), fut).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("job handler timed out after {ms}ms")),
            }
        }
        _ => fut.await,
    };

    match outcome {
        Ok(value) => match value.to_json() {
            Ok(payload) => {
                // Decremented before emitting so pause coordination can
                // converge on the counters.
                core.processing.fetch_sub(1, Ordering::SeqCst);
                core.note_drain_progress();
                renewer.stop();
                if let Err(err) = job.move_to_completed(&core.store, &payload).await {
                    tracing::error!(job_id = %job.id, error = %err, "completion finalize failed");
                    return Err(err);
                }
                let return_value: Value =
                    serde_json::from_str(&payload).unwrap_or(Value::Null);
                core.dist_emit(QueueEvent::Completed {
                    job: job.clone(),
                    return_value,
                })
                .await;
                Ok(())
            }
            Err(err) => {
                let reason = format!("failed to serialize handler return value: {err}");
                finalize_failure(core, job, renewer, reason).await
            }
        },
        Err(err) => finalize_failure(core, job, renewer, format!("{err:#}")).await,
    }
}

async fn finalize_failure(
    core: &Arc<QueueCore>,
    mut job: Job,
    renewer: LockRenewer,
    reason: String,
) -> Result<()> {
    let reacquired = job
        .take_lock(&core.store, &core.token, core.settings.lock_duration_ms, false, true)
        .await
        .unwrap_or_else(|err| {
            tracing::warn!(job_id = %job.id, error = %err, "lock reacquisition errored");
            false
        });
    renewer.stop();

    if !reacquired {
        // Abandon the job; the reaper will arbitrate ownership.
        tracing::warn!(
            job_id = %job.id,
            "could not reacquire lock on the failure path, leaving job for the reaper"
        );
        core.processing.fetch_sub(1, Ordering::SeqCst);
        core.note_drain_progress();
        return Ok(());
    }

    let result = job.move_to_failed(&core.store, &reason).await;
    let _ = job.release_lock(&core.store, &core.token).await;
    match result {
        Ok(()) => {
            core.dist_emit(QueueEvent::Failed {
                job: job.clone(),
                reason,
            })
            .await;
            core.processing.fetch_sub(1, Ordering::SeqCst);
            core.note_drain_progress();
            Ok(())
        }
        Err(err) => {
            tracing::error!(job_id = %job.id, error = %err, "failure finalize failed");
            core.processing.fetch_sub(1, Ordering::SeqCst);
            core.note_drain_progress();
            Err(err)
        }
    }
}

/// Extends the job's lock every renew interval while the handler runs.
/// A renewal that loses ownership (or errors) logs and stops rescheduling;
/// the handler keeps running and the reaper arbitrates.
struct LockRenewer {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl LockRenewer {
    fn start(core: Arc<QueueCore>, job_id: String) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let interval_ms = core.settings.lock_renew_time_ms.max(1) as u64;
        let ttl_ms = core.settings.lock_duration_ms;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                if flag.load(Ordering::SeqCst) {
                    return;
                }
                match core
                    .store
                    .take_lock(&job_id, &core.token, ttl_ms, false, true)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(
                            job_id = %job_id,
                            "lock renewal lost ownership, handler continues"
                        );
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(
                            job_id = %job_id,
                            error = %err,
                            "lock renewal failed, handler continues"
                        );
                        return;
                    }
                }
            }
        });
        Self { stop, handle }
    }

    fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.handle.abort();
    }
}

/// Periodic sweep of active for ids whose lock expired. Disabled when the
/// check interval is zero.
pub(crate) fn spawn_reaper(core: Arc<QueueCore>) -> Option<JoinHandle<()>> {
    let interval_ms = core.settings.stalled_job_check_interval_ms;
    if interval_ms <= 0 {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms as u64));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if core.is_closing() {
                return;
            }
            sweep_stalled_jobs(&core).await;
        }
    }))
}

pub(crate) async fn sweep_stalled_jobs(core: &Arc<QueueCore>) {
    let now = Utc::now().timestamp_millis();
    let swept = core
        .store
        .move_unlocked_jobs_to_wait(core.settings.max_stalled_job_count, now, STALL_LIMIT_REASON)
        .await;
    match swept {
        Ok((failed_ids, stalled_ids)) => {
            for job_id in failed_ids {
                if let Ok(Some(job)) = Job::from_id(&core.store, &job_id).await {
                    core.dist_emit(QueueEvent::Failed {
                        job,
                        reason: STALL_LIMIT_REASON.to_string(),
                    })
                    .await;
                }
                core.note_drain_progress();
            }
            for job_id in stalled_ids {
                if let Ok(Some(job)) = Job::from_id(&core.store, &job_id).await {
                    core.dist_emit(QueueEvent::Stalled { job }).await;
                }
                core.note_drain_progress();
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "stalled-job sweep failed");
            core.events.emit(QueueEvent::Error {
                message: format!("stalled-job sweep failed: {err}"),
            });
        }
    }
}

fn jittered_delay(base_secs: f64, jitter_factor: f64) -> Duration {
    if base_secs <= 0.0 {
        return Duration::ZERO;
    }
    let jitter = jitter_factor.clamp(0.0, 0.99);
    let min_delay = base_secs * (1.0 - jitter);
    let max_delay = base_secs * (1.0 + jitter);
    let mut rng = rand::rng();
    Duration::from_secs_f64(rng.random_range(min_delay..=max_delay))
}

async fn sleep_with_closing(core: &Arc<QueueCore>, delay: Duration) {
    let step = Duration::from_millis(50);
    let mut remaining = delay;
    while remaining > Duration::ZERO {
        if core.is_closing() {
            return;
        }
        let chunk = remaining.min(step);
        tokio::time::sleep(chunk).await;
        remaining = remaining.saturating_sub(chunk);
    }
}
