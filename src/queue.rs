use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use redis::aio::MultiplexedConnection;
use serde_json::Value;
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::delay::DelayController;
use crate::events::{EventBus, QueueEvent, QueueEventKind};
use crate::job::{Job, JobOptions};
use crate::keys::KeyNamer;
use crate::settings::QueueSettings;
use crate::store::{CleanTarget, JobCounts, QueueStore};
use crate::timers::TimerManager;
use crate::worker::{self, HandlerReturn, JobHandler};

/// State shared by the queue, its dispatchers, the reaper, and the
/// subscriber task.
pub(crate) struct QueueCore {
    pub(crate) settings: QueueSettings,
    pub(crate) keys: KeyNamer,
    /// Per-instance worker token proving lock ownership.
    pub(crate) token: String,
    pub(crate) store: QueueStore,
    /// Dedicated blocking session; the mutex serializes blocking moves.
    pub(crate) blocking: tokio::sync::Mutex<MultiplexedConnection>,
    pub(crate) events: EventBus,
    pub(crate) timers: TimerManager,
    pub(crate) closing: Arc<AtomicBool>,
    pub(crate) closed: AtomicBool,
    paused_tx: watch::Sender<bool>,
    pub(crate) paused_rx: watch::Receiver<bool>,
    pub(crate) retrieving: AtomicUsize,
    pub(crate) processing: AtomicUsize,
    drained: Notify,
    pub(crate) handler: std::sync::Mutex<Option<JobHandler>>,
}

impl QueueCore {
    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub(crate) fn locally_paused(&self) -> bool {
        *self.paused_rx.borrow()
    }

    pub(crate) fn set_local_pause(&self, paused: bool) {
        let _ = self.paused_tx.send(paused);
    }

    pub(crate) fn note_drain_progress(&self) {
        self.drained.notify_waiters();
    }

    /// Resolves once the in-flight units this instance counted have been
    /// accounted for by `stalled|completed|failed|no-job-retrieved`.
    pub(crate) async fn when_current_jobs_finished(&self) {
        loop {
            let notified = self.drained.notified();
            if self.retrieving.load(Ordering::SeqCst) == 0
                && self.processing.load(Ordering::SeqCst) == 0
            {
                return;
            }
            notified.await;
        }
    }

    /// Emit locally and publish the event globally on `<event>@<name>`.
    pub(crate) async fn dist_emit(&self, event: QueueEvent) {
        let payload = match &event {
            QueueEvent::Waiting { job }
            | QueueEvent::Active { job }
            | QueueEvent::Stalled { job }
            | QueueEvent::Removed { job }
            | QueueEvent::Progress { job, .. }
            | QueueEvent::Completed { job, .. }
            | QueueEvent::Failed { job, .. } => serde_json::to_string(job).ok(),
            QueueEvent::Cleaned { job_ids, .. } => serde_json::to_string(job_ids).ok(),
            QueueEvent::Error { message } => Some(message.clone()),
            _ => None,
        };
        if let Some(payload) = payload {
            let channel = self.keys.event_channel(event.kind().as_str());
            if let Err(err) = self.store.publish(&channel, &payload).await {
                tracing::warn!(channel = %channel, error = %err, "global event publish failed");
            }
        }
        self.events.emit(event);
    }
}

/// One logical queue instance: the connection trio, the delay controller,
/// the dispatchers, the stalled-job reaper, and the pub/sub subscriber.
pub struct Queue {
    core: Arc<QueueCore>,
    delay: DelayController,
    guardian: std::sync::Mutex<Option<JoinHandle<()>>>,
    reaper: std::sync::Mutex<Option<JoinHandle<()>>>,
    subscriber: std::sync::Mutex<Option<JoinHandle<()>>>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    _ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl Queue {
    /// Connect the three store sessions and bring the queue up.
    pub async fn new(name: &str, settings: QueueSettings) -> Result<Self> {
        settings.validate()?;
        let dsn = settings.connection_dsn();
        let client = redis::Client::open(dsn.as_str())
            .with_context(|| "failed to create store client")?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .with_context(|| "failed to connect general client")?;
        let blocking = client
            .get_multiplexed_async_connection()
            .await
            .with_context(|| "failed to connect blocking client")?;
        let subscriber = client
            .get_async_pubsub()
            .await
            .with_context(|| "failed to connect subscriber client")?;
        Self::with_connections(name, settings, conn, blocking, subscriber).await
    }

    /// Bring the queue up over caller-built connections, for callers that
    /// manage their own clients.
    pub async fn with_connections(
        name: &str,
        settings: QueueSettings,
        conn: MultiplexedConnection,
        blocking: MultiplexedConnection,
        mut subscriber: redis::aio::PubSub,
    ) -> Result<Self> {
        settings.validate()?;
        let keys = KeyNamer::new(&settings.key_prefix, name);
        let store = QueueStore::with_connection(keys.clone(), conn);
        let events = EventBus::new(256);

        if let Err(err) = store.check_server_version().await {
            events.emit(QueueEvent::Error {
                message: err.to_string(),
            });
            return Err(err);
        }

        let closing = Arc::new(AtomicBool::new(false));
        let timers = TimerManager::new();
        let (paused_tx, paused_rx) = watch::channel(false);
        let core = Arc::new(QueueCore {
            keys: keys.clone(),
            token: uuid::Uuid::new_v4().to_string(),
            store: store.clone(),
            blocking: tokio::sync::Mutex::new(blocking),
            events: events.clone(),
            timers: timers.clone(),
            closing: closing.clone(),
            closed: AtomicBool::new(false),
            paused_tx,
            paused_rx,
            retrieving: AtomicUsize::new(0),
            processing: AtomicUsize::new(0),
            drained: Notify::new(),
            handler: std::sync::Mutex::new(None),
            settings,
        });
        let delay = DelayController::new(
            store.clone(),
            events.clone(),
            timers,
            closing,
            core.settings.polling_interval_ms,
            core.settings.max_timeout_ms,
        );

        subscriber
            .subscribe(keys.delayed_channel())
            .await
            .with_context(|| "failed to subscribe to the delayed channel")?;
        subscriber
            .subscribe(keys.paused_channel())
            .await
            .with_context(|| "failed to subscribe to the paused channel")?;
        subscriber
            .psubscribe(keys.event_pattern())
            .await
            .with_context(|| "failed to subscribe to the event channels")?;
        let subscriber_handle =
            tokio::spawn(subscriber_loop(core.clone(), delay.clone(), subscriber));

        // Catch up with delayed work enqueued before this instance existed.
        if let Ok(Some(ts)) = store.next_delayed_ts().await {
            delay.update_delay_timer(ts);
        }

        let guardian = delay.spawn_guardian();
        let reaper = worker::spawn_reaper(core.clone());

        let (ready_tx, ready_rx) = watch::channel(true);
        core.events.emit(QueueEvent::Ready);

        Ok(Self {
            core,
            delay,
            guardian: std::sync::Mutex::new(Some(guardian)),
            reaper: std::sync::Mutex::new(reaper),
            subscriber: std::sync::Mutex::new(Some(subscriber_handle)),
            workers: std::sync::Mutex::new(Vec::new()),
            _ready_tx: ready_tx,
            ready_rx,
        })
    }

    pub fn name(&self) -> &str {
        self.core.keys.queue_name()
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.core.settings
    }

    /// Subscribe to this instance's local event stream.
    pub fn on_events(&self) -> broadcast::Receiver<QueueEvent> {
        self.core.events.subscribe()
    }

    /// Resolves once all three sessions are up and subscribed.
    pub async fn is_ready(&self) -> Result<()> {
        let mut rx = self.ready_rx.clone();
        loop {
            if *rx.borrow() {
                return Ok(());
            }
            rx.changed()
                .await
                .map_err(|_| anyhow::anyhow!("queue went away before becoming ready"))?;
        }
    }

    /// Create a job and enqueue it into wait, paused, or delayed.
    pub async fn add(&self, data: Value, opts: JobOptions) -> Result<Job> {
        if self.core.is_closing() {
            anyhow::bail!("queue is closing");
        }
        let job = Job::create(&self.core.store, data, opts).await?;
        if job.delay == 0 {
            self.core
                .dist_emit(QueueEvent::Waiting { job: job.clone() })
                .await;
        }
        Ok(job)
    }

    /// Install the single handler and start `concurrency` dispatchers.
    /// Installing a second handler is a programming error.
    pub fn process<F>(&self, concurrency: usize, handler: F) -> Result<()>
    where
        F: Fn(Job) -> BoxFuture<'static, Result<Box<dyn HandlerReturn>>> + Send + Sync + 'static,
    {
        if concurrency == 0 {
            anyhow::bail!("concurrency must be positive");
        }
        {
            let mut slot = self.core.handler.lock().expect("handler slot poisoned");
            if slot.is_some() {
                anyhow::bail!("a handler is already installed for this queue");
            }
            *slot = Some(Arc::new(handler));
        }
        let mut workers = self.workers.lock().expect("worker registry poisoned");
        for _ in 0..concurrency {
            workers.push(tokio::spawn(worker::worker_loop(self.core.clone())));
        }
        Ok(())
    }

    /// Pause consumption. Local pause gates this instance's dispatchers;
    /// global pause renames wait atomically and notifies every instance.
    pub async fn pause(&self, local: bool) -> Result<()> {
        if local {
            self.core.set_local_pause(true);
            self.core.events.emit(QueueEvent::Paused);
        } else {
            self.core.store.pause_resume(true).await?;
        }
        Ok(())
    }

    pub async fn resume(&self, local: bool) -> Result<()> {
        if local {
            self.core.set_local_pause(false);
            self.core.events.emit(QueueEvent::Resumed);
        } else {
            self.core.store.pause_resume(false).await?;
        }
        Ok(())
    }

    /// `max(len(wait), len(paused)) + len(delayed)`.
    pub async fn count(&self) -> Result<i64> {
        self.core.store.count().await
    }

    pub async fn get_job_counts(&self) -> Result<JobCounts> {
        self.core.store.job_counts().await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        Job::from_id(&self.core.store, job_id).await
    }

    /// Jobs awaiting processing: the concatenation of wait and paused.
    pub async fn get_waiting(&self) -> Result<Vec<Job>> {
        let mut ids = self.core.store.wait_ids().await?;
        ids.extend(self.core.store.paused_ids().await?);
        self.load_jobs(ids).await
    }

    pub async fn get_active(&self) -> Result<Vec<Job>> {
        let ids = self.core.store.active_ids().await?;
        self.load_jobs(ids).await
    }

    pub async fn get_delayed(&self) -> Result<Vec<Job>> {
        let ids = self.core.store.delayed_ids().await?;
        self.load_jobs(ids).await
    }

    pub async fn get_completed(&self) -> Result<Vec<Job>> {
        let ids = self.core.store.completed_ids().await?;
        self.load_jobs(ids).await
    }

    pub async fn get_failed(&self) -> Result<Vec<Job>> {
        let ids = self.core.store.failed_ids().await?;
        self.load_jobs(ids).await
    }

    async fn load_jobs(&self, ids: Vec<String>) -> Result<Vec<Job>> {
        let maps = self.core.store.fetch_job_maps(&ids).await?;
        Ok(ids
            .into_iter()
            .zip(maps)
            .filter_map(|(id, map)| map.map(|map| Job::from_hash(&id, map)))
            .collect())
    }

    /// Best-effort truncation of wait, paused, delayed, and the paused
    /// marker. Returns the dropped ids.
    pub async fn empty(&self) -> Result<Vec<String>> {
        self.core.store.empty().await
    }

    /// Remove up to `limit` jobs from `target` whose terminal timestamp is
    /// older than `grace_ms` ago. Unknown targets fail synchronously.
    pub async fn clean(&self, grace_ms: i64, target: &str, limit: i64) -> Result<Vec<String>> {
        let target = CleanTarget::parse(target)
            .ok_or_else(|| anyhow::anyhow!("unknown clean target '{target}'"))?;
        if grace_ms < 0 {
            anyhow::bail!("grace must be >= 0");
        }
        let older_than = Utc::now().timestamp_millis() - grace_ms;
        let removed = self
            .core
            .store
            .clean_jobs_in_set(target, older_than, limit)
            .await?;
        if !removed.is_empty() {
            self.core
                .dist_emit(QueueEvent::Cleaned {
                    job_ids: removed.clone(),
                    collection: target.as_str().to_string(),
                })
                .await;
        }
        Ok(removed)
    }

    /// Delete a job from every collection and emit `removed`.
    pub async fn remove_job(&self, job_id: &str) -> Result<()> {
        let job = Job::from_id(&self.core.store, job_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("job {job_id} not found"))?;
        job.remove(&self.core.store).await?;
        self.core.dist_emit(QueueEvent::Removed { job }).await;
        Ok(())
    }

    /// Move a failed job back to wait and emit `waiting`.
    pub async fn retry_job(&self, job_id: &str) -> Result<()> {
        let mut job = Job::from_id(&self.core.store, job_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("job {job_id} not found"))?;
        job.retry(&self.core.store).await?;
        self.core.dist_emit(QueueEvent::Waiting { job }).await;
        Ok(())
    }

    /// Record handler progress on the job and emit `progress`.
    pub async fn report_progress(&self, job_id: &str, progress: f64) -> Result<()> {
        let mut job = Job::from_id(&self.core.store, job_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("job {job_id} not found"))?;
        job.report_progress(&self.core.store, progress).await?;
        self.core
            .dist_emit(QueueEvent::Progress {
                job,
                progress: serde_json::json!(progress),
            })
            .await;
        Ok(())
    }

    /// Resolves once in-flight work on this instance has drained.
    pub async fn when_current_jobs_finished(&self) {
        self.core.when_current_jobs_finished().await;
    }

    /// Graceful shutdown. Idempotent. Cancels the delay timer, guardian,
    /// and reaper, drains outstanding one-shot timers, pauses locally,
    /// optionally awaits in-flight jobs, then tears the sessions down,
    /// bounding the blocking session by the close timeout.
    pub async fn close(&self, do_not_wait_jobs: bool) -> Result<()> {
        if self.core.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.core.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.delay.cancel();
        if let Some(handle) = self.guardian.lock().expect("guardian slot poisoned").take() {
            handle.abort();
        }
        if let Some(handle) = self.reaper.lock().expect("reaper slot poisoned").take() {
            handle.abort();
        }
        self.core.timers.idle().await;

        self.core.set_local_pause(true);
        if !do_not_wait_jobs {
            self.core.when_current_jobs_finished().await;
        }

        if let Some(handle) = self
            .subscriber
            .lock()
            .expect("subscriber slot poisoned")
            .take()
        {
            handle.abort();
        }

        // An in-flight blocking move holds the mutex; give it the close
        // grace and carry on regardless.
        let grace = Duration::from_millis(self.core.settings.client_close_timeout_ms);
        if tokio::time::timeout(grace, self.core.blocking.lock())
            .await
            .is_err()
        {
            tracing::warn!("blocking session did not drain within the close timeout");
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().expect("worker registry poisoned");
            workers.drain(..).collect()
        };
        for handle in handles {
            handle.abort();
        }

        self.core.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Consume pub/sub messages: delayed-channel timestamps re-arm the delay
/// timer, paused-channel markers flip the local gate, and `<event>@<name>`
/// payloads are rehydrated and re-emitted locally.
async fn subscriber_loop(
    core: Arc<QueueCore>,
    delay: DelayController,
    subscriber: redis::aio::PubSub,
) {
    let mut stream = subscriber.into_on_message();
    while let Some(msg) = stream.next().await {
        if core.is_closing() {
            return;
        }
        let channel = msg.get_channel_name().to_string();
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(channel = %channel, error = %err, "undecodable pub/sub payload");
                continue;
            }
        };
        handle_pubsub_message(&core, &delay, &channel, &payload).await;
    }
}

async fn handle_pubsub_message(
    core: &Arc<QueueCore>,
    delay: &DelayController,
    channel: &str,
    payload: &str,
) {
    if channel == core.keys.delayed_channel() {
        match payload.parse::<i64>() {
            Ok(ts) => delay.update_delay_timer(ts),
            Err(_) => {
                tracing::debug!(payload = %payload, "ignoring malformed delayed timestamp")
            }
        }
        return;
    }

    if channel == core.keys.paused_channel() {
        match payload {
            "paused" => {
                core.set_local_pause(true);
                core.events.emit(QueueEvent::Paused);
            }
            "resumed" => {
                core.set_local_pause(false);
                core.events.emit(QueueEvent::Resumed);
            }
            _ => {}
        }
        return;
    }

    let Some((event, queue_name)) = channel.split_once('@') else {
        return;
    };
    if queue_name != core.keys.queue_name() {
        return;
    }
    let Some(kind) = QueueEventKind::parse(event) else {
        return;
    };
    let event = match kind {
        QueueEventKind::Cleaned | QueueEventKind::Error => QueueEvent::Global {
            kind,
            job: None,
            payload: Some(payload.to_string()),
        },
        _ => match Job::from_json(payload) {
            Ok(job) => QueueEvent::Global {
                kind,
                job: Some(job),
                payload: None,
            },
            Err(err) => {
                tracing::debug!(channel = %channel, error = %err, "undecodable job snapshot");
                return;
            }
        },
    };
    core.events.emit(event);
}
