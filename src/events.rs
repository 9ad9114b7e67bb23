use serde_json::Value;
use tokio::sync::broadcast;

use crate::job::Job;

/// The closed set of events a queue can emit, locally or across instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEventKind {
    Ready,
    Error,
    Waiting,
    Active,
    Stalled,
    Progress,
    Completed,
    Failed,
    Removed,
    Cleaned,
    Paused,
    Resumed,
    NoJobRetrieved,
}

impl QueueEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueEventKind::Ready => "ready",
            QueueEventKind::Error => "error",
            QueueEventKind::Waiting => "waiting",
            QueueEventKind::Active => "active",
            QueueEventKind::Stalled => "stalled",
            QueueEventKind::Progress => "progress",
            QueueEventKind::Completed => "completed",
            QueueEventKind::Failed => "failed",
            QueueEventKind::Removed => "removed",
            QueueEventKind::Cleaned => "cleaned",
            QueueEventKind::Paused => "paused",
            QueueEventKind::Resumed => "resumed",
            QueueEventKind::NoJobRetrieved => "no-job-retrieved",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ready" => Some(QueueEventKind::Ready),
            "error" => Some(QueueEventKind::Error),
            "waiting" => Some(QueueEventKind::Waiting),
            "active" => Some(QueueEventKind::Active),
            "stalled" => Some(QueueEventKind::Stalled),
            "progress" => Some(QueueEventKind::Progress),
            "completed" => Some(QueueEventKind::Completed),
            "failed" => Some(QueueEventKind::Failed),
            "removed" => Some(QueueEventKind::Removed),
            "cleaned" => Some(QueueEventKind::Cleaned),
            "paused" => Some(QueueEventKind::Paused),
            "resumed" => Some(QueueEventKind::Resumed),
            "no-job-retrieved" => Some(QueueEventKind::NoJobRetrieved),
            _ => None,
        }
    }
}

/// One local event with its typed payload.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Ready,
    Error { message: String },
    Waiting { job: Job },
    Active { job: Job },
    Stalled { job: Job },
    Progress { job: Job, progress: Value },
    Completed { job: Job, return_value: Value },
    Failed { job: Job, reason: String },
    Removed { job: Job },
    Cleaned { job_ids: Vec<String>, collection: String },
    Paused,
    Resumed,
    NoJobRetrieved,
    /// An event observed from another instance via pub/sub, re-emitted
    /// locally. `cleaned` and `error` arrive with the raw payload instead
    /// of a rehydrated job.
    Global {
        kind: QueueEventKind,
        job: Option<Job>,
        payload: Option<String>,
    },
}

impl QueueEvent {
    pub fn kind(&self) -> QueueEventKind {
        match self {
            QueueEvent::Ready => QueueEventKind::Ready,
            QueueEvent::Error { .. } => QueueEventKind::Error,
            QueueEvent::Waiting { .. } => QueueEventKind::Waiting,
            QueueEvent::Active { .. } => QueueEventKind::Active,
            QueueEvent::Stalled { .. } => QueueEventKind::Stalled,
            QueueEvent::Progress { .. } => QueueEventKind::Progress,
            QueueEvent::Completed { .. } => QueueEventKind::Completed,
            QueueEvent::Failed { .. } => QueueEventKind::Failed,
            QueueEvent::Removed { .. } => QueueEventKind::Removed,
            QueueEvent::Cleaned { .. } => QueueEventKind::Cleaned,
            QueueEvent::Paused => QueueEventKind::Paused,
            QueueEvent::Resumed => QueueEventKind::Resumed,
            QueueEvent::NoJobRetrieved => QueueEventKind::NoJobRetrieved,
            QueueEvent::Global { kind, .. } => *kind,
        }
    }
}

/// Local event fan-out. Global publication goes through the store and is
/// handled by `Queue::dist_emit`.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    /// Emitting with no subscribers is not an error.
    pub fn emit(&self, event: QueueEvent) {
        let _ = self.sender.send(event);
    }
}
