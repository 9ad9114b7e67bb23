//! Key naming for one queue's footprint in the store.
//!
//! Every key lives under `<prefix>:<queue-name>:`, so two queues with
//! different names (or prefixes) never collide.

#[derive(Debug, Clone)]
pub struct KeyNamer {
    prefix: String,
    queue: String,
}

impl KeyNamer {
    pub fn new(prefix: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            queue: queue.into(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn key(&self, sub: &str) -> String {
        format!("{}:{}:{}", self.prefix, self.queue, sub)
    }

    /// Ids awaiting processing (LIST). Left-push in, right-pop out.
    pub fn wait(&self) -> String {
        self.key("wait")
    }

    /// Ids currently checked out by a worker (LIST).
    pub fn active(&self) -> String {
        self.key("active")
    }

    /// Ids scored by release timestamp in ms (ZSET).
    pub fn delayed(&self) -> String {
        self.key("delayed")
    }

    /// Ids scored by numeric priority (ZSET).
    pub fn priority(&self) -> String {
        self.key("priority")
    }

    /// Terminally successful ids (SET).
    pub fn completed(&self) -> String {
        self.key("completed")
    }

    /// Terminally failed ids (SET).
    pub fn failed(&self) -> String {
        self.key("failed")
    }

    /// Holds what `wait` would hold while the queue is globally paused (LIST).
    pub fn paused(&self) -> String {
        self.key("paused")
    }

    /// Marker key; its existence routes new ids to `paused`.
    pub fn meta_paused(&self) -> String {
        self.key("meta-paused")
    }

    /// Job id counter (INCR).
    pub fn id(&self) -> String {
        self.key("id")
    }

    /// Payload record of one job (HASH).
    pub fn job(&self, job_id: &str) -> String {
        self.key(job_id)
    }

    /// Short-lived lock owned by a worker token.
    pub fn lock(&self, job_id: &str) -> String {
        self.key(&format!("{job_id}:lock"))
    }

    pub fn delayed_channel(&self) -> String {
        self.key("delayed")
    }

    pub fn paused_channel(&self) -> String {
        self.key("paused")
    }

    /// Channel carrying one distributed event for this queue.
    pub fn event_channel(&self, event: &str) -> String {
        format!("{event}@{}", self.queue)
    }

    /// Pattern matching every distributed event channel for this queue.
    pub fn event_pattern(&self) -> String {
        format!("*@{}", self.queue)
    }
}
