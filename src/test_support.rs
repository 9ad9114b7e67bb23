use std::sync::OnceLock;

use anyhow::Result;
use tokio::sync::{Mutex, MutexGuard, broadcast};
use tokio::time::Duration;
use uuid::Uuid;

use crate::events::QueueEvent;
use crate::keys::KeyNamer;
use crate::queue::Queue;
use crate::settings::QueueSettings;
use crate::store::QueueStore;

static REDIS_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn redis_lock() -> &'static Mutex<()> {
    REDIS_LOCK.get_or_init(|| Mutex::new(()))
}

/// Serialized access to the shared test Redis, with a fresh database and a
/// uniquely named queue per context.
pub struct RedisTestContext {
    _guard: MutexGuard<'static, ()>,
    pub settings: QueueSettings,
    pub queue_name: String,
    pub keys: KeyNamer,
    pub store: QueueStore,
}

impl RedisTestContext {
    pub async fn new() -> Result<Self> {
        let guard = redis_lock().lock().await;
        let mut settings = QueueSettings::default();
        settings.redis_dsn = std::env::var("TAURUS_TEST_REDIS_DSN")
            .unwrap_or_else(|_| "redis://localhost:6379/15".to_string());
        let queue_name = format!("test-queue-{}", Uuid::new_v4());
        let keys = KeyNamer::new(&settings.key_prefix, &queue_name);
        let store = QueueStore::new(&settings.redis_dsn, keys.clone()).await?;
        store.flushdb().await?;
        Ok(Self {
            _guard: guard,
            settings,
            queue_name,
            keys,
            store,
        })
    }

    pub async fn queue(&self) -> Result<Queue> {
        Queue::new(&self.queue_name, self.settings.clone()).await
    }
}

/// Wait for the first event matching the predicate, skipping everything
/// else (including global re-emissions of this instance's own events).
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<QueueEvent>,
    timeout_ms: u64,
    predicate: F,
) -> QueueEvent
where
    F: Fn(&QueueEvent) -> bool,
{
    tokio::time::timeout(Duration::from_millis(timeout_ms), async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
