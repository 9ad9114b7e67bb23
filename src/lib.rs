pub mod config;
pub mod constants;
pub mod events;
pub mod job;
pub mod keys;
pub mod queue;
pub mod settings;
pub mod store;
pub mod telemetry;
pub mod timers;

mod delay;
mod worker;

#[cfg(test)]
mod test_support;

pub use events::{EventBus, QueueEvent, QueueEventKind};
pub use job::{Job, JobOptions};
pub use keys::KeyNamer;
pub use queue::Queue;
pub use settings::{QueueSettings, RedlockSettings};
pub use store::{CleanTarget, JobCounts, QueueStore};
pub use worker::{HandlerReturn, JobHandler};
