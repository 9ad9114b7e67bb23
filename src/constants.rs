pub const DEFAULT_KEY_PREFIX: &str = "bull";

/// TTL of a job lock key, in milliseconds.
pub const LOCK_DURATION_MS: i64 = 5_000;
/// How often a held lock is re-taken before it expires.
pub const LOCK_RENEW_TIME_MS: i64 = 2_500;
/// Interval between stalled-job sweeps. Zero disables the reaper.
pub const STALLED_JOB_CHECK_INTERVAL_MS: i64 = 5_000;
/// How many times a job may stall before it is failed outright.
pub const MAX_STALLED_JOB_COUNT: i64 = 1;
/// Grace given to the blocking connection during close.
pub const CLIENT_CLOSE_TIMEOUT_MS: u64 = 5_000;
/// Guardian interval covering missed delayed-job wakeups.
pub const POLLING_INTERVAL_MS: i64 = 5_000;
/// Largest span a one-shot timer may be armed for.
pub const MAX_TIMEOUT_MS: i64 = i64::pow(2, 31) - 1;

pub const DEFAULT_REDIS_DSN: &str = "redis://localhost:6379/0";

/// Minimum server version the queue refuses to run below.
pub const MIN_REDIS_VERSION: (u64, u64, u64) = (2, 8, 11);

pub const STALL_LIMIT_REASON: &str = "job stalled more than allowable limit";

pub const DEFAULT_REDLOCK_DRIFT_FACTOR: f64 = 0.01;
pub const DEFAULT_REDLOCK_RETRY_COUNT: u32 = 3;
pub const DEFAULT_REDLOCK_RETRY_DELAY_MS: u64 = 100;
