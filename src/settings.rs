use serde::{Deserialize, Serialize};

use crate::constants::{
    CLIENT_CLOSE_TIMEOUT_MS, DEFAULT_KEY_PREFIX, DEFAULT_REDIS_DSN, DEFAULT_REDLOCK_DRIFT_FACTOR,
    DEFAULT_REDLOCK_RETRY_COUNT, DEFAULT_REDLOCK_RETRY_DELAY_MS, LOCK_DURATION_MS,
    LOCK_RENEW_TIME_MS, MAX_STALLED_JOB_COUNT, MAX_TIMEOUT_MS, POLLING_INTERVAL_MS,
    STALLED_JOB_CHECK_INTERVAL_MS,
};

/// Lock tuning carried for deployments that front more than one store.
/// The dispatcher itself never retries a contended lock: a held lock means
/// another worker owns the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct RedlockSettings {
    pub drift_factor: f64,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
}

impl Default for RedlockSettings {
    fn default() -> Self {
        Self {
            drift_factor: DEFAULT_REDLOCK_DRIFT_FACTOR,
            retry_count: DEFAULT_REDLOCK_RETRY_COUNT,
            retry_delay_ms: DEFAULT_REDLOCK_RETRY_DELAY_MS,
        }
    }
}

/// All tunables of one queue instance, frozen at construction. The core
/// never reads process-wide mutable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct QueueSettings {
    /// Connection URL. Takes precedence over host/port/db/password.
    pub redis_dsn: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db: Option<u32>,
    pub password: Option<String>,

    pub key_prefix: String,
    /// Use a blocking pop in the dispatcher. Non-blocking when false.
    pub block: bool,

    pub lock_duration_ms: i64,
    pub lock_renew_time_ms: i64,
    pub stalled_job_check_interval_ms: i64,
    pub max_stalled_job_count: i64,
    pub client_close_timeout_ms: u64,
    pub polling_interval_ms: i64,
    pub max_timeout_ms: i64,

    pub redlock: RedlockSettings,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            redis_dsn: DEFAULT_REDIS_DSN.to_string(),
            host: None,
            port: None,
            db: None,
            password: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            block: true,
            lock_duration_ms: LOCK_DURATION_MS,
            lock_renew_time_ms: LOCK_RENEW_TIME_MS,
            stalled_job_check_interval_ms: STALLED_JOB_CHECK_INTERVAL_MS,
            max_stalled_job_count: MAX_STALLED_JOB_COUNT,
            client_close_timeout_ms: CLIENT_CLOSE_TIMEOUT_MS,
            polling_interval_ms: POLLING_INTERVAL_MS,
            max_timeout_ms: MAX_TIMEOUT_MS,
            redlock: RedlockSettings::default(),
        }
    }
}

impl QueueSettings {
    /// The DSN to connect with. Host/port/db/password are composed into a
    /// URL only when no explicit DSN was configured.
    pub fn connection_dsn(&self) -> String {
        if self.redis_dsn != DEFAULT_REDIS_DSN || self.host.is_none() {
            return self.redis_dsn.clone();
        }
        let host = self.host.as_deref().unwrap_or("localhost");
        let port = self.port.unwrap_or(6379);
        let db = self.db.unwrap_or(0);
        match self.password.as_deref() {
            Some(password) => format!("redis://:{password}@{host}:{port}/{db}"),
            None => format!("redis://{host}:{port}/{db}"),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.key_prefix.is_empty() {
            anyhow::bail!("key_prefix must not be empty");
        }
        if self.lock_duration_ms <= 0 {
            anyhow::bail!("lock_duration_ms must be positive");
        }
        if self.lock_renew_time_ms <= 0 || self.lock_renew_time_ms > self.lock_duration_ms {
            anyhow::bail!("lock_renew_time_ms must be positive and at most lock_duration_ms");
        }
        if self.stalled_job_check_interval_ms < 0 {
            anyhow::bail!("stalled_job_check_interval_ms must be >= 0");
        }
        if self.max_stalled_job_count < 0 {
            anyhow::bail!("max_stalled_job_count must be >= 0");
        }
        if self.polling_interval_ms <= 0 {
            anyhow::bail!("polling_interval_ms must be positive");
        }
        if self.max_timeout_ms <= 0 {
            anyhow::bail!("max_timeout_ms must be positive");
        }
        if !(0.0..1.0).contains(&self.redlock.drift_factor) {
            anyhow::bail!("redlock.drift_factor must be within [0, 1)");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let settings = QueueSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.key_prefix, "bull");
        assert!(settings.block);
        assert_eq!(settings.lock_duration_ms, 5_000);
        assert_eq!(settings.lock_renew_time_ms, 2_500);
    }

    #[test]
    fn explicit_dsn_wins_over_host_parts() {
        let settings = QueueSettings {
            redis_dsn: "redis://example.com:6380/3".to_string(),
            host: Some("ignored".to_string()),
            ..Default::default()
        };
        assert_eq!(settings.connection_dsn(), "redis://example.com:6380/3");
    }

    #[test]
    fn host_parts_compose_a_dsn() {
        let settings = QueueSettings {
            host: Some("cache.internal".to_string()),
            port: Some(6390),
            db: Some(2),
            password: Some("hunter2".to_string()),
            ..Default::default()
        };
        assert_eq!(
            settings.connection_dsn(),
            "redis://:hunter2@cache.internal:6390/2"
        );
    }

    #[test]
    fn validate_rejects_renew_longer_than_lock() {
        let settings = QueueSettings {
            lock_renew_time_ms: 10_000,
            ..Default::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("lock_renew_time_ms"));
    }

    #[test]
    fn validate_rejects_bad_drift_factor() {
        let settings = QueueSettings {
            redlock: RedlockSettings {
                drift_factor: 1.5,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
