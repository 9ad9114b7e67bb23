use std::collections::HashMap;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::QueueStore;

/// Per-job options supplied at enqueue time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct JobOptions {
    /// Delay before the job becomes consumable, in milliseconds.
    pub delay: Option<i64>,
    /// Placement hint consulted on enqueue. Higher runs sooner, best-effort.
    pub priority: Option<i64>,
    /// Handler deadline in milliseconds; the handler is raced against it.
    pub timeout: Option<u64>,
    /// Total runs allowed across explicit retries. Zero means unbounded.
    pub attempts: i64,
}

/// A uniquely identified unit of work with a JSON payload, options, and
/// retry state. Holds no reference back to the queue; every method takes
/// the store it operates on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub data: Value,
    #[serde(default)]
    pub opts: JobOptions,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub attempts_made: i64,
    /// Total runs allowed across explicit retries. Zero means unbounded.
    #[serde(default)]
    pub max_attempts: i64,
    #[serde(default)]
    pub stalled_count: i64,
    pub timestamp: i64,
    #[serde(default)]
    pub delay: i64,
    /// Placement hint recorded in the priority set on enqueue.
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub return_value: Option<Value>,
    #[serde(default)]
    pub failed_reason: Option<String>,
    #[serde(default)]
    pub finished_on: Option<i64>,
}

impl Job {
    /// Create and enqueue a job: allocate an id, persist the payload
    /// record, then route the id to wait (or paused) or to the delayed
    /// set when a delay was requested.
    pub async fn create(store: &QueueStore, data: Value, opts: JobOptions) -> Result<Job> {
        let id = store.next_job_id().await?;
        let job = Job {
            id,
            data,
            delay: opts.delay.unwrap_or(0).max(0),
            max_attempts: opts.attempts.max(0),
            priority: opts.priority,
            opts,
            progress: 0.0,
            attempts_made: 0,
            stalled_count: 0,
            timestamp: Utc::now().timestamp_millis(),
            return_value: None,
            failed_reason: None,
            finished_on: None,
        };
        store.create_job_record(&job.id, &job.to_hash_fields()?).await?;

        if job.delay > 0 {
            store.add_delayed_job(&job.id, job.release_ts()).await?;
        } else {
            store.add_job(&job.id, job.priority).await?;
        }
        Ok(job)
    }

    pub async fn from_id(store: &QueueStore, job_id: &str) -> Result<Option<Job>> {
        let map = match store.fetch_job_map(job_id).await? {
            Some(map) => map,
            None => return Ok(None),
        };
        Ok(Some(Self::from_hash(job_id, map)))
    }

    /// Rehydrate a job snapshot from its serialized JSON form, as carried
    /// on the distributed event channels.
    pub fn from_json(payload: &str) -> Result<Job> {
        let job: Job = serde_json::from_str(payload)?;
        Ok(job)
    }

    /// Lenient hash parsing: a record written by an older writer may lack
    /// fields; absent or malformed values fall back to defaults.
    pub fn from_hash(job_id: &str, raw: HashMap<String, String>) -> Job {
        let data = raw
            .get("data")
            .and_then(|value| serde_json::from_str(value).ok())
            .unwrap_or(Value::Null);
        let opts = raw
            .get("opts")
            .and_then(|value| serde_json::from_str(value).ok())
            .unwrap_or_default();
        let return_value = raw
            .get("return_value")
            .and_then(|value| serde_json::from_str(value).ok());
        Job {
            id: raw
                .get("id")
                .cloned()
                .unwrap_or_else(|| job_id.to_string()),
            data,
            opts,
            progress: parse_field(&raw, "progress"),
            attempts_made: parse_field(&raw, "attempts_made"),
            max_attempts: parse_field(&raw, "max_attempts"),
            stalled_count: parse_field(&raw, "stalled_count"),
            timestamp: parse_field(&raw, "timestamp"),
            delay: parse_field(&raw, "delay"),
            priority: raw.get("priority").and_then(|value| value.parse().ok()),
            return_value,
            failed_reason: raw.get("failed_reason").cloned(),
            finished_on: raw.get("finished_on").and_then(|value| value.parse().ok()),
        }
    }

    pub fn to_hash_fields(&self) -> Result<Vec<(String, String)>> {
        let mut fields = vec![
            ("id".to_string(), self.id.clone()),
            ("data".to_string(), serde_json::to_string(&self.data)?),
            ("opts".to_string(), serde_json::to_string(&self.opts)?),
            ("progress".to_string(), self.progress.to_string()),
            ("attempts_made".to_string(), self.attempts_made.to_string()),
            ("max_attempts".to_string(), self.max_attempts.to_string()),
            ("stalled_count".to_string(), self.stalled_count.to_string()),
            ("timestamp".to_string(), self.timestamp.to_string()),
            ("delay".to_string(), self.delay.to_string()),
        ];
        if let Some(value) = self.priority {
            fields.push(("priority".to_string(), value.to_string()));
        }
        if let Some(value) = self.return_value.as_ref() {
            fields.push(("return_value".to_string(), serde_json::to_string(value)?));
        }
        if let Some(value) = self.failed_reason.as_ref() {
            fields.push(("failed_reason".to_string(), value.clone()));
        }
        if let Some(value) = self.finished_on {
            fields.push(("finished_on".to_string(), value.to_string()));
        }
        Ok(fields)
    }

    /// The instant a delayed job becomes consumable, in epoch ms.
    pub fn release_ts(&self) -> i64 {
        self.timestamp + self.delay
    }

    pub async fn take_lock(
        &self,
        store: &QueueStore,
        token: &str,
        ttl_ms: i64,
        ensure_active: bool,
        renew: bool,
    ) -> Result<bool> {
        store
            .take_lock(&self.id, token, ttl_ms, ensure_active, renew)
            .await
    }

    pub async fn release_lock(&self, store: &QueueStore, token: &str) -> Result<bool> {
        store.release_lock(&self.id, token).await
    }

    pub async fn move_to_completed(
        &mut self,
        store: &QueueStore,
        return_value: &str,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        store.move_to_completed(&self.id, return_value, now).await?;
        self.return_value = serde_json::from_str(return_value).ok();
        self.finished_on = Some(now);
        Ok(())
    }

    pub async fn move_to_failed(&mut self, store: &QueueStore, reason: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        store.move_to_failed(&self.id, reason, now).await?;
        self.failed_reason = Some(reason.to_string());
        self.finished_on = Some(now);
        Ok(())
    }

    /// Move a failed job back to wait. Honors the attempts budget when one
    /// was configured.
    pub async fn retry(&mut self, store: &QueueStore) -> Result<()> {
        if self.max_attempts > 0 && self.attempts_made >= self.max_attempts {
            anyhow::bail!(
                "job {} exhausted its {} allowed attempts",
                self.id,
                self.max_attempts
            );
        }
        let retried = store.retry_job(&self.id).await?;
        if !retried {
            anyhow::bail!("job {} is not in failed", self.id);
        }
        self.attempts_made += 1;
        self.failed_reason = None;
        self.finished_on = None;
        Ok(())
    }

    pub async fn remove(&self, store: &QueueStore) -> Result<()> {
        store.remove_job(&self.id).await
    }

    pub async fn report_progress(&mut self, store: &QueueStore, progress: f64) -> Result<()> {
        store
            .set_job_field(&self.id, "progress", &progress.to_string())
            .await?;
        self.progress = progress;
        Ok(())
    }
}

fn parse_field<T: std::str::FromStr + Default>(raw: &HashMap<String, String>, field: &str) -> T {
    raw.get(field)
        .and_then(|value| value.parse().ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RedisTestContext;
    use serde_json::json;

    #[test]
    fn hash_fields_round_trip() {
        let job = Job {
            id: "7".to_string(),
            data: json!({"x": 1}),
            opts: JobOptions {
                priority: Some(3),
                timeout: Some(500),
                ..Default::default()
            },
            progress: 42.0,
            attempts_made: 1,
            max_attempts: 3,
            stalled_count: 0,
            timestamp: 1_700_000_000_000,
            delay: 250,
            priority: Some(3),
            return_value: Some(json!("done")),
            failed_reason: None,
            finished_on: Some(1_700_000_001_000),
        };
        let fields: HashMap<String, String> =
            job.to_hash_fields().unwrap().into_iter().collect();
        let parsed = Job::from_hash("7", fields);
        assert_eq!(parsed.id, job.id);
        assert_eq!(parsed.data, job.data);
        assert_eq!(parsed.opts, job.opts);
        assert_eq!(parsed.progress, job.progress);
        assert_eq!(parsed.max_attempts, job.max_attempts);
        assert_eq!(parsed.timestamp, job.timestamp);
        assert_eq!(parsed.delay, job.delay);
        assert_eq!(parsed.priority, job.priority);
        assert_eq!(parsed.return_value, job.return_value);
        assert_eq!(parsed.finished_on, job.finished_on);
    }

    #[test]
    fn from_hash_tolerates_missing_fields() {
        let mut raw = HashMap::new();
        raw.insert("data".to_string(), "{\"y\":2}".to_string());
        let job = Job::from_hash("9", raw);
        assert_eq!(job.id, "9");
        assert_eq!(job.data, json!({"y": 2}));
        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.max_attempts, 0);
        assert_eq!(job.delay, 0);
        assert_eq!(job.priority, None);
        assert!(job.failed_reason.is_none());
    }

    #[test]
    fn from_json_rehydrates_snapshot() {
        let payload = r#"{"id":"3","data":{"k":"v"},"timestamp":123}"#;
        let job = Job::from_json(payload).unwrap();
        assert_eq!(job.id, "3");
        assert_eq!(job.data, json!({"k": "v"}));
        assert_eq!(job.timestamp, 123);
    }

    #[tokio::test]
    async fn create_then_from_id_returns_equal_payload() {
        let ctx = RedisTestContext::new().await.unwrap();
        let job = Job::create(&ctx.store, json!({"x": 1}), JobOptions::default())
            .await
            .unwrap();
        assert_eq!(job.id, "1");
        assert_eq!(ctx.store.wait_ids().await.unwrap(), vec!["1".to_string()]);

        let loaded = Job::from_id(&ctx.store, &job.id).await.unwrap().unwrap();
        assert_eq!(loaded.data, json!({"x": 1}));
        assert_eq!(loaded.timestamp, job.timestamp);
    }

    #[tokio::test]
    async fn create_with_delay_routes_to_delayed() {
        let ctx = RedisTestContext::new().await.unwrap();
        let job = Job::create(
            &ctx.store,
            json!(1),
            JobOptions {
                delay: Some(60_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(ctx.store.wait_ids().await.unwrap().is_empty());
        assert_eq!(
            ctx.store.delayed_ids().await.unwrap(),
            vec![job.id.clone()]
        );
        assert_eq!(
            ctx.store.next_delayed_ts().await.unwrap(),
            Some(job.release_ts())
        );
    }

    #[tokio::test]
    async fn retry_honors_attempts_budget() {
        let ctx = RedisTestContext::new().await.unwrap();
        let mut job = Job::create(
            &ctx.store,
            json!(null),
            JobOptions {
                attempts: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let mut conn = ctx.store.raw_connection();
        ctx.store.move_to_active(&mut conn).await.unwrap();
        job.move_to_failed(&ctx.store, "boom").await.unwrap();

        job.retry(&ctx.store).await.unwrap();
        assert_eq!(job.attempts_made, 1);
        assert_eq!(ctx.store.wait_ids().await.unwrap(), vec![job.id.clone()]);

        ctx.store.move_to_active(&mut conn).await.unwrap();
        job.move_to_failed(&ctx.store, "boom again").await.unwrap();
        let err = job.retry(&ctx.store).await.unwrap_err();
        assert!(err.to_string().contains("exhausted"));
    }

    #[tokio::test]
    async fn retry_outside_failed_is_an_error() {
        let ctx = RedisTestContext::new().await.unwrap();
        let mut job = Job::create(&ctx.store, json!(null), JobOptions::default())
            .await
            .unwrap();
        let err = job.retry(&ctx.store).await.unwrap_err();
        assert!(err.to_string().contains("not in failed"));
    }

    #[tokio::test]
    async fn report_progress_persists_value() {
        let ctx = RedisTestContext::new().await.unwrap();
        let mut job = Job::create(&ctx.store, json!(null), JobOptions::default())
            .await
            .unwrap();
        job.report_progress(&ctx.store, 75.0).await.unwrap();
        let loaded = Job::from_id(&ctx.store, &job.id).await.unwrap().unwrap();
        assert_eq!(loaded.progress, 75.0);
    }
}
