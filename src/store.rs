use std::collections::HashMap;

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use serde::Serialize;

use crate::constants::MIN_REDIS_VERSION;
use crate::keys::KeyNamer;

const ADD_JOB_LUA: &str = include_str!("lua/add_job.lua");
const UPDATE_DELAY_SET_LUA: &str = include_str!("lua/update_delay_set.lua");
const MOVE_UNLOCKED_JOBS_TO_WAIT_LUA: &str = include_str!("lua/move_unlocked_jobs_to_wait.lua");
const PAUSE_RESUME_LUA: &str = include_str!("lua/pause_resume.lua");
const TAKE_LOCK_LUA: &str = include_str!("lua/take_lock.lua");
const RELEASE_LOCK_LUA: &str = include_str!("lua/release_lock.lua");
const MOVE_TO_COMPLETED_LUA: &str = include_str!("lua/move_to_completed.lua");
const MOVE_TO_FAILED_LUA: &str = include_str!("lua/move_to_failed.lua");
const RETRY_JOB_LUA: &str = include_str!("lua/retry_job.lua");
const REMOVE_JOB_LUA: &str = include_str!("lua/remove_job.lua");
const CLEAN_JOBS_IN_SET_LUA: &str = include_str!("lua/clean_jobs_in_set.lua");

#[cfg(test)]
pub(crate) const ALL_LUA_SCRIPTS: [&str; 11] = [
    ADD_JOB_LUA,
    UPDATE_DELAY_SET_LUA,
    MOVE_UNLOCKED_JOBS_TO_WAIT_LUA,
    PAUSE_RESUME_LUA,
    TAKE_LOCK_LUA,
    RELEASE_LOCK_LUA,
    MOVE_TO_COMPLETED_LUA,
    MOVE_TO_FAILED_LUA,
    RETRY_JOB_LUA,
    REMOVE_JOB_LUA,
    CLEAN_JOBS_IN_SET_LUA,
];

/// Collections `clean` may target, with the hash field carrying the
/// timestamp the age cutoff compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanTarget {
    Completed,
    Failed,
    Wait,
    Active,
    Delayed,
}

impl CleanTarget {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "completed" => Some(CleanTarget::Completed),
            "failed" => Some(CleanTarget::Failed),
            "wait" => Some(CleanTarget::Wait),
            "active" => Some(CleanTarget::Active),
            "delayed" => Some(CleanTarget::Delayed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CleanTarget::Completed => "completed",
            CleanTarget::Failed => "failed",
            CleanTarget::Wait => "wait",
            CleanTarget::Active => "active",
            CleanTarget::Delayed => "delayed",
        }
    }

    fn collection_kind(&self) -> &'static str {
        match self {
            CleanTarget::Completed | CleanTarget::Failed => "set",
            CleanTarget::Wait | CleanTarget::Active => "list",
            CleanTarget::Delayed => "zset",
        }
    }

    fn timestamp_field(&self) -> &'static str {
        match self {
            CleanTarget::Completed | CleanTarget::Failed => "finished_on",
            _ => "timestamp",
        }
    }
}

/// Per-collection sizes as reported by `Queue::get_job_counts`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub wait: i64,
    pub paused: i64,
    pub active: i64,
    pub delayed: i64,
    pub completed: i64,
    pub failed: i64,
}

/// The general store session of one queue: a multiplexed connection plus
/// the compiled atomic scripts. Cheap to clone into tasks; the dedicated
/// blocking connection is owned by the queue, not by this type.
#[derive(Clone)]
pub struct QueueStore {
    keys: KeyNamer,
    conn: MultiplexedConnection,
    add_job_script: Script,
    update_delay_set_script: Script,
    move_unlocked_script: Script,
    pause_resume_script: Script,
    take_lock_script: Script,
    release_lock_script: Script,
    move_to_completed_script: Script,
    move_to_failed_script: Script,
    retry_job_script: Script,
    remove_job_script: Script,
    clean_jobs_script: Script,
}

impl QueueStore {
    pub async fn new(dsn: &str, keys: KeyNamer) -> Result<Self> {
        let client =
            redis::Client::open(dsn).with_context(|| "failed to create store client")?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .with_context(|| format!("failed to connect to store ({})", summarize_dsn(dsn)))?;
        Ok(Self::with_connection(keys, conn))
    }

    pub fn with_connection(keys: KeyNamer, conn: MultiplexedConnection) -> Self {
        Self {
            keys,
            conn,
            add_job_script: Script::new(ADD_JOB_LUA),
            update_delay_set_script: Script::new(UPDATE_DELAY_SET_LUA),
            move_unlocked_script: Script::new(MOVE_UNLOCKED_JOBS_TO_WAIT_LUA),
            pause_resume_script: Script::new(PAUSE_RESUME_LUA),
            take_lock_script: Script::new(TAKE_LOCK_LUA),
            release_lock_script: Script::new(RELEASE_LOCK_LUA),
            move_to_completed_script: Script::new(MOVE_TO_COMPLETED_LUA),
            move_to_failed_script: Script::new(MOVE_TO_FAILED_LUA),
            retry_job_script: Script::new(RETRY_JOB_LUA),
            remove_job_script: Script::new(REMOVE_JOB_LUA),
            clean_jobs_script: Script::new(CLEAN_JOBS_IN_SET_LUA),
        }
    }

    pub fn keys(&self) -> &KeyNamer {
        &self.keys
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    /// Job key prefix handed to scripts that build keys from ids.
    fn job_key_prefix(&self) -> String {
        self.keys.job("")
    }

    // ---- server ----

    pub async fn server_version(&self) -> Result<(u64, u64, u64)> {
        let mut conn = self.conn();
        let info: String = redis::cmd("INFO")
            .arg("server")
            .query_async(&mut conn)
            .await?;
        parse_server_version(&info)
            .ok_or_else(|| anyhow::anyhow!("store did not report a redis_version"))
    }

    pub async fn check_server_version(&self) -> Result<()> {
        let version = self.server_version().await?;
        if version < MIN_REDIS_VERSION {
            let (major, minor, patch) = version;
            let (min_major, min_minor, min_patch) = MIN_REDIS_VERSION;
            anyhow::bail!(
                "store version {major}.{minor}.{patch} is below the minimum \
                 {min_major}.{min_minor}.{min_patch}"
            );
        }
        Ok(())
    }

    // ---- job records ----

    pub async fn next_job_id(&self) -> Result<String> {
        let mut conn = self.conn();
        let id: i64 = conn.incr(self.keys.id(), 1).await?;
        Ok(id.to_string())
    }

    pub async fn create_job_record(
        &self,
        job_id: &str,
        fields: &[(String, String)],
    ) -> Result<()> {
        let mut conn = self.conn();
        let mapping: Vec<(&str, &str)> = fields
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();
        let _: () = conn.hset_multiple(self.keys.job(job_id), &mapping).await?;
        Ok(())
    }

    pub async fn fetch_job_map(&self, job_id: &str) -> Result<Option<HashMap<String, String>>> {
        let mut conn = self.conn();
        let raw: HashMap<String, String> = conn.hgetall(self.keys.job(job_id)).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        Ok(Some(raw))
    }

    pub async fn fetch_job_maps(
        &self,
        job_ids: &[String],
    ) -> Result<Vec<Option<HashMap<String, String>>>> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        for job_id in job_ids {
            pipe.hgetall(self.keys.job(job_id));
        }
        let results: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;
        Ok(results
            .into_iter()
            .map(|map| if map.is_empty() { None } else { Some(map) })
            .collect())
    }

    pub async fn set_job_field(&self, job_id: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.hset(self.keys.job(job_id), field, value).await?;
        Ok(())
    }

    // ---- enqueue / delay ----

    /// Place a new id into wait (or paused while globally paused) and
    /// record its priority. Returns the list the id landed in.
    pub async fn add_job(&self, job_id: &str, priority: Option<i64>) -> Result<String> {
        let mut conn = self.conn();
        let priority_arg = priority.map(|p| p.to_string()).unwrap_or_default();
        let target: String = self
            .add_job_script
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.meta_paused())
            .key(self.keys.priority())
            .arg(job_id)
            .arg(priority_arg)
            .invoke_async(&mut conn)
            .await?;
        Ok(target)
    }

    /// Schedule an id for later release and notify every instance of the
    /// (possibly new) earliest release timestamp.
    pub async fn add_delayed_job(&self, job_id: &str, release_ts: i64) -> Result<()> {
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.zadd(self.keys.delayed(), job_id, release_ts);
        pipe.publish(self.keys.delayed_channel(), release_ts.to_string());
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn update_delay_set(&self, now: i64) -> Result<Option<i64>> {
        let mut conn = self.conn();
        let next: Option<i64> = self
            .update_delay_set_script
            .key(self.keys.delayed())
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.meta_paused())
            .arg(now)
            .invoke_async(&mut conn)
            .await?;
        Ok(next)
    }

    /// The earliest delayed release timestamp, if any.
    pub async fn next_delayed_ts(&self) -> Result<Option<i64>> {
        let mut conn = self.conn();
        let head: Vec<(String, f64)> = conn
            .zrange_withscores(self.keys.delayed(), 0, 0)
            .await?;
        Ok(head.first().map(|(_, score)| *score as i64))
    }

    // ---- dispatch ----

    /// Blocking `wait -> active` move on the dedicated blocking session.
    pub async fn move_to_active_blocking(
        &self,
        conn: &mut MultiplexedConnection,
        timeout_secs: f64,
    ) -> Result<Option<String>> {
        let popped: Option<String> = conn
            .brpoplpush(self.keys.wait(), self.keys.active(), timeout_secs)
            .await?;
        Ok(popped)
    }

    /// Non-blocking `wait -> active` move.
    pub async fn move_to_active(
        &self,
        conn: &mut MultiplexedConnection,
    ) -> Result<Option<String>> {
        let popped: Option<String> = conn
            .rpoplpush(self.keys.wait(), self.keys.active())
            .await?;
        Ok(popped)
    }

    /// Best-effort priority trim after a pop. Not atomic with the move.
    pub async fn remove_priority(&self, job_id: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = conn.zrem(self.keys.priority(), job_id).await?;
        Ok(())
    }

    pub async fn remove_from_active(&self, job_id: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = conn.lrem(self.keys.active(), 1, job_id).await?;
        Ok(())
    }

    // ---- locks ----

    pub async fn take_lock(
        &self,
        job_id: &str,
        token: &str,
        ttl_ms: i64,
        ensure_active: bool,
        renew: bool,
    ) -> Result<bool> {
        let mut conn = self.conn();
        let taken: i64 = self
            .take_lock_script
            .key(self.keys.lock(job_id))
            .key(self.keys.active())
            .arg(token)
            .arg(ttl_ms)
            .arg(if ensure_active { "1" } else { "0" })
            .arg(job_id)
            .arg(if renew { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;
        Ok(taken != 0)
    }

    pub async fn release_lock(&self, job_id: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn();
        let released: i64 = self
            .release_lock_script
            .key(self.keys.lock(job_id))
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(released != 0)
    }

    pub async fn lock_owner(&self, job_id: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        let owner: Option<String> = conn.get(self.keys.lock(job_id)).await?;
        Ok(owner)
    }

    // ---- finalization ----

    pub async fn move_to_completed(
        &self,
        job_id: &str,
        return_value: &str,
        now: i64,
    ) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = self
            .move_to_completed_script
            .key(self.keys.active())
            .key(self.keys.completed())
            .key(self.keys.job(job_id))
            .arg(job_id)
            .arg(return_value)
            .arg(now)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn move_to_failed(&self, job_id: &str, reason: &str, now: i64) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = self
            .move_to_failed_script
            .key(self.keys.active())
            .key(self.keys.failed())
            .key(self.keys.job(job_id))
            .arg(job_id)
            .arg(reason)
            .arg(now)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn retry_job(&self, job_id: &str) -> Result<bool> {
        let mut conn = self.conn();
        let retried: i64 = self
            .retry_job_script
            .key(self.keys.failed())
            .key(self.keys.wait())
            .key(self.keys.job(job_id))
            .arg(job_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(retried != 0)
    }

    pub async fn remove_job(&self, job_id: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = self
            .remove_job_script
            .key(self.keys.wait())
            .key(self.keys.active())
            .key(self.keys.paused())
            .key(self.keys.delayed())
            .key(self.keys.priority())
            .key(self.keys.completed())
            .key(self.keys.failed())
            .key(self.keys.job(job_id))
            .key(self.keys.lock(job_id))
            .arg(job_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    // ---- reaper ----

    pub async fn move_unlocked_jobs_to_wait(
        &self,
        max_stalled_count: i64,
        now: i64,
        stall_reason: &str,
    ) -> Result<(Vec<String>, Vec<String>)> {
        let mut conn = self.conn();
        let (failed, stalled): (Vec<String>, Vec<String>) = self
            .move_unlocked_script
            .key(self.keys.active())
            .key(self.keys.wait())
            .key(self.keys.failed())
            .arg(self.job_key_prefix())
            .arg(max_stalled_count)
            .arg(now)
            .arg(stall_reason)
            .invoke_async(&mut conn)
            .await?;
        Ok((failed, stalled))
    }

    // ---- pause / resume ----

    pub async fn pause_resume(&self, pause: bool) -> Result<()> {
        let mut conn = self.conn();
        let (src, dst, mode) = if pause {
            (self.keys.wait(), self.keys.paused(), "paused")
        } else {
            (self.keys.paused(), self.keys.wait(), "resumed")
        };
        let _: i64 = self
            .pause_resume_script
            .key(src)
            .key(dst)
            .key(self.keys.meta_paused())
            .key(self.keys.paused_channel())
            .arg(mode)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    // ---- maintenance ----

    pub async fn clean_jobs_in_set(
        &self,
        target: CleanTarget,
        older_than: i64,
        limit: i64,
    ) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let collection = self.keys.key(target.as_str());
        let removed: Vec<String> = self
            .clean_jobs_script
            .key(collection)
            .arg(self.job_key_prefix())
            .arg(older_than)
            .arg(limit)
            .arg(target.collection_kind())
            .arg(target.timestamp_field())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed)
    }

    /// Best-effort truncation of wait, paused, delayed, and the paused
    /// marker, deleting the payload records of the dropped ids.
    pub async fn empty(&self) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.lrange(self.keys.wait(), 0, -1);
        pipe.lrange(self.keys.paused(), 0, -1);
        pipe.zrange(self.keys.delayed(), 0, -1);
        let (wait_ids, paused_ids, delayed_ids): (Vec<String>, Vec<String>, Vec<String>) =
            pipe.query_async(&mut conn).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(self.keys.wait());
        pipe.del(self.keys.paused());
        pipe.del(self.keys.delayed());
        pipe.del(self.keys.meta_paused());
        let _: () = pipe.query_async(&mut conn).await?;

        let mut removed = wait_ids;
        removed.extend(paused_ids);
        removed.extend(delayed_ids);
        if !removed.is_empty() {
            let job_keys: Vec<String> = removed.iter().map(|id| self.keys.job(id)).collect();
            let _: i64 = conn.del(job_keys).await?;
        }
        Ok(removed)
    }

    // ---- introspection ----

    pub async fn job_counts(&self) -> Result<JobCounts> {
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.llen(self.keys.wait());
        pipe.llen(self.keys.paused());
        pipe.llen(self.keys.active());
        pipe.zcard(self.keys.delayed());
        pipe.scard(self.keys.completed());
        pipe.scard(self.keys.failed());
        let (wait, paused, active, delayed, completed, failed): (i64, i64, i64, i64, i64, i64) =
            pipe.query_async(&mut conn).await?;
        Ok(JobCounts {
            wait,
            paused,
            active,
            delayed,
            completed,
            failed,
        })
    }

    /// `max(len(wait), len(paused)) + len(delayed)`.
    pub async fn count(&self) -> Result<i64> {
        let counts = self.job_counts().await?;
        Ok(counts.wait.max(counts.paused) + counts.delayed)
    }

    pub async fn wait_ids(&self) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn.lrange(self.keys.wait(), 0, -1).await?;
        Ok(ids)
    }

    pub async fn paused_ids(&self) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn.lrange(self.keys.paused(), 0, -1).await?;
        Ok(ids)
    }

    pub async fn active_ids(&self) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn.lrange(self.keys.active(), 0, -1).await?;
        Ok(ids)
    }

    pub async fn delayed_ids(&self) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn.zrange(self.keys.delayed(), 0, -1).await?;
        Ok(ids)
    }

    pub async fn completed_ids(&self) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn.smembers(self.keys.completed()).await?;
        Ok(ids)
    }

    pub async fn failed_ids(&self) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn.smembers(self.keys.failed()).await?;
        Ok(ids)
    }

    pub async fn is_meta_paused(&self) -> Result<bool> {
        let mut conn = self.conn();
        let exists: bool = conn.exists(self.keys.meta_paused()).await?;
        Ok(exists)
    }

    // ---- pub/sub ----

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn flushdb(&self) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("FLUSHDB").query_async::<()>(&mut conn).await?;
        Ok(())
    }

    #[cfg(test)]
    pub fn raw_connection(&self) -> MultiplexedConnection {
        self.conn()
    }
}

fn parse_server_version(info: &str) -> Option<(u64, u64, u64)> {
    let line = info
        .lines()
        .find_map(|line| line.trim().strip_prefix("redis_version:"))?;
    let mut parts = line.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().unwrap_or("0").parse().ok()?;
    let patch = parts.next().unwrap_or("0").parse().ok()?;
    Some((major, minor, patch))
}

fn summarize_dsn(dsn: &str) -> String {
    let (scheme, rest) = dsn.split_once("://").unwrap_or(("", dsn));
    let without_auth = rest.rsplit('@').next().unwrap_or(rest);
    let host = without_auth
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(without_auth);

    if scheme.is_empty() {
        host.to_string()
    } else {
        format!("{scheme}://{host}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RedisTestContext;
    use chrono::Utc;

    #[test]
    fn parse_server_version_reads_info_payload() {
        let info = "# Server\r\nredis_version:7.2.4\r\nredis_mode:standalone\r\n";
        assert_eq!(parse_server_version(info), Some((7, 2, 4)));
        assert_eq!(parse_server_version("no version here"), None);
    }

    #[test]
    fn summarize_dsn_strips_credentials() {
        assert_eq!(
            summarize_dsn("redis://:secret@cache.internal:6379/2"),
            "redis://cache.internal:6379"
        );
        assert_eq!(summarize_dsn("localhost:6379"), "localhost:6379");
    }

    #[test]
    fn clean_target_parse_rejects_unknown() {
        assert_eq!(CleanTarget::parse("completed"), Some(CleanTarget::Completed));
        assert_eq!(CleanTarget::parse("paused"), None);
    }

    #[tokio::test]
    async fn lua_scripts_compile_in_redis() {
        let ctx = RedisTestContext::new().await.unwrap();
        let mut conn = ctx.store.raw_connection();
        for script in ALL_LUA_SCRIPTS {
            let sha: String = redis::cmd("SCRIPT")
                .arg("LOAD")
                .arg(script)
                .query_async(&mut conn)
                .await
                .unwrap();
            assert_eq!(sha.len(), 40);
        }
    }

    #[tokio::test]
    async fn server_version_meets_minimum() {
        let ctx = RedisTestContext::new().await.unwrap();
        ctx.store.check_server_version().await.unwrap();
    }

    #[tokio::test]
    async fn add_job_routes_to_wait_and_records_priority() {
        let ctx = RedisTestContext::new().await.unwrap();
        let target = ctx.store.add_job("1", Some(10)).await.unwrap();
        assert_eq!(target, ctx.store.keys().wait());
        assert_eq!(ctx.store.wait_ids().await.unwrap(), vec!["1".to_string()]);

        let mut conn = ctx.store.raw_connection();
        let score: Option<f64> = conn
            .zscore(ctx.store.keys().priority(), "1")
            .await
            .unwrap();
        assert_eq!(score, Some(10.0));
    }

    #[tokio::test]
    async fn add_job_routes_to_paused_while_meta_paused() {
        let ctx = RedisTestContext::new().await.unwrap();
        ctx.store.pause_resume(true).await.unwrap();
        let target = ctx.store.add_job("1", None).await.unwrap();
        assert_eq!(target, ctx.store.keys().paused());
        assert!(ctx.store.wait_ids().await.unwrap().is_empty());
        assert_eq!(ctx.store.paused_ids().await.unwrap(), vec!["1".to_string()]);

        ctx.store.pause_resume(false).await.unwrap();
        assert!(!ctx.store.is_meta_paused().await.unwrap());
        assert_eq!(ctx.store.wait_ids().await.unwrap(), vec!["1".to_string()]);
    }

    #[tokio::test]
    async fn update_delay_set_promotes_ready_ids_and_reports_next() {
        let ctx = RedisTestContext::new().await.unwrap();
        let now = Utc::now().timestamp_millis();
        ctx.store.add_delayed_job("1", now - 50).await.unwrap();
        ctx.store.add_delayed_job("2", now + 60_000).await.unwrap();

        let next = ctx.store.update_delay_set(now).await.unwrap();
        assert_eq!(next, Some(now + 60_000));
        assert_eq!(ctx.store.wait_ids().await.unwrap(), vec!["1".to_string()]);
        assert_eq!(
            ctx.store.delayed_ids().await.unwrap(),
            vec!["2".to_string()]
        );

        let next_again = ctx.store.update_delay_set(now).await.unwrap();
        assert_eq!(next_again, Some(now + 60_000));
        assert_eq!(ctx.store.next_delayed_ts().await.unwrap(), Some(now + 60_000));
    }

    #[tokio::test]
    async fn take_lock_requires_absence_unless_renewing() {
        let ctx = RedisTestContext::new().await.unwrap();
        let taken = ctx
            .store
            .take_lock("1", "token-a", 5_000, false, false)
            .await
            .unwrap();
        assert!(taken);
        assert_eq!(
            ctx.store.lock_owner("1").await.unwrap(),
            Some("token-a".to_string())
        );

        let stolen = ctx
            .store
            .take_lock("1", "token-b", 5_000, false, false)
            .await
            .unwrap();
        assert!(!stolen);

        let renewed_by_other = ctx
            .store
            .take_lock("1", "token-b", 5_000, false, true)
            .await
            .unwrap();
        assert!(!renewed_by_other);

        let renewed = ctx
            .store
            .take_lock("1", "token-a", 5_000, false, true)
            .await
            .unwrap();
        assert!(renewed);
    }

    #[tokio::test]
    async fn take_lock_with_ensure_active_requires_checkout() {
        let ctx = RedisTestContext::new().await.unwrap();
        let taken = ctx
            .store
            .take_lock("1", "token-a", 5_000, true, false)
            .await
            .unwrap();
        assert!(!taken);

        ctx.store.add_job("1", None).await.unwrap();
        let mut conn = ctx.store.raw_connection();
        let popped: Option<String> = ctx.store.move_to_active(&mut conn).await.unwrap();
        assert_eq!(popped.as_deref(), Some("1"));

        let taken = ctx
            .store
            .take_lock("1", "token-a", 5_000, true, false)
            .await
            .unwrap();
        assert!(taken);
    }

    #[tokio::test]
    async fn release_lock_is_token_checked() {
        let ctx = RedisTestContext::new().await.unwrap();
        ctx.store
            .take_lock("1", "token-a", 5_000, false, false)
            .await
            .unwrap();
        assert!(!ctx.store.release_lock("1", "token-b").await.unwrap());
        assert!(ctx.store.release_lock("1", "token-a").await.unwrap());
        assert_eq!(ctx.store.lock_owner("1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn finalization_moves_between_collections() {
        let ctx = RedisTestContext::new().await.unwrap();
        let now = Utc::now().timestamp_millis();
        ctx.store.add_job("1", None).await.unwrap();
        let mut conn = ctx.store.raw_connection();
        ctx.store.move_to_active(&mut conn).await.unwrap();

        ctx.store.move_to_completed("1", "{\"ok\":true}", now).await.unwrap();
        assert!(ctx.store.active_ids().await.unwrap().is_empty());
        assert_eq!(
            ctx.store.completed_ids().await.unwrap(),
            vec!["1".to_string()]
        );

        ctx.store.add_job("2", None).await.unwrap();
        ctx.store.move_to_active(&mut conn).await.unwrap();
        ctx.store.move_to_failed("2", "boom", now).await.unwrap();
        assert_eq!(ctx.store.failed_ids().await.unwrap(), vec!["2".to_string()]);

        assert!(ctx.store.retry_job("2").await.unwrap());
        assert!(ctx.store.failed_ids().await.unwrap().is_empty());
        assert_eq!(ctx.store.wait_ids().await.unwrap(), vec!["2".to_string()]);
        assert!(!ctx.store.retry_job("2").await.unwrap());
    }

    #[tokio::test]
    async fn reaper_moves_unlocked_active_ids() {
        let ctx = RedisTestContext::new().await.unwrap();
        let now = Utc::now().timestamp_millis();
        ctx.store.add_job("1", None).await.unwrap();
        ctx.store.add_job("2", None).await.unwrap();
        let mut conn = ctx.store.raw_connection();
        ctx.store.move_to_active(&mut conn).await.unwrap();
        ctx.store.move_to_active(&mut conn).await.unwrap();

        // "2" is actively locked, "1" has no lock and stalls.
        ctx.store
            .take_lock("2", "token-a", 5_000, true, false)
            .await
            .unwrap();

        let (failed, stalled) = ctx
            .store
            .move_unlocked_jobs_to_wait(1, now, "stalled")
            .await
            .unwrap();
        assert!(failed.is_empty());
        assert_eq!(stalled, vec!["1".to_string()]);
        assert_eq!(ctx.store.wait_ids().await.unwrap(), vec!["1".to_string()]);

        // A second unlocked sweep exceeds the allowed stall count.
        ctx.store.move_to_active(&mut conn).await.unwrap();
        let (failed, stalled) = ctx
            .store
            .move_unlocked_jobs_to_wait(1, now, "stalled")
            .await
            .unwrap();
        assert_eq!(failed, vec!["1".to_string()]);
        assert!(stalled.is_empty());
        assert!(ctx.store.failed_ids().await.unwrap().contains(&"1".to_string()));
    }

    #[tokio::test]
    async fn clean_jobs_in_set_respects_age_and_limit() {
        let ctx = RedisTestContext::new().await.unwrap();
        let now = Utc::now().timestamp_millis();
        for id in ["1", "2", "3"] {
            ctx.store.add_job(id, None).await.unwrap();
            let mut conn = ctx.store.raw_connection();
            ctx.store.move_to_active(&mut conn).await.unwrap();
            ctx.store.move_to_completed(id, "null", now - 10_000).await.unwrap();
        }

        let removed = ctx
            .store
            .clean_jobs_in_set(CleanTarget::Completed, now - 60_000, 0)
            .await
            .unwrap();
        assert!(removed.is_empty());

        let removed = ctx
            .store
            .clean_jobs_in_set(CleanTarget::Completed, now, 2)
            .await
            .unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(ctx.store.completed_ids().await.unwrap().len(), 1);
        for id in &removed {
            assert!(ctx.store.fetch_job_map(id).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn empty_truncates_wait_paused_delayed() {
        let ctx = RedisTestContext::new().await.unwrap();
        let now = Utc::now().timestamp_millis();
        ctx.store.add_job("1", None).await.unwrap();
        ctx.store.add_delayed_job("2", now + 60_000).await.unwrap();
        ctx.store.pause_resume(true).await.unwrap();
        ctx.store.add_job("3", None).await.unwrap();

        let removed = ctx.store.empty().await.unwrap();
        assert_eq!(removed.len(), 3);
        let counts = ctx.store.job_counts().await.unwrap();
        assert_eq!(counts.wait, 0);
        assert_eq!(counts.paused, 0);
        assert_eq!(counts.delayed, 0);
        assert!(!ctx.store.is_meta_paused().await.unwrap());
    }

    #[tokio::test]
    async fn count_is_max_of_wait_paused_plus_delayed() {
        let ctx = RedisTestContext::new().await.unwrap();
        let now = Utc::now().timestamp_millis();
        ctx.store.add_job("1", None).await.unwrap();
        ctx.store.add_job("2", None).await.unwrap();
        ctx.store.add_delayed_job("3", now + 60_000).await.unwrap();
        assert_eq!(ctx.store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn remove_job_clears_every_collection() {
        let ctx = RedisTestContext::new().await.unwrap();
        ctx.store.add_job("1", Some(5)).await.unwrap();
        ctx.store
            .take_lock("1", "token-a", 5_000, false, false)
            .await
            .unwrap();
        ctx.store.remove_job("1").await.unwrap();

        assert!(ctx.store.wait_ids().await.unwrap().is_empty());
        assert!(ctx.store.fetch_job_map("1").await.unwrap().is_none());
        assert_eq!(ctx.store.lock_owner("1").await.unwrap(), None);
    }
}
