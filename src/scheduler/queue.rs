//! Delayed task queue.
//!
//! [`DelayedTaskQueue`] is the contract the scheduler and the workers rely on:
//!
//! - `enqueue` is idempotent on the job's idempotency key; a duplicate key is
//!   a benign no-op reported as [`EnqueueOutcome::DuplicateIdempotencyKey`]
//! - `dequeue_due` hands out jobs no earlier than their `not_before`, and
//!   makes them invisible to other workers until the visibility timeout runs
//!   out
//! - un-acknowledged claims are redelivered by `recover_expired`, so delivery
//!   is at-least-once
//!
//! # Redis layout
//!
//! - `{queue}:jobs`: hash of job id to job JSON
//! - `{queue}:delayed`: sorted set of job ids scored by `not_before` (ms)
//! - `{queue}:processing`: sorted set of claimed ids scored by visibility deadline (ms)
//! - `{queue}:attempts`: hash of job id to claim count
//! - `{queue}:dead_letter`: list of dead letter entries
//! - `{queue}:idem:{key}`: idempotency marker (`SET NX PX`)

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::job::{DeadLetterEntry, Job};

/// Days an idempotency marker outlives the job's due time.
pub const IDEMPOTENCY_RETENTION_DAYS: i64 = 7;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize job data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// Job not found in the queue.
    #[error("Job {0} not found")]
    JobNotFound(Uuid),
}

/// Outcome of an enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new job was stored.
    Accepted(Uuid),
    /// A job with the same idempotency key already exists; nothing changed.
    DuplicateIdempotencyKey(Uuid),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> Uuid {
        match self {
            Self::Accepted(id) | Self::DuplicateIdempotencyKey(id) => *id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateIdempotencyKey(_))
    }
}

/// Point-in-time queue depth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs waiting, due or not.
    pub pending: usize,
    /// Waiting jobs whose `not_before` has passed.
    pub due: usize,
    /// Jobs claimed by a worker and not yet acknowledged.
    pub processing: usize,
    /// Jobs that exhausted their attempts.
    pub dead_letter: usize,
}

/// Durable delayed task queue with at-least-once delivery.
#[async_trait]
pub trait DelayedTaskQueue: Send + Sync {
    /// Stores `job` unless its idempotency key is already known.
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, QueueError>;

    /// Claims the earliest job due at `now`, if any.
    ///
    /// The returned job's `attempts` includes this claim.
    async fn dequeue_due(&self, now: DateTime<Utc>) -> Result<Option<Job>, QueueError>;

    /// Removes a claimed job for good.
    async fn ack(&self, job: &Job) -> Result<(), QueueError>;

    /// Returns a claimed job to the waiting set, due at `not_before`.
    async fn retry_later(&self, job: Job, not_before: DateTime<Utc>) -> Result<(), QueueError>;

    /// Moves a claimed job to the dead letter list.
    async fn dead_letter(
        &self,
        job: Job,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// Makes claims whose visibility deadline passed before `now` due again.
    ///
    /// Returns the number of jobs recovered.
    async fn recover_expired(&self, now: DateTime<Utc>) -> Result<usize, QueueError>;

    /// Returns current queue depth.
    async fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats, QueueError>;
}

/// TTL for an idempotency marker: until the job is due plus the retention.
pub(crate) fn idempotency_ttl(job: &Job) -> chrono::Duration {
    let until_due = (job.not_before - job.created_at).max(chrono::Duration::zero());
    until_due + chrono::Duration::days(IDEMPOTENCY_RETENTION_DAYS)
}

const ENQUEUE_SCRIPT: &str = r#"
-- KEYS: idem marker, jobs hash, delayed zset
-- ARGV: job id, job json, not_before ms, marker ttl ms
if not redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[4]) then
    return 0
end
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
return 1
"#;

const CLAIM_SCRIPT: &str = r#"
-- KEYS: delayed zset, processing zset, jobs hash, attempts hash
-- ARGV: now ms, visibility deadline ms
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #ids == 0 then
    return false
end
local id = ids[1]
redis.call('ZREM', KEYS[1], id)
local body = redis.call('HGET', KEYS[3], id)
if not body then
    redis.call('HDEL', KEYS[4], id)
    return false
end
redis.call('ZADD', KEYS[2], ARGV[2], id)
local attempts = redis.call('HINCRBY', KEYS[4], id, 1)
return {body, attempts}
"#;

const RECOVER_SCRIPT: &str = r#"
-- KEYS: processing zset, delayed zset
-- ARGV: now ms
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(ids) do
    redis.call('ZREM', KEYS[1], id)
    redis.call('ZADD', KEYS[2], ARGV[1], id)
end
return #ids
"#;

/// Redis-backed delayed queue.
///
/// Enqueue, claim and recovery are Lua scripts, so each runs atomically on
/// the server.
pub struct RedisDelayedQueue {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    queue_name: String,
    jobs_key: String,
    delayed_key: String,
    processing_key: String,
    attempts_key: String,
    dead_letter_key: String,
    visibility_timeout: Duration,
    enqueue_script: Script,
    claim_script: Script,
    recover_script: Script,
}

impl RedisDelayedQueue {
    /// Connects to Redis and creates a new queue.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `queue_name` - Name of the queue (used as prefix for Redis keys)
    /// * `visibility_timeout` - How long a claim hides a job from other workers
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(
        redis_url: &str,
        queue_name: &str,
        visibility_timeout: Duration,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, queue_name, visibility_timeout))
    }

    /// Creates a queue from an existing ConnectionManager.
    pub fn from_connection(
        redis: ConnectionManager,
        queue_name: &str,
        visibility_timeout: Duration,
    ) -> Self {
        Self {
            redis,
            queue_name: queue_name.to_string(),
            jobs_key: format!("{}:jobs", queue_name),
            delayed_key: format!("{}:delayed", queue_name),
            processing_key: format!("{}:processing", queue_name),
            attempts_key: format!("{}:attempts", queue_name),
            dead_letter_key: format!("{}:dead_letter", queue_name),
            visibility_timeout,
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            claim_script: Script::new(CLAIM_SCRIPT),
            recover_script: Script::new(RECOVER_SCRIPT),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    fn idempotency_key(&self, key: &str) -> String {
        format!("{}:idem:{}", self.queue_name, key)
    }

    /// Reads the most recent dead letter entries (newest first).
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let raw: Vec<String> = conn
            .lrange(&self.dead_letter_key, 0, limit as isize - 1)
            .await?;

        raw.iter()
            .map(|entry| serde_json::from_str(entry).map_err(QueueError::from))
            .collect()
    }

    fn visibility_deadline(&self, now: DateTime<Utc>) -> i64 {
        let visibility = chrono::Duration::from_std(self.visibility_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        (now + visibility).timestamp_millis()
    }
}

#[async_trait]
impl DelayedTaskQueue for RedisDelayedQueue {
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, QueueError> {
        let serialized = serde_json::to_string(&job)?;
        let ttl_ms = idempotency_ttl(&job).num_milliseconds().max(1);
        let mut conn = self.redis.clone();

        let stored: i32 = self
            .enqueue_script
            .key(self.idempotency_key(&job.idempotency_key))
            .key(&self.jobs_key)
            .key(&self.delayed_key)
            .arg(job.id.to_string())
            .arg(serialized)
            .arg(job.not_before.timestamp_millis())
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;

        if stored == 1 {
            debug!(job_id = %job.id, not_before = %job.not_before, "Job enqueued");
            Ok(EnqueueOutcome::Accepted(job.id))
        } else {
            debug!(job_id = %job.id, key = %job.idempotency_key, "Duplicate idempotency key");
            Ok(EnqueueOutcome::DuplicateIdempotencyKey(job.id))
        }
    }

    async fn dequeue_due(&self, now: DateTime<Utc>) -> Result<Option<Job>, QueueError> {
        let mut conn = self.redis.clone();

        let claimed: Option<(String, u32)> = self
            .claim_script
            .key(&self.delayed_key)
            .key(&self.processing_key)
            .key(&self.jobs_key)
            .key(&self.attempts_key)
            .arg(now.timestamp_millis())
            .arg(self.visibility_deadline(now))
            .invoke_async(&mut conn)
            .await?;

        match claimed {
            Some((body, attempts)) => {
                let mut job: Job = serde_json::from_str(&body)?;
                job.attempts = attempts;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let id = job.id.to_string();

        redis::pipe()
            .atomic()
            .zrem(&self.processing_key, &id)
            .hdel(&self.jobs_key, &id)
            .hdel(&self.attempts_key, &id)
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(())
    }

    async fn retry_later(&self, job: Job, not_before: DateTime<Utc>) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let id = job.id.to_string();

        let exists: bool = conn.hexists(&self.jobs_key, &id).await?;
        if !exists {
            return Err(QueueError::JobNotFound(job.id));
        }

        let mut job = job;
        job.not_before = not_before;
        let serialized = serde_json::to_string(&job)?;

        redis::pipe()
            .atomic()
            .zrem(&self.processing_key, &id)
            .hset(&self.jobs_key, &id, serialized)
            .zadd(&self.delayed_key, &id, not_before.timestamp_millis())
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(())
    }

    async fn dead_letter(
        &self,
        job: Job,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let id = job.id.to_string();

        let entry = DeadLetterEntry {
            job,
            error: error.to_string(),
            moved_at: now,
        };
        let serialized = serde_json::to_string(&entry)?;

        redis::pipe()
            .atomic()
            .zrem(&self.processing_key, &id)
            .hdel(&self.jobs_key, &id)
            .hdel(&self.attempts_key, &id)
            .lpush(&self.dead_letter_key, serialized)
            .query_async::<_, ()>(&mut conn)
            .await?;

        warn!(job_id = %id, error = error, "Job moved to dead letter queue");
        Ok(())
    }

    async fn recover_expired(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();

        let recovered: usize = self
            .recover_script
            .key(&self.processing_key)
            .key(&self.delayed_key)
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        Ok(recovered)
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats, QueueError> {
        let mut conn = self.redis.clone();

        let (pending, due, processing, dead_letter): (usize, usize, usize, usize) = redis::pipe()
            .zcard(&self.delayed_key)
            .zcount(&self.delayed_key, "-inf", now.timestamp_millis())
            .zcard(&self.processing_key)
            .llen(&self.dead_letter_key)
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats {
            pending,
            due,
            processing,
            dead_letter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{JobPayload, BIRTHDAY_TASK_TYPE};
    use chrono::TimeZone;

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("refused"));

        let id = Uuid::nil();
        let err = QueueError::JobNotFound(id);
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn test_enqueue_outcome_accessors() {
        let id = Uuid::new_v4();
        assert_eq!(EnqueueOutcome::Accepted(id).job_id(), id);
        assert!(!EnqueueOutcome::Accepted(id).is_duplicate());
        assert!(EnqueueOutcome::DuplicateIdempotencyKey(id).is_duplicate());
    }

    #[test]
    fn test_idempotency_ttl_covers_due_time() {
        let created = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let due = Utc.with_ymd_and_hms(2024, 6, 15, 16, 0, 0).unwrap();
        let job = Job::new(
            BIRTHDAY_TASK_TYPE,
            JobPayload { person_id: 1 },
            due,
            "k",
            created,
        );

        let retention = chrono::Duration::days(IDEMPOTENCY_RETENTION_DAYS);
        assert_eq!(idempotency_ttl(&job), (due - created) + retention);

        let overdue = Job::new(
            BIRTHDAY_TASK_TYPE,
            JobPayload { person_id: 1 },
            created,
            "k",
            due,
        );
        assert_eq!(idempotency_ttl(&overdue), retention);
    }

    #[test]
    fn test_scripts_reference_expected_commands() {
        assert!(ENQUEUE_SCRIPT.contains("'NX', 'PX'"));
        assert!(CLAIM_SCRIPT.contains("ZRANGEBYSCORE"));
        assert!(CLAIM_SCRIPT.contains("HINCRBY"));
        assert!(RECOVER_SCRIPT.contains("ZADD"));
    }
}
