//! Job definitions for the delayed queue.
//!
//! - `Job`: a delayed task with its payload, due time and idempotency key
//! - `JobPayload`: the person a birthday task is for
//! - `JobResult`: what a worker did with a job
//! - `JobStatus`: terminal status of a processing attempt

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task type of birthday notification jobs.
pub const BIRTHDAY_TASK_TYPE: &str = "birthdayNotification";

/// Default maximum number of delivery attempts for a job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Upper bound on the retry backoff exponent.
const MAX_BACKOFF_SHIFT: u32 = 10;

/// Payload of a birthday notification job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub person_id: i64,
}

/// A delayed task stored in the queue.
///
/// The id is derived from the idempotency key, so the same logical delivery
/// always has the same id no matter how often it is scheduled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub task_type: String,
    pub payload: JobPayload,
    /// Earliest instant the job may be handed to a worker.
    pub not_before: DateTime<Utc>,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    /// Number of times the job has been claimed.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Error of the most recent failed attempt.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Job {
    /// Creates a job due at `not_before`.
    pub fn new(
        task_type: impl Into<String>,
        payload: JobPayload,
        not_before: DateTime<Utc>,
        idempotency_key: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let idempotency_key = idempotency_key.into();
        Self {
            id: job_id_for_key(&idempotency_key),
            task_type: task_type.into(),
            payload,
            not_before,
            idempotency_key,
            created_at,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            last_error: None,
        }
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Increments the attempt counter.
    pub fn increment_attempts(&mut self) {
        self.attempts += 1;
    }

    /// Returns whether the job may be attempted again after a failure.
    pub fn should_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    /// Whether the job is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now
    }

    /// Delay before the next attempt: `base * 2^(attempts - 1)`.
    pub fn retry_delay(&self, base: Duration) -> Duration {
        let shift = self.attempts.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        base * (1i32 << shift)
    }
}

/// Deterministic job id for an idempotency key.
pub fn job_id_for_key(idempotency_key: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, idempotency_key.as_bytes())
}

/// Status of a processed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Message delivered; job acknowledged.
    Sent,
    /// Nothing to do (person gone or already notified); job acknowledged.
    Skipped,
    /// Attempt failed; job rescheduled.
    Retrying,
    /// Attempt failed with no attempts left; job moved to the dead letter list.
    DeadLettered,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Sent => write!(f, "sent"),
            JobStatus::Skipped => write!(f, "skipped"),
            JobStatus::Retrying => write!(f, "retrying"),
            JobStatus::DeadLettered => write!(f, "dead_lettered"),
        }
    }
}

/// Result of one processing attempt, as reported by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub person_id: i64,
    pub status: JobStatus,
    /// Skip reason or error message.
    pub detail: Option<String>,
    pub completed_at: DateTime<Utc>,
    pub worker_id: String,
    pub duration_ms: u64,
}

impl JobResult {
    pub fn new(
        job: &Job,
        worker_id: impl Into<String>,
        status: JobStatus,
        detail: Option<String>,
        completed_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> Self {
        Self {
            job_id: job.id,
            person_id: job.payload.person_id,
            status,
            detail,
            completed_at,
            worker_id: worker_id.into(),
            duration_ms,
        }
    }

    /// Whether the job left the queue for good.
    pub fn is_final(&self) -> bool {
        self.status != JobStatus::Retrying
    }
}

/// A job that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: Job,
    pub error: String,
    pub moved_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn job() -> Job {
        let due = Utc.with_ymd_and_hms(2024, 6, 15, 16, 0, 0).unwrap();
        let created = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        Job::new(
            BIRTHDAY_TASK_TYPE,
            JobPayload { person_id: 42 },
            due,
            "birthday-abc",
            created,
        )
    }

    #[test]
    fn test_job_new() {
        let job = job();

        assert_eq!(job.task_type, "birthdayNotification");
        assert_eq!(job.payload.person_id, 42);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(job.should_retry());
        assert!(job.last_error.is_none());
    }

    #[test]
    fn test_job_id_is_derived_from_key() {
        let a = job();
        let b = job();
        assert_eq!(a.id, b.id);
        assert_eq!(a.id, job_id_for_key("birthday-abc"));
        assert_ne!(a.id, job_id_for_key("birthday-abd"));
    }

    #[test]
    fn test_job_attempts() {
        let mut job = job().with_max_attempts(2);
        assert_eq!(job.remaining_attempts(), 2);

        job.increment_attempts();
        assert!(job.should_retry());
        assert_eq!(job.remaining_attempts(), 1);

        job.increment_attempts();
        assert!(!job.should_retry());
        assert_eq!(job.remaining_attempts(), 0);
    }

    #[test]
    fn test_job_is_due() {
        let job = job();
        assert!(!job.is_due(job.not_before - Duration::seconds(1)));
        assert!(job.is_due(job.not_before));
    }

    #[test]
    fn test_retry_delay_doubles() {
        let mut job = job();
        let base = Duration::seconds(60);

        job.attempts = 1;
        assert_eq!(job.retry_delay(base), Duration::seconds(60));
        job.attempts = 2;
        assert_eq!(job.retry_delay(base), Duration::seconds(120));
        job.attempts = 4;
        assert_eq!(job.retry_delay(base), Duration::seconds(480));
        job.attempts = 100;
        assert_eq!(job.retry_delay(base), Duration::seconds(60 * 1024));
    }

    #[test]
    fn test_payload_wire_format() {
        let json = serde_json::to_value(JobPayload { person_id: 7 }).unwrap();
        assert_eq!(json, serde_json::json!({"personId": 7}));
    }

    #[test]
    fn test_job_status_display() {
        assert_eq!(JobStatus::Sent.to_string(), "sent");
        assert_eq!(JobStatus::Skipped.to_string(), "skipped");
        assert_eq!(JobStatus::Retrying.to_string(), "retrying");
        assert_eq!(JobStatus::DeadLettered.to_string(), "dead_lettered");
    }

    #[test]
    fn test_job_result_finality() {
        let job = job();
        let now = Utc::now();
        let sent = JobResult::new(&job, "worker-0", JobStatus::Sent, None, now, 5);
        assert!(sent.is_final());
        assert_eq!(sent.person_id, 42);

        let retry = JobResult::new(
            &job,
            "worker-0",
            JobStatus::Retrying,
            Some("timeout".to_string()),
            now,
            5,
        );
        assert!(!retry.is_final());
    }
}
