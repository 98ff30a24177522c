//! Birthday scheduling.
//!
//! Turns a person into a delayed job: compute the next local delivery
//! instant, derive the idempotency key from `(person id, local delivery
//! date)`, and enqueue. Scheduling twice before delivery leaves exactly one
//! pending job because the queue collapses duplicate keys.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::SchedulingError;
use crate::metrics::MetricsCollector;
use crate::storage::Person;
use crate::timing::{next_delivery_instant, DEFAULT_DELIVERY_HOUR};

use super::job::{Job, JobPayload, BIRTHDAY_TASK_TYPE, DEFAULT_MAX_ATTEMPTS};
use super::queue::{DelayedTaskQueue, EnqueueOutcome};

/// A delivery sitting in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledDelivery {
    pub job_id: Uuid,
    pub person_id: i64,
    pub not_before: DateTime<Utc>,
    pub local_date: NaiveDate,
    pub idempotency_key: String,
}

/// Successful outcome of [`BirthdayScheduler::schedule`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scheduled {
    /// A new job was enqueued.
    Enqueued(ScheduledDelivery),
    /// The same (person, date) delivery was already queued; nothing changed.
    AlreadyScheduled(ScheduledDelivery),
}

impl Scheduled {
    pub fn delivery(&self) -> &ScheduledDelivery {
        match self {
            Self::Enqueued(delivery) | Self::AlreadyScheduled(delivery) => delivery,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Enqueued(_))
    }
}

/// Idempotency key of the delivery for `person_id` on `local_date`.
///
/// `birthday-` followed by the SHA-256 hex digest of `"{person_id}:{YYYY-MM-DD}"`.
pub fn idempotency_key(person_id: i64, local_date: NaiveDate) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", person_id, local_date.format("%Y-%m-%d")).as_bytes());
    format!("birthday-{}", hex::encode(hasher.finalize()))
}

/// Schedules birthday deliveries onto a [`DelayedTaskQueue`].
pub struct BirthdayScheduler {
    queue: Arc<dyn DelayedTaskQueue>,
    clock: Arc<dyn Clock>,
    delivery_hour: u32,
    max_attempts: u32,
    metrics: MetricsCollector,
}

impl BirthdayScheduler {
    pub fn new(queue: Arc<dyn DelayedTaskQueue>, clock: Arc<dyn Clock>) -> Self {
        Self {
            queue,
            clock,
            delivery_hour: DEFAULT_DELIVERY_HOUR,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            metrics: MetricsCollector::new(),
        }
    }

    /// Sets the local delivery hour.
    pub fn with_delivery_hour(mut self, hour: u32) -> Self {
        self.delivery_hour = hour;
        self
    }

    /// Sets the attempts budget stamped on new jobs.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Schedules the next birthday delivery for `person`.
    ///
    /// # Errors
    ///
    /// - `SchedulingError::Calculation` when no delivery instant can be computed
    /// - `SchedulingError::QueueUnavailable` when the enqueue fails; the caller
    ///   keeps the person and leaves remediation to the reconciliation sweep
    pub async fn schedule(&self, person: &Person) -> Result<Scheduled, SchedulingError> {
        let now = self.clock.now();

        let delivery = next_delivery_instant(
            person.date_of_birth,
            &person.time_zone,
            now,
            self.delivery_hour,
        )
        .map_err(|source| {
            self.metrics.record_schedule("error");
            SchedulingError::Calculation {
                person_id: person.id,
                source,
            }
        })?;

        let key = idempotency_key(person.id, delivery.local_date);
        let job = Job::new(
            BIRTHDAY_TASK_TYPE,
            JobPayload {
                person_id: person.id,
            },
            delivery.instant,
            key.clone(),
            now,
        )
        .with_max_attempts(self.max_attempts);

        let outcome = self.queue.enqueue(job).await.map_err(|source| {
            warn!(person_id = person.id, error = %source, "Failed to enqueue birthday delivery");
            self.metrics.record_schedule("error");
            SchedulingError::QueueUnavailable {
                person_id: person.id,
                source,
            }
        })?;

        let scheduled = ScheduledDelivery {
            job_id: outcome.job_id(),
            person_id: person.id,
            not_before: delivery.instant,
            local_date: delivery.local_date,
            idempotency_key: key,
        };

        match outcome {
            EnqueueOutcome::Accepted(_) => {
                self.metrics.record_schedule("enqueued");
                info!(
                    person_id = person.id,
                    job_id = %scheduled.job_id,
                    not_before = %scheduled.not_before,
                    local_date = %scheduled.local_date,
                    zone = %person.time_zone,
                    "Birthday delivery scheduled"
                );
                Ok(Scheduled::Enqueued(scheduled))
            }
            EnqueueOutcome::DuplicateIdempotencyKey(_) => {
                self.metrics.record_schedule("duplicate");
                debug!(
                    person_id = person.id,
                    job_id = %scheduled.job_id,
                    "Birthday delivery already scheduled"
                );
                Ok(Scheduled::AlreadyScheduled(scheduled))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::geo::TimeZoneId;
    use crate::scheduler::memory::InMemoryDelayedQueue;
    use crate::scheduler::queue::{QueueError, QueueStats};
    use async_trait::async_trait;
    use chrono::TimeZone;

    fn person(id: i64) -> Person {
        Person {
            id,
            email: "ada@example.com".to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            date_of_birth: NaiveDate::from_ymd_opt(1990, 6, 15).unwrap(),
            time_zone: TimeZoneId::parse("America/Los_Angeles").unwrap(),
            city: "Los Angeles".to_string(),
            country: "USA".to_string(),
            location: None,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            last_notified_at: None,
        }
    }

    fn clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        ))
    }

    #[test]
    fn test_idempotency_key_deterministic() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 15).unwrap();
        let a = idempotency_key(42, date);
        let b = idempotency_key(42, date);

        assert_eq!(a, b);
        assert!(a.starts_with("birthday-"));
        assert_eq!(a.len(), "birthday-".len() + 64);
        assert_ne!(a, idempotency_key(43, date));
        assert_ne!(
            a,
            idempotency_key(42, NaiveDate::from_ymd_opt(2025, 6, 15).unwrap())
        );
    }

    #[tokio::test]
    async fn test_schedule_enqueues_at_local_delivery_hour() {
        let queue = Arc::new(InMemoryDelayedQueue::default());
        let scheduler = BirthdayScheduler::new(queue.clone(), clock());

        let scheduled = scheduler.schedule(&person(1)).await.unwrap();

        assert!(scheduled.is_new());
        assert_eq!(
            scheduled.delivery().not_before,
            Utc.with_ymd_and_hms(2024, 6, 15, 16, 0, 0).unwrap()
        );

        let pending = queue.pending_jobs().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_type, BIRTHDAY_TASK_TYPE);
        assert_eq!(pending[0].payload.person_id, 1);
    }

    #[tokio::test]
    async fn test_schedule_twice_yields_one_job() {
        let queue = Arc::new(InMemoryDelayedQueue::default());
        let scheduler = BirthdayScheduler::new(queue.clone(), clock());
        let person = person(1);

        let first = scheduler.schedule(&person).await.unwrap();
        let second = scheduler.schedule(&person).await.unwrap();

        assert!(first.is_new());
        assert!(matches!(second, Scheduled::AlreadyScheduled(_)));
        assert_eq!(first.delivery(), second.delivery());
        assert_eq!(queue.pending_jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn test_custom_delivery_hour_and_attempts() {
        let queue = Arc::new(InMemoryDelayedQueue::default());
        let scheduler = BirthdayScheduler::new(queue.clone(), clock())
            .with_delivery_hour(10)
            .with_max_attempts(2);

        let scheduled = scheduler.schedule(&person(1)).await.unwrap();
        assert_eq!(
            scheduled.delivery().not_before,
            Utc.with_ymd_and_hms(2024, 6, 15, 17, 0, 0).unwrap()
        );
        assert_eq!(queue.pending_jobs().await[0].max_attempts, 2);
    }

    #[tokio::test]
    async fn test_invalid_delivery_hour_is_calculation_error() {
        let queue = Arc::new(InMemoryDelayedQueue::default());
        let scheduler = BirthdayScheduler::new(queue, clock()).with_delivery_hour(25);

        let err = scheduler.schedule(&person(9)).await.unwrap_err();
        assert!(matches!(err, SchedulingError::Calculation { person_id: 9, .. }));
    }

    struct UnavailableQueue;

    #[async_trait]
    impl DelayedTaskQueue for UnavailableQueue {
        async fn enqueue(&self, _job: Job) -> Result<EnqueueOutcome, QueueError> {
            Err(QueueError::ConnectionFailed("connection refused".to_string()))
        }
        async fn dequeue_due(&self, _now: DateTime<Utc>) -> Result<Option<Job>, QueueError> {
            Ok(None)
        }
        async fn ack(&self, _job: &Job) -> Result<(), QueueError> {
            Ok(())
        }
        async fn retry_later(&self, _job: Job, _at: DateTime<Utc>) -> Result<(), QueueError> {
            Ok(())
        }
        async fn dead_letter(
            &self,
            _job: Job,
            _error: &str,
            _now: DateTime<Utc>,
        ) -> Result<(), QueueError> {
            Ok(())
        }
        async fn recover_expired(&self, _now: DateTime<Utc>) -> Result<usize, QueueError> {
            Ok(0)
        }
        async fn stats(&self, _now: DateTime<Utc>) -> Result<QueueStats, QueueError> {
            Ok(QueueStats::default())
        }
    }

    #[tokio::test]
    async fn test_queue_failure_is_surfaced() {
        let scheduler = BirthdayScheduler::new(Arc::new(UnavailableQueue), clock());

        let err = scheduler.schedule(&person(5)).await.unwrap_err();
        assert!(matches!(
            err,
            SchedulingError::QueueUnavailable { person_id: 5, .. }
        ));
    }
}
