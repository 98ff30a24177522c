//! In-process delayed queue with the same semantics as the Redis queue.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::job::{DeadLetterEntry, Job};
use super::queue::{idempotency_ttl, DelayedTaskQueue, EnqueueOutcome, QueueError, QueueStats};

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<Uuid, Job>,
    /// Waiting job ids.
    delayed: Vec<Uuid>,
    /// Claimed job ids with their visibility deadline.
    processing: HashMap<Uuid, DateTime<Utc>>,
    attempts: HashMap<Uuid, u32>,
    dead_letter: Vec<DeadLetterEntry>,
    /// Idempotency key to (job id, marker expiry).
    markers: HashMap<String, (Uuid, DateTime<Utc>)>,
}

impl State {
    /// Drops idempotency markers that have expired by `now`.
    fn prune_markers(&mut self, now: DateTime<Utc>) {
        self.markers.retain(|_, (_, expires_at)| *expires_at > now);
    }
}

/// `DelayedTaskQueue` kept in memory, for tests and single-process runs.
#[derive(Debug)]
pub struct InMemoryDelayedQueue {
    state: Mutex<State>,
    visibility_timeout: chrono::Duration,
}

impl Default for InMemoryDelayedQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl InMemoryDelayedQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            visibility_timeout: chrono::Duration::from_std(visibility_timeout)
                .unwrap_or_else(|_| chrono::Duration::days(1)),
        }
    }

    /// Waiting jobs ordered by due time.
    pub async fn pending_jobs(&self) -> Vec<Job> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state
            .delayed
            .iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect();
        jobs.sort_by_key(|job| job.not_before);
        jobs
    }

    /// Dead letter entries, oldest first.
    pub async fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.state.lock().await.dead_letter.clone()
    }
}

#[async_trait]
impl DelayedTaskQueue for InMemoryDelayedQueue {
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, QueueError> {
        let mut state = self.state.lock().await;
        state.prune_markers(job.created_at);

        if let Some((existing, _)) = state.markers.get(&job.idempotency_key) {
            return Ok(EnqueueOutcome::DuplicateIdempotencyKey(*existing));
        }

        let expires_at = job.created_at + idempotency_ttl(&job);
        let id = job.id;
        state
            .markers
            .insert(job.idempotency_key.clone(), (id, expires_at));
        state.jobs.insert(id, job);
        state.delayed.push(id);

        Ok(EnqueueOutcome::Accepted(id))
    }

    async fn dequeue_due(&self, now: DateTime<Utc>) -> Result<Option<Job>, QueueError> {
        let mut state = self.state.lock().await;

        let next = state
            .delayed
            .iter()
            .enumerate()
            .filter_map(|(idx, id)| state.jobs.get(id).map(|job| (idx, job)))
            .filter(|(_, job)| job.is_due(now))
            .min_by_key(|(_, job)| job.not_before)
            .map(|(idx, _)| idx);

        let Some(idx) = next else {
            return Ok(None);
        };

        let id = state.delayed.remove(idx);
        state.processing.insert(id, now + self.visibility_timeout);
        let attempts = {
            let counter = state.attempts.entry(id).or_insert(0);
            *counter += 1;
            *counter
        };

        let mut job = state
            .jobs
            .get(&id)
            .cloned()
            .ok_or(QueueError::JobNotFound(id))?;
        job.attempts = attempts;

        Ok(Some(job))
    }

    async fn ack(&self, job: &Job) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.processing.remove(&job.id);
        state.jobs.remove(&job.id);
        state.attempts.remove(&job.id);
        Ok(())
    }

    async fn retry_later(&self, job: Job, not_before: DateTime<Utc>) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;

        if !state.jobs.contains_key(&job.id) {
            return Err(QueueError::JobNotFound(job.id));
        }

        let id = job.id;
        let mut job = job;
        job.not_before = not_before;

        state.processing.remove(&id);
        state.jobs.insert(id, job);
        if !state.delayed.contains(&id) {
            state.delayed.push(id);
        }

        Ok(())
    }

    async fn dead_letter(
        &self,
        job: Job,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;

        state.processing.remove(&job.id);
        state.jobs.remove(&job.id);
        state.attempts.remove(&job.id);
        state.dead_letter.push(DeadLetterEntry {
            job,
            error: error.to_string(),
            moved_at: now,
        });

        Ok(())
    }

    async fn recover_expired(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.prune_markers(now);

        let expired: Vec<Uuid> = state
            .processing
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            state.processing.remove(id);
            if let Some(job) = state.jobs.get_mut(id) {
                job.not_before = now;
                state.delayed.push(*id);
            }
        }

        Ok(expired.len())
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats, QueueError> {
        let state = self.state.lock().await;

        let due = state
            .delayed
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .filter(|job| job.is_due(now))
            .count();

        Ok(QueueStats {
            pending: state.delayed.len(),
            due,
            processing: state.processing.len(),
            dead_letter: state.dead_letter.len(),
        })
    }
}
