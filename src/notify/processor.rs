//! Worker-side birthday notification handling.
//!
//! One call to [`NotificationProcessor::process`] is one delivery attempt:
//!
//! ```text
//! Received ──► Eligible ──► Sent
//!    │            │
//!    │            └──────► Failed
//!    └──► Skipped
//! ```
//!
//! The dedup window check makes at-least-once redelivery safe. To also make
//! concurrent workers safe, eligibility is confirmed by taking a short delivery
//! lease before the outbound call. `last_notified_at` is written only after the
//! call succeeds; a failed call drops the lease, and a worker that dies
//! mid-send leaves a lease that simply expires.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::delivery::DeliveryClient;
use crate::error::{DeliveryError, ProcessError};
use crate::metrics::MetricsCollector;
use crate::scheduler::job::{Job, BIRTHDAY_TASK_TYPE};
use crate::storage::PersonStore;

use super::message::BirthdayMessage;

/// States of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Received,
    Eligible,
    Skipped,
    Sent,
    Failed,
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::Eligible => "eligible",
            Self::Skipped => "skipped",
            Self::Sent => "sent",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why an attempt was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The person was deleted after scheduling.
    PersonNotFound,
    /// A message went out within the dedup window.
    RecentlyNotified { last_notified_at: DateTime<Utc> },
    /// Another worker holds the delivery lease.
    ConcurrentClaim,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PersonNotFound => write!(f, "person not found"),
            Self::RecentlyNotified { last_notified_at } => {
                write!(f, "already notified at {}", last_notified_at)
            }
            Self::ConcurrentClaim => write!(f, "leased by another worker"),
        }
    }
}

/// Terminal outcome of one attempt.
#[derive(Debug)]
pub enum ProcessOutcome {
    Sent { person_id: i64, at: DateTime<Utc> },
    Skipped(SkipReason),
    Failed(DeliveryError),
}

impl ProcessOutcome {
    pub fn state(&self) -> DeliveryState {
        match self {
            Self::Sent { .. } => DeliveryState::Sent,
            Self::Skipped(_) => DeliveryState::Skipped,
            Self::Failed(_) => DeliveryState::Failed,
        }
    }
}

/// Handles `birthdayNotification` jobs.
pub struct NotificationProcessor {
    store: Arc<dyn PersonStore>,
    client: Arc<dyn DeliveryClient>,
    clock: Arc<dyn Clock>,
    subject: String,
    dedup_window: Duration,
    claim_lease: Duration,
    metrics: MetricsCollector,
}

impl NotificationProcessor {
    pub fn new(
        store: Arc<dyn PersonStore>,
        client: Arc<dyn DeliveryClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            client,
            clock,
            subject: "Happy Birthday!".to_string(),
            dedup_window: Duration::hours(24),
            claim_lease: Duration::minutes(2),
            metrics: MetricsCollector::new(),
        }
    }

    /// Sets the message subject.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Sets the dedup window.
    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    /// Sets how long a delivery lease is held. Must exceed the delivery
    /// client's timeout.
    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    /// Processes one queued job.
    ///
    /// # Errors
    ///
    /// Returns `ProcessError` when the job cannot be handled at all (unknown
    /// task type, storage failure). No outcome is recorded in that case.
    pub async fn process(&self, job: &Job) -> Result<ProcessOutcome, ProcessError> {
        if job.task_type != BIRTHDAY_TASK_TYPE {
            return Err(ProcessError::UnsupportedTaskType(job.task_type.clone()));
        }
        self.process_person(job.payload.person_id).await
    }

    /// Runs the delivery state machine for `person_id`.
    pub async fn process_person(&self, person_id: i64) -> Result<ProcessOutcome, ProcessError> {
        debug!(person_id = person_id, state = %DeliveryState::Received, "Processing birthday notification");

        let Some(person) = self.store.find_by_id(person_id).await? else {
            return Ok(self.skipped(person_id, SkipReason::PersonNotFound));
        };

        let now = self.clock.now();
        if let Some(last_notified_at) = person.last_notified_at {
            if now - last_notified_at < self.dedup_window {
                return Ok(self.skipped(
                    person_id,
                    SkipReason::RecentlyNotified { last_notified_at },
                ));
            }
        }

        let lease_until = now + self.claim_lease;
        if !self
            .store
            .try_claim_notification(person_id, person.last_notified_at, now, lease_until)
            .await?
        {
            return Ok(self.skipped(person_id, SkipReason::ConcurrentClaim));
        }

        debug!(person_id = person_id, lease_until = %lease_until, state = %DeliveryState::Eligible, "Delivery lease taken");

        let message = BirthdayMessage::for_person(&person, &self.subject);
        match self
            .client
            .send(&message.recipient, &message.subject, &message.body)
            .await
        {
            Ok(sent) => {
                // The message is out; a failed write here must not turn into a resend.
                let sent_at = self.clock.now();
                match self
                    .store
                    .complete_notification(person_id, lease_until, sent_at)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(
                            person_id = person_id,
                            lease_until = %lease_until,
                            "Delivery lease lost before the send was recorded"
                        );
                    }
                    Err(e) => {
                        error!(
                            person_id = person_id,
                            error = %e,
                            "Failed to record sent birthday message"
                        );
                    }
                }

                self.metrics.record_notification("sent");
                info!(
                    person_id = person_id,
                    recipient = %message.recipient,
                    sent_at = %sent.timestamp,
                    state = %DeliveryState::Sent,
                    "Birthday message sent"
                );
                Ok(ProcessOutcome::Sent {
                    person_id,
                    at: sent_at,
                })
            }
            Err(e) => {
                self.release_claim(person_id, lease_until).await;
                self.metrics.record_notification("failed");
                error!(
                    person_id = person_id,
                    error = %e,
                    state = %DeliveryState::Failed,
                    "Birthday message delivery failed"
                );
                Ok(ProcessOutcome::Failed(e))
            }
        }
    }

    async fn release_claim(&self, person_id: i64, lease_until: DateTime<Utc>) {
        match self
            .store
            .release_notification_claim(person_id, lease_until)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(person_id = person_id, "Delivery lease already expired");
            }
            Err(e) => {
                // Redelivery waits for the lease to expire.
                warn!(person_id = person_id, error = %e, "Failed to release delivery lease");
            }
        }
    }

    fn skipped(&self, person_id: i64, reason: SkipReason) -> ProcessOutcome {
        self.metrics.record_notification("skipped");
        info!(
            person_id = person_id,
            reason = %reason,
            state = %DeliveryState::Skipped,
            "Birthday notification skipped"
        );
        ProcessOutcome::Skipped(reason)
    }
}
