//! Reconciliation sweep.
//!
//! Scheduling is not transactional with person creation, so a queue outage
//! can leave a person without a pending delivery. The sweep walks every
//! stored person and schedules their next birthday again. Duplicate
//! enqueues collapse on the idempotency key, so the sweep is safe to run at
//! any time.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use crate::storage::{PersonStore, StoreError};

use super::birthday::{BirthdayScheduler, Scheduled};

/// Default number of people scheduled concurrently.
pub const DEFAULT_SWEEP_CONCURRENCY: usize = 8;

/// Summary of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Ids listed by the store.
    pub scanned: usize,
    /// Deliveries that were missing and are now enqueued.
    pub enqueued: usize,
    /// Deliveries that were already pending.
    pub already_scheduled: usize,
    /// People whose scheduling failed.
    pub failed: usize,
    /// People deleted between listing and scheduling.
    pub missing: usize,
}

enum SweepItem {
    Scheduled(Scheduled),
    Missing,
    Failed,
}

pub struct Reconciler {
    store: Arc<dyn PersonStore>,
    scheduler: Arc<BirthdayScheduler>,
    concurrency: usize,
}

impl Reconciler {
    pub fn new(store: Arc<dyn PersonStore>, scheduler: Arc<BirthdayScheduler>) -> Self {
        Self {
            store,
            scheduler,
            concurrency: DEFAULT_SWEEP_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Schedules the next birthday of every stored person.
    ///
    /// # Errors
    ///
    /// Fails only if the person ids cannot be listed. Per-person failures are
    /// logged and counted in the report.
    pub async fn sweep(&self) -> Result<ReconcileReport, StoreError> {
        let ids = self.store.list_ids().await?;
        let mut report = ReconcileReport {
            scanned: ids.len(),
            ..Default::default()
        };

        let items: Vec<SweepItem> = stream::iter(ids)
            .map(|id| self.reconcile_one(id))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for item in items {
            match item {
                SweepItem::Scheduled(scheduled) if scheduled.is_new() => report.enqueued += 1,
                SweepItem::Scheduled(_) => report.already_scheduled += 1,
                SweepItem::Missing => report.missing += 1,
                SweepItem::Failed => report.failed += 1,
            }
        }

        info!(
            scanned = report.scanned,
            enqueued = report.enqueued,
            already_scheduled = report.already_scheduled,
            failed = report.failed,
            missing = report.missing,
            "Reconciliation sweep complete"
        );

        Ok(report)
    }

    async fn reconcile_one(&self, id: i64) -> SweepItem {
        let person = match self.store.find_by_id(id).await {
            Ok(Some(person)) => person,
            Ok(None) => return SweepItem::Missing,
            Err(e) => {
                warn!(person_id = id, error = %e, "Failed to load person during sweep");
                return SweepItem::Failed;
            }
        };

        match self.scheduler.schedule(&person).await {
            Ok(scheduled) => SweepItem::Scheduled(scheduled),
            Err(e) => {
                warn!(person_id = id, error = %e, "Failed to schedule person during sweep");
                SweepItem::Failed
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
    use crate::storage::{InMemoryPersonStore, NewPerson};
    use chrono::{NaiveDate, TimeZone, Utc};

    fn new_person(email: &str, zone: &str) -> NewPerson {
        NewPerson {
            email: email.to_string(),
            first_name: "Test".to_string(),
            last_name: "Person".to_string(),
            date_of_birth: NaiveDate::from_ymd_opt(1990, 3, 4).unwrap(),
            time_zone: TimeZoneId::parse(zone).unwrap(),
            city: "Somewhere".to_string(),
            country: "Earth".to_string(),
            location: None,
        }
    }

    #[tokio::test]
    async fn test_sweep_schedules_missing_and_skips_pending() {
        let store = Arc::new(InMemoryPersonStore::new());
        let queue = Arc::new(InMemoryDelayedQueue::default());
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap(),
        ));
        let scheduler = Arc::new(BirthdayScheduler::new(queue.clone(), clock));

        let first = store
            .create(new_person("a@example.com", "Europe/Paris"))
            .await
            .unwrap();
        store
            .create(new_person("b@example.com", "Asia/Tokyo"))
            .await
            .unwrap();
        scheduler.schedule(&first).await.unwrap();

        let reconciler = Reconciler::new(store.clone(), scheduler).with_concurrency(2);
        let report = reconciler.sweep().await.unwrap();

        assert_eq!(
            report,
            ReconcileReport {
                scanned: 2,
                enqueued: 1,
                already_scheduled: 1,
                failed: 0,
                missing: 0,
            }
        );
        assert_eq!(queue.pending_jobs().await.len(), 2);

        let again = reconciler.sweep().await.unwrap();
        assert_eq!(again.enqueued, 0);
        assert_eq!(again.already_scheduled, 2);
    }

    #[tokio::test]
    async fn test_sweep_on_empty_store() {
        let store = Arc::new(InMemoryPersonStore::new());
        let queue = Arc::new(InMemoryDelayedQueue::default());
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let scheduler = Arc::new(BirthdayScheduler::new(queue, clock));

        let report = Reconciler::new(store, scheduler).sweep().await.unwrap();
        assert_eq!(report, ReconcileReport::default());
    }
}
