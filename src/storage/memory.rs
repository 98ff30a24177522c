//! In-memory person store for tests and dry runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::clock::{Clock, SystemClock};

use super::person::{NewPerson, Person};
use super::store::{PersonStore, StoreError};

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    persons: BTreeMap<i64, Person>,
    /// Delivery lease expiry per person.
    leases: HashMap<i64, DateTime<Utc>>,
}

/// `PersonStore` held entirely in process memory.
pub struct InMemoryPersonStore {
    inner: RwLock<Inner>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryPersonStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl InMemoryPersonStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that stamps `created_at` from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            clock,
        }
    }

    /// Number of stored persons.
    pub async fn len(&self) -> usize {
        self.inner.read().await.persons.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Current delivery lease expiry for `id`, if one was taken and not dropped.
    pub async fn lease_until(&self, id: i64) -> Option<DateTime<Utc>> {
        self.inner.read().await.leases.get(&id).copied()
    }
}

#[async_trait]
impl PersonStore for InMemoryPersonStore {
    async fn create(&self, person: NewPerson) -> Result<Person, StoreError> {
        let mut inner = self.inner.write().await;

        if inner
            .persons
            .values()
            .any(|existing| existing.email.eq_ignore_ascii_case(&person.email))
        {
            return Err(StoreError::Duplicate(person.email));
        }

        inner.next_id += 1;
        let id = inner.next_id;
        let stored = person.into_person(id, self.clock.now());
        inner.persons.insert(id, stored.clone());

        Ok(stored)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Person>, StoreError> {
        Ok(self.inner.read().await.persons.get(&id).cloned())
    }

    async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        inner.leases.remove(&id);
        Ok(inner.persons.remove(&id).is_some())
    }

    async fn list_ids(&self) -> Result<Vec<i64>, StoreError> {
        Ok(self.inner.read().await.persons.keys().copied().collect())
    }

    async fn update_last_notified(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(person) = self.inner.write().await.persons.get_mut(&id) {
            person.last_notified_at = Some(at);
        }
        Ok(())
    }

    async fn try_claim_notification(
        &self,
        id: i64,
        expected: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;

        let unchanged = inner
            .persons
            .get(&id)
            .is_some_and(|person| person.last_notified_at == expected);
        let lease_free = inner.leases.get(&id).map_or(true, |until| *until <= now);

        if unchanged && lease_free {
            inner.leases.insert(id, lease_until);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn complete_notification(
        &self,
        id: i64,
        lease_until: DateTime<Utc>,
        sent_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        if inner.leases.get(&id) != Some(&lease_until) {
            return Ok(false);
        }

        match inner.persons.get_mut(&id) {
            Some(person) => {
                person.last_notified_at = Some(sent_at);
                inner.leases.remove(&id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release_notification_claim(
        &self,
        id: i64,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.leases.get(&id) == Some(&lease_until) {
            inner.leases.remove(&id);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
