//! Person storage interface.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::migrations::MigrationError;
use super::person::{NewPerson, Person};

/// Errors that can occur during person storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    /// A stored row could not be turned into a `Person`.
    #[error("Invalid record for person {id}: {message}")]
    InvalidRecord { id: i64, message: String },

    /// A person with the same email already exists.
    #[error("Duplicate person: {0}")]
    Duplicate(String),
}

/// Persistence for person records.
///
/// Concurrent deliveries for the same person are serialized with a delivery
/// lease that is stored apart from `last_notified_at`. The lease expires on its
/// own, so a worker that dies mid-send never blocks redelivery, and
/// `last_notified_at` is only written once a send has succeeded.
#[async_trait]
pub trait PersonStore: Send + Sync {
    /// Persists a new person and returns the stored record.
    async fn create(&self, person: NewPerson) -> Result<Person, StoreError>;

    /// Looks up a person by id.
    async fn find_by_id(&self, id: i64) -> Result<Option<Person>, StoreError>;

    /// Deletes a person. Returns whether a record existed.
    async fn delete(&self, id: i64) -> Result<bool, StoreError>;

    /// Returns every stored person id in ascending order.
    async fn list_ids(&self) -> Result<Vec<i64>, StoreError>;

    /// Unconditionally sets `last_notified_at`.
    async fn update_last_notified(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Takes the delivery lease until `lease_until`.
    ///
    /// Succeeds only if no unexpired lease is held at `now` and
    /// `last_notified_at` still equals `expected`. Returns `false` when
    /// another worker holds the lease, a send completed in between, or the
    /// person no longer exists.
    async fn try_claim_notification(
        &self,
        id: i64,
        expected: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Records a successful send: sets `last_notified_at = sent_at` and drops
    /// the lease, provided the lease taken with `lease_until` is still held.
    ///
    /// Returns `false` when the lease was lost (expired and re-taken).
    async fn complete_notification(
        &self,
        id: i64,
        lease_until: DateTime<Utc>,
        sent_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Drops the lease after a failed send, leaving `last_notified_at` as is.
    async fn release_notification_claim(
        &self,
        id: i64,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}
