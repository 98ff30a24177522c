//! Person registration and removal.
//!
//! Registration runs in a fixed order:
//!
//! 1. resolve `"{city}, {country}"` to a time zone; any failure aborts with
//!    nothing stored and nothing scheduled
//! 2. store the person with the resolved zone and coordinate
//! 3. schedule the next birthday delivery
//!
//! A scheduling failure in step 3 does not undo step 2. It is handed back in
//! [`Registration::scheduling`] and the reconciliation sweep picks the
//! person up later.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::{RegistrationError, SchedulingError};
use crate::geo::TimeZoneResolver;
use crate::scheduler::{BirthdayScheduler, Scheduled};
use crate::storage::person::place_description;
use crate::storage::{NewPerson, Person, PersonStore};

/// Registration input as supplied by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPersonRequest {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    pub city: String,
    pub country: String,
}

impl NewPersonRequest {
    /// Checks the request before any upstream call is made.
    pub fn validate(&self, today: NaiveDate) -> Result<(), RegistrationError> {
        let email = self.email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(RegistrationError::InvalidRequest(format!(
                "invalid email address '{}'",
                self.email
            )));
        }

        for (field, value) in [
            ("first name", &self.first_name),
            ("last name", &self.last_name),
            ("city", &self.city),
            ("country", &self.country),
        ] {
            if value.trim().is_empty() {
                return Err(RegistrationError::InvalidRequest(format!(
                    "{} must not be empty",
                    field
                )));
            }
        }

        if self.date_of_birth > today {
            return Err(RegistrationError::InvalidRequest(format!(
                "date of birth {} is in the future",
                self.date_of_birth
            )));
        }

        Ok(())
    }

    /// `"{city}, {country}"`, the text handed to the resolver.
    pub fn place_description(&self) -> String {
        place_description(&self.city, &self.country)
    }
}

/// Result of a successful registration.
#[derive(Debug)]
pub struct Registration {
    pub person: Person,
    /// Outcome of scheduling the first delivery.
    pub scheduling: Result<Scheduled, SchedulingError>,
}

impl Registration {
    pub fn is_scheduled(&self) -> bool {
        self.scheduling.is_ok()
    }
}

pub struct PersonService {
    resolver: Arc<dyn TimeZoneResolver>,
    store: Arc<dyn PersonStore>,
    scheduler: Arc<BirthdayScheduler>,
    clock: Arc<dyn Clock>,
}

impl PersonService {
    pub fn new(
        resolver: Arc<dyn TimeZoneResolver>,
        store: Arc<dyn PersonStore>,
        scheduler: Arc<BirthdayScheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            resolver,
            store,
            scheduler,
            clock,
        }
    }

    /// Registers a person and schedules their next birthday.
    ///
    /// # Errors
    ///
    /// Returns `RegistrationError` if the request is invalid, the place
    /// cannot be resolved, or the person cannot be stored. In all three
    /// cases nothing is scheduled.
    pub async fn register(
        &self,
        request: NewPersonRequest,
    ) -> Result<Registration, RegistrationError> {
        let now = self.clock.now();
        request.validate(now.date_naive())?;

        let place = request.place_description();
        let resolved = self
            .resolver
            .resolve_time_zone(&place, now)
            .await
            .map_err(|e| {
                warn!(place = %place, error = %e, kind = e.kind(), "Time zone resolution failed");
                e
            })?;

        let person = self
            .store
            .create(NewPerson {
                email: request.email.trim().to_string(),
                first_name: request.first_name.trim().to_string(),
                last_name: request.last_name.trim().to_string(),
                date_of_birth: request.date_of_birth,
                time_zone: resolved.zone,
                city: request.city.trim().to_string(),
                country: request.country.trim().to_string(),
                location: Some(resolved.coordinate),
            })
            .await?;

        info!(
            person_id = person.id,
            time_zone = %person.time_zone,
            "Person registered"
        );

        let scheduling = self.scheduler.schedule(&person).await;
        if let Err(e) = &scheduling {
            warn!(person_id = person.id, error = %e, "Person registered without a scheduled delivery");
        }

        Ok(Registration { person, scheduling })
    }

    /// Deletes a person. A delivery already queued for them ends up skipped.
    pub async fn remove(&self, id: i64) -> Result<bool, RegistrationError> {
        let removed = self.store.delete(id).await?;
        if removed {
            info!(person_id = id, "Person removed");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::error::ResolutionError;
    use crate::geo::{GeoCoordinate, ResolvedTimeZone, TimeZoneId};
    use crate::scheduler::InMemoryDelayedQueue;
    use crate::storage::InMemoryPersonStore;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};

    struct StaticResolver {
        zone: Option<&'static str>,
    }

    #[async_trait]
    impl TimeZoneResolver for StaticResolver {
        async fn resolve_time_zone(
            &self,
            place: &str,
            _at: DateTime<Utc>,
        ) -> Result<ResolvedTimeZone, ResolutionError> {
            match self.zone {
                Some(zone) => Ok(ResolvedTimeZone {
                    zone: TimeZoneId::parse(zone).unwrap(),
                    coordinate: GeoCoordinate::new(34.05, -118.24),
                }),
                None => Err(ResolutionError::NoLocationFound(place.to_string())),
            }
        }
    }

    fn request() -> NewPersonRequest {
        NewPersonRequest {
            email: "ada@example.com".to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            date_of_birth: NaiveDate::from_ymd_opt(1990, 6, 15).unwrap(),
            city: "Los Angeles".to_string(),
            country: "USA".to_string(),
        }
    }

    fn service(
        zone: Option<&'static str>,
    ) -> (PersonService, Arc<InMemoryPersonStore>, Arc<InMemoryDelayedQueue>) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryPersonStore::new());
        let queue = Arc::new(InMemoryDelayedQueue::default());
        let scheduler = Arc::new(BirthdayScheduler::new(queue.clone(), clock.clone()));
        let service = PersonService::new(
            Arc::new(StaticResolver { zone }),
            store.clone(),
            scheduler,
            clock,
        );
        (service, store, queue)
    }

    #[tokio::test]
    async fn test_register_stores_and_schedules() {
        let (service, store, queue) = service(Some("America/Los_Angeles"));

        let registration = service.register(request()).await.unwrap();

        assert!(registration.is_scheduled());
        assert_eq!(registration.person.time_zone.as_str(), "America/Los_Angeles");
        assert!(registration.person.location.is_some());
        assert_eq!(store.len().await, 1);

        let pending = queue.pending_jobs().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(
            pending[0].not_before,
            Utc.with_ymd_and_hms(2024, 6, 15, 16, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_unresolvable_place_aborts_registration() {
        let (service, store, queue) = service(None);

        let err = service.register(request()).await.unwrap_err();

        assert!(matches!(
            err,
            RegistrationError::Resolution(ResolutionError::NoLocationFound(ref place)) if place == "Los Angeles, USA"
        ));
        assert!(store.is_empty().await);
        assert!(queue.pending_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected() {
        let (service, store, _queue) = service(Some("UTC"));

        let mut bad = request();
        bad.email = "not-an-email".to_string();
        assert!(matches!(
            service.register(bad).await,
            Err(RegistrationError::InvalidRequest(_))
        ));

        let mut bad = request();
        bad.city = "  ".to_string();
        assert!(matches!(
            service.register(bad).await,
            Err(RegistrationError::InvalidRequest(_))
        ));

        let mut bad = request();
        bad.date_of_birth = NaiveDate::from_ymd_opt(2030, 1, 1).unwrap();
        assert!(matches!(
            service.register(bad).await,
            Err(RegistrationError::InvalidRequest(_))
        ));

        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_duplicate_email_is_store_error() {
        let (service, _store, _queue) = service(Some("UTC"));

        service.register(request()).await.unwrap();
        let err = service.register(request()).await.unwrap_err();
        assert!(matches!(err, RegistrationError::Store(_)));
    }

    #[tokio::test]
    async fn test_remove() {
        let (service, store, _queue) = service(Some("UTC"));
        let registration = service.register(request()).await.unwrap();

        assert!(service.remove(registration.person.id).await.unwrap());
        assert!(!service.remove(registration.person.id).await.unwrap());
        assert!(store.is_empty().await);
    }

    #[test]
    fn test_request_deserializes_camel_case() {
        let request: NewPersonRequest = serde_json::from_str(
            r#"{"email":"a@b.c","firstName":"A","lastName":"B","dateOfBirth":"1990-06-15","city":"Paris","country":"France"}"#,
        )
        .unwrap();
        assert_eq!(request.first_name, "A");
        assert_eq!(request.place_description(), "Paris, France");
    }
}
