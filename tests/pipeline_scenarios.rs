//! End-to-end pipeline tests.
//!
//! Registration, scheduling and delivery run against in-memory storage and
//! queue, with the maps and email upstreams served by wiremock.
//! Run with: cargo test --test pipeline_scenarios

use std::sync::Arc;
use std::time::Duration;

use birthday_courier::clock::{Clock, FixedClock};
use birthday_courier::config::{DeliveryConfig, ResolverConfig};
use birthday_courier::delivery::HttpDeliveryClient;
use birthday_courier::error::{RegistrationError, ResolutionError};
use birthday_courier::geo::GoogleMapsResolver;
use birthday_courier::notify::NotificationProcessor;
use birthday_courier::people::{NewPersonRequest, PersonService};
use birthday_courier::scheduler::{
    BirthdayScheduler, InMemoryDelayedQueue, JobStatus, WorkerPool, WorkerPoolConfig,
};
use birthday_courier::storage::{InMemoryPersonStore, PersonStore};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::json;
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Pipeline {
    clock: Arc<FixedClock>,
    store: Arc<InMemoryPersonStore>,
    queue: Arc<InMemoryDelayedQueue>,
    people: PersonService,
    pool: WorkerPool,
}

fn registration_instant() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
}

fn delivery_instant() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 15, 16, 0, 0).unwrap()
}

fn build_pipeline(maps: &MockServer, email: &MockServer, delivery_timeout: Duration) -> Pipeline {
    let clock = Arc::new(FixedClock::new(registration_instant()));
    let store = Arc::new(InMemoryPersonStore::with_clock(clock.clone()));
    let queue = Arc::new(InMemoryDelayedQueue::default());

    let resolver = GoogleMapsResolver::new(ResolverConfig {
        api_key: Some("test-key".to_string()),
        base_url: maps.uri(),
        timeout: Duration::from_secs(2),
    });
    let scheduler = Arc::new(BirthdayScheduler::new(queue.clone(), clock.clone()));
    let people = PersonService::new(
        Arc::new(resolver),
        store.clone(),
        scheduler,
        clock.clone(),
    );

    let client = HttpDeliveryClient::new(&DeliveryConfig {
        endpoint: format!("{}/send", email.uri()),
        timeout: delivery_timeout,
        subject: "Happy Birthday!".to_string(),
    });
    let processor = Arc::new(NotificationProcessor::new(
        store.clone(),
        Arc::new(client),
        clock.clone(),
    ));
    let pool = WorkerPool::new(
        WorkerPoolConfig::new(1).with_retry_delay(Duration::from_secs(60)),
        queue.clone(),
        processor,
        clock.clone(),
    );

    Pipeline {
        clock,
        store,
        queue,
        people,
        pool,
    }
}

async fn mount_los_angeles(maps: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/geocode/json"))
        .and(query_param("address", "Los Angeles, USA"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "OK",
            "results": [{"geometry": {"location": {"lat": 34.0522, "lng": -118.2437}}}]
        })))
        .mount(maps)
        .await;

    Mock::given(method("GET"))
        .and(path("/timezone/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "OK",
            "timeZoneId": "America/Los_Angeles"
        })))
        .mount(maps)
        .await;
}

fn ada() -> NewPersonRequest {
    NewPersonRequest {
        email: "ada@example.com".to_string(),
        first_name: "Ada".to_string(),
        last_name: "Lovelace".to_string(),
        date_of_birth: NaiveDate::from_ymd_opt(1990, 6, 15).unwrap(),
        city: "Los Angeles".to_string(),
        country: "USA".to_string(),
    }
}

fn sent_response() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "status": "sent",
        "sentTime": "2024-06-15T16:00:01Z"
    }))
}

#[tokio::test]
async fn test_registered_person_is_greeted_at_local_nine() {
    let maps = MockServer::start().await;
    let email = MockServer::start().await;
    mount_los_angeles(&maps).await;

    Mock::given(method("POST"))
        .and(path("/send"))
        .and(body_json(json!({
            "email": "ada@example.com",
            "subject": "Happy Birthday!",
            "message": "Happy Birthday, Ada!"
        })))
        .respond_with(sent_response())
        .expect(1)
        .mount(&email)
        .await;

    let pipeline = build_pipeline(&maps, &email, Duration::from_secs(2));
    let registration = pipeline.people.register(ada()).await.unwrap();
    assert_eq!(registration.person.created_at, registration_instant());
    let scheduled = registration.scheduling.expect("delivery should be scheduled");
    assert_eq!(scheduled.delivery().not_before, delivery_instant());

    // One minute early: nothing is due.
    pipeline
        .clock
        .set(delivery_instant() - chrono::Duration::minutes(1));
    assert!(pipeline.pool.drain_due().await.unwrap().is_empty());

    pipeline.clock.set(delivery_instant());
    let results = pipeline.pool.drain_due().await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, JobStatus::Sent);

    let person = pipeline
        .store
        .find_by_id(registration.person.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(person.last_notified_at, Some(delivery_instant()));
    assert!(pipeline.queue.pending_jobs().await.is_empty());
}

#[tokio::test]
async fn test_unknown_place_creates_nothing() {
    let maps = MockServer::start().await;
    let email = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/geocode/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "ZERO_RESULTS",
            "results": []
        })))
        .mount(&maps)
        .await;
    Mock::given(method("GET"))
        .and(path("/timezone/json"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&maps)
        .await;

    let pipeline = build_pipeline(&maps, &email, Duration::from_secs(2));
    let mut request = ada();
    request.city = "Nowhereville".to_string();
    request.country = "Atlantis".to_string();

    let err = pipeline.people.register(request).await.unwrap_err();
    assert!(matches!(
        err,
        RegistrationError::Resolution(ResolutionError::NoLocationFound(ref place)) if place == "Nowhereville, Atlantis"
    ));
    assert!(pipeline.store.is_empty().await);
    assert!(pipeline.queue.pending_jobs().await.is_empty());
}

#[tokio::test]
async fn test_recently_notified_person_is_skipped() {
    let maps = MockServer::start().await;
    let email = MockServer::start().await;
    mount_los_angeles(&maps).await;

    Mock::given(method("POST"))
        .respond_with(sent_response())
        .expect(0)
        .mount(&email)
        .await;

    let pipeline = build_pipeline(&maps, &email, Duration::from_secs(2));
    let registration = pipeline.people.register(ada()).await.unwrap();
    let id = registration.person.id;

    let earlier = delivery_instant() - chrono::Duration::hours(20);
    pipeline.store.update_last_notified(id, earlier).await.unwrap();

    pipeline.clock.set(delivery_instant());
    let results = pipeline.pool.drain_due().await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, JobStatus::Skipped);

    let person = pipeline.store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(person.last_notified_at, Some(earlier));
}

#[tokio::test]
async fn test_delivery_timeout_is_retried() {
    let maps = MockServer::start().await;
    let email = MockServer::start().await;
    mount_los_angeles(&maps).await;

    Mock::given(method("POST"))
        .respond_with(sent_response().set_delay(Duration::from_millis(500)))
        .up_to_n_times(1)
        .expect(1)
        .mount(&email)
        .await;
    Mock::given(method("POST"))
        .respond_with(sent_response())
        .expect(1)
        .mount(&email)
        .await;

    let pipeline = build_pipeline(&maps, &email, Duration::from_millis(100));
    let registration = pipeline.people.register(ada()).await.unwrap();
    let id = registration.person.id;

    pipeline.clock.set(delivery_instant());
    let results = pipeline.pool.drain_due().await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, JobStatus::Retrying);

    let person = pipeline.store.find_by_id(id).await.unwrap().unwrap();
    assert!(person.last_notified_at.is_none());

    pipeline.clock.advance(chrono::Duration::seconds(60));
    let results = pipeline.pool.drain_due().await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, JobStatus::Sent);

    let person = pipeline.store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(person.last_notified_at, Some(pipeline.clock.now()));
}

#[tokio::test]
async fn test_worker_lost_mid_send_is_redelivered() {
    let maps = MockServer::start().await;
    let email = MockServer::start().await;
    mount_los_angeles(&maps).await;

    Mock::given(method("POST"))
        .respond_with(sent_response().set_delay(Duration::from_secs(3600)))
        .up_to_n_times(1)
        .mount(&email)
        .await;
    Mock::given(method("POST"))
        .respond_with(sent_response())
        .expect(1)
        .mount(&email)
        .await;

    let pipeline = build_pipeline(&maps, &email, Duration::from_secs(30));
    let registration = pipeline.people.register(ada()).await.unwrap();
    let id = registration.person.id;

    // The worker disappears while its send is in flight: no ack, no retry.
    pipeline.clock.set(delivery_instant());
    let lost = tokio::time::timeout(Duration::from_millis(200), pipeline.pool.drain_due()).await;
    assert!(lost.is_err());

    let person = pipeline.store.find_by_id(id).await.unwrap().unwrap();
    assert!(person.last_notified_at.is_none());

    // Past the queue's visibility timeout the job comes back and is sent once.
    pipeline.clock.advance(chrono::Duration::minutes(5));
    let results = pipeline.pool.drain_due().await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, JobStatus::Sent);

    let person = pipeline.store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(person.last_notified_at, Some(pipeline.clock.now()));
    assert!(pipeline.queue.pending_jobs().await.is_empty());
}

#[tokio::test]
async fn test_removed_person_is_skipped() {
    let maps = MockServer::start().await;
    let email = MockServer::start().await;
    mount_los_angeles(&maps).await;

    Mock::given(method("POST"))
        .respond_with(sent_response())
        .expect(0)
        .mount(&email)
        .await;

    let pipeline = build_pipeline(&maps, &email, Duration::from_secs(2));
    let registration = pipeline.people.register(ada()).await.unwrap();
    assert!(pipeline.people.remove(registration.person.id).await.unwrap());

    pipeline.clock.set(delivery_instant());
    let results = pipeline.pool.drain_due().await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, JobStatus::Skipped);
    assert!(pipeline.queue.pending_jobs().await.is_empty());
}

#[tokio::test]
async fn test_rescheduling_is_idempotent() {
    let maps = MockServer::start().await;
    let email = MockServer::start().await;
    mount_los_angeles(&maps).await;

    let pipeline = build_pipeline(&maps, &email, Duration::from_secs(2));
    let registration = pipeline.people.register(ada()).await.unwrap();

    let scheduler = BirthdayScheduler::new(pipeline.queue.clone(), pipeline.clock.clone());
    let again = scheduler.schedule(&registration.person).await.unwrap();

    assert!(!again.is_new());
    assert_eq!(
        again.delivery().job_id,
        registration.scheduling.unwrap().delivery().job_id
    );
    assert_eq!(pipeline.queue.pending_jobs().await.len(), 1);
}
