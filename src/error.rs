//! Error types for the birthday notification pipeline.
//!
//! Defines the error taxonomy shared across the pipeline stages:
//! - Time zone resolution (geocoding + zone lookup)
//! - Delivery instant calculation
//! - Scheduling onto the delayed queue
//! - Outbound message delivery
//! - Worker-side notification processing
//! - Person registration

use thiserror::Error;

use crate::scheduler::QueueError;
use crate::storage::StoreError;

/// Errors that can occur while turning a place description into a time zone.
///
/// None of these are retried by the resolver. A failed resolution must block
/// person creation instead of defaulting to a wrong zone.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("No location found for '{0}'")]
    NoLocationFound(String),

    #[error("No time zone found for coordinate ({latitude}, {longitude}): {status}")]
    NoTimeZoneFound {
        latitude: f64,
        longitude: f64,
        status: String,
    },

    #[error("Upstream unavailable during {step}: {message}")]
    UpstreamUnavailable { step: String, message: String },

    #[error("Missing API credentials: resolver is not configured")]
    MissingCredentials,
}

impl ResolutionError {
    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoLocationFound(_) => "no_location_found",
            Self::NoTimeZoneFound { .. } => "no_time_zone_found",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::MissingCredentials => "missing_credentials",
        }
    }
}

/// Errors that can occur while computing a delivery instant.
#[derive(Debug, Error)]
pub enum CalculatorError {
    #[error("Unknown time zone identifier '{0}'")]
    UnknownTimeZone(String),

    #[error("Invalid delivery hour {0}: must be between 0 and 23")]
    InvalidDeliveryHour(u32),

    #[error("No local {hour:02}:00 exists on {date} in {zone}")]
    NonexistentLocalTime {
        date: chrono::NaiveDate,
        hour: u32,
        zone: String,
    },
}

/// Errors that can occur while scheduling a birthday delivery.
///
/// A scheduling failure never rolls back person creation. It is reported so
/// a reconciliation sweep can pick the person up later.
#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("Cannot compute delivery time for person {person_id}: {source}")]
    Calculation {
        person_id: i64,
        #[source]
        source: CalculatorError,
    },

    #[error("Queue unavailable while scheduling person {person_id}: {source}")]
    QueueUnavailable {
        person_id: i64,
        #[source]
        source: QueueError,
    },
}

/// Outbound delivery failure.
///
/// Timeouts, transport errors and non-success responses are deliberately a
/// single kind: the processor handles all of them the same way.
#[derive(Debug, Error)]
#[error("Delivery failed: {0}")]
pub struct DeliveryError(pub String);

/// Errors that abort a notification processing attempt before any outcome
/// can be recorded (the job stays un-acknowledged and is redelivered).
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Unsupported task type '{0}'")]
    UnsupportedTaskType(String),

    #[error("Person store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors that can occur while registering a new person.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Time zone resolution failed: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Person store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid registration request: {0}")]
    InvalidRequest(String),
}
