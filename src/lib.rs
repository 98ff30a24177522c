//! birthday-courier: birthday message scheduling and delivery.
//!
//! People are registered with a free-text location that is resolved to an
//! IANA time zone. For each person a delayed job is scheduled for 09:00 on
//! their next birthday in that zone, and a pool of workers delivers the
//! message when the job comes due, at most once per dedup window.

// Core modules
pub mod cli;
pub mod clock;
pub mod config;
pub mod delivery;
pub mod error;
pub mod geo;
pub mod metrics;
pub mod notify;
pub mod people;
pub mod scheduler;
pub mod storage;
pub mod timing;

// Re-export commonly used error types
pub use error::{
    CalculatorError, DeliveryError, ProcessError, RegistrationError, ResolutionError,
    SchedulingError,
};
