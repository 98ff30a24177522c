//! Notification processing.

pub mod message;
pub mod processor;

pub use message::BirthdayMessage;
pub use processor::{DeliveryState, NotificationProcessor, ProcessOutcome, SkipReason};
