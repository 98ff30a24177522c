//! Outbound messaging channel.

pub mod client;

pub use client::{idempotency_token, DeliveryClient, HttpDeliveryClient, Sent, IDEMPOTENCY_HEADER};
