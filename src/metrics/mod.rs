//! Prometheus-based monitoring.
//!
//! # Example
//!
//! ```ignore
//! use birthday_courier::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_notification("sent");
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, DELIVERY_LATENCY, NOTIFICATIONS_TOTAL, QUEUE_DEPTH, REGISTRY,
    RESOLVER_REQUESTS_TOTAL, SCHEDULES_TOTAL,
};
