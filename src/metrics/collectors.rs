//! Recording facade over the raw Prometheus metrics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library code
//! can record unconditionally and tests need no setup.

use super::prometheus::{
    ACTIVE_WORKERS, DELIVERY_LATENCY, NOTIFICATIONS_TOTAL, QUEUE_DEPTH, RESOLVER_REQUESTS_TOTAL,
    SCHEDULES_TOTAL,
};
use crate::scheduler::QueueStats;

/// Metrics collector for recording pipeline metrics.
///
/// # Example
///
/// ```ignore
/// use birthday_courier::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
///
/// collector.record_notification("sent");
/// collector.record_delivery_latency(0.42);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a processed notification (`sent`, `skipped`, `failed`).
    pub fn record_notification(&self, outcome: &str) {
        if let Some(counter) = NOTIFICATIONS_TOTAL.get() {
            counter.with_label_values(&[outcome]).inc();
        }

        tracing::trace!(outcome = outcome, "Recorded notification metric");
    }

    /// Record a scheduling attempt (`enqueued`, `duplicate`, `error`).
    pub fn record_schedule(&self, outcome: &str) {
        if let Some(counter) = SCHEDULES_TOTAL.get() {
            counter.with_label_values(&[outcome]).inc();
        }
    }

    /// Record a maps upstream call.
    pub fn record_resolver_request(&self, step: &str, status: &str) {
        if let Some(counter) = RESOLVER_REQUESTS_TOTAL.get() {
            counter.with_label_values(&[step, status]).inc();
        }
    }

    /// Record the latency of one outbound delivery call.
    pub fn record_delivery_latency(&self, latency_secs: f64) {
        if let Some(histogram) = DELIVERY_LATENCY.get() {
            histogram.observe(latency_secs);
        }
    }

    /// Publish a queue depth snapshot.
    pub fn update_queue_depth(&self, stats: &QueueStats) {
        if let Some(gauge) = QUEUE_DEPTH.get() {
            gauge
                .with_label_values(&["pending"])
                .set(stats.pending as f64);
            gauge.with_label_values(&["due"]).set(stats.due as f64);
            gauge
                .with_label_values(&["processing"])
                .set(stats.processing as f64);
            gauge
                .with_label_values(&["dead_letter"])
                .set(stats.dead_letter as f64);
        }
    }

    pub fn inc_active_workers(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.inc();
        }
    }

    pub fn dec_active_workers(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.dec();
        }
    }
}
