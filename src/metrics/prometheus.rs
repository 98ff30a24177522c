//! Prometheus metrics registration and export.
//!
//! Defines every metric the pipeline records and provides functions for
//! initializing the registry and rendering it in text format.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all pipeline metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Processed birthday notifications, labeled by outcome (sent/skipped/failed).
pub static NOTIFICATIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Scheduling attempts, labeled by outcome (enqueued/duplicate/error).
pub static SCHEDULES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Maps upstream calls, labeled by step (geocode/timezone) and status.
pub static RESOLVER_REQUESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Outbound delivery latency in seconds.
pub static DELIVERY_LATENCY: OnceLock<Histogram> = OnceLock::new();

/// Queue depth, labeled by state (pending/due/processing/dead_letter).
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of running delivery workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Repeated calls leave the first registration in
/// place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let notifications_total = CounterVec::new(
        Opts::new(
            "birthday_notifications_total",
            "Processed birthday notifications",
        ),
        &["outcome"],
    )?;

    let schedules_total = CounterVec::new(
        Opts::new("birthday_schedules_total", "Birthday scheduling attempts"),
        &["outcome"],
    )?;

    let resolver_requests_total = CounterVec::new(
        Opts::new(
            "birthday_resolver_requests_total",
            "Maps upstream requests made by the time zone resolver",
        ),
        &["step", "status"],
    )?;

    let delivery_latency = Histogram::with_opts(
        HistogramOpts::new(
            "birthday_delivery_latency_seconds",
            "Outbound message delivery latency in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0]),
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("birthday_queue_depth", "Jobs in the delayed queue"),
        &["state"],
    )?;

    let active_workers = Gauge::new(
        "birthday_active_workers",
        "Number of workers currently processing a job",
    )?;

    registry.register(Box::new(notifications_total.clone()))?;
    registry.register(Box::new(schedules_total.clone()))?;
    registry.register(Box::new(resolver_requests_total.clone()))?;
    registry.register(Box::new(delivery_latency.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // Already-set cells mean a previous call won; keep its metrics.
    let _ = REGISTRY.set(registry);
    let _ = NOTIFICATIONS_TOTAL.set(notifications_total);
    let _ = SCHEDULES_TOTAL.set(schedules_total);
    let _ = RESOLVER_REQUESTS_TOTAL.set(resolver_requests_total);
    let _ = DELIVERY_LATENCY.set(delivery_latency);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead when the registry has not been initialized
/// or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_metrics_never_empty() {
        let metrics = export_metrics();
        assert!(!metrics.is_empty());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(counter) = NOTIFICATIONS_TOTAL.get() {
            counter.with_label_values(&["sent"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("birthday_notifications_total"));
    }
}
