//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by route_dispatch and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all route_dispatch metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Admission attempts, labeled by outcome (accepted, bad_request, unprocessable).
pub static SUBMISSIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Admitted jobs whose inbound publish gave up. Each one is a lost job.
pub static DISPATCH_FAILURES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Envelope publishes, labeled by exchange and status.
pub static PUBLISHES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Deliveries handled by consumers, labeled by queue and outcome.
pub static DELIVERIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Result store operations, labeled by operation and status.
pub static STORE_OPERATIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Result polls, labeled by outcome.
pub static POLLS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Time spent inside the route solver, in seconds.
pub static SOLVE_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Number of deliveries currently being handled.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of running consume loops.
pub static ACTIVE_CONSUMERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls build a fresh registry but leave the
/// first one installed, so recording keeps working.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let submissions_total = CounterVec::new(
        Opts::new("route_dispatch_submissions_total", "Route job submissions"),
        &["outcome"],
    )?;

    let dispatch_failures_total = Counter::new(
        "route_dispatch_dispatch_failures_total",
        "Admitted jobs that could not be enqueued",
    )?;

    let publishes_total = CounterVec::new(
        Opts::new("route_dispatch_publishes_total", "Envelopes published"),
        &["exchange", "status"],
    )?;

    let deliveries_total = CounterVec::new(
        Opts::new("route_dispatch_deliveries_total", "Deliveries handled by consumers"),
        &["queue", "outcome"],
    )?;

    let store_operations_total = CounterVec::new(
        Opts::new(
            "route_dispatch_store_operations_total",
            "Result store operations",
        ),
        &["operation", "status"],
    )?;

    let polls_total = CounterVec::new(
        Opts::new("route_dispatch_polls_total", "Result polls"),
        &["outcome"],
    )?;

    let solve_duration = Histogram::with_opts(
        HistogramOpts::new(
            "route_dispatch_solve_duration_seconds",
            "Route solver duration in seconds",
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
    )?;

    let jobs_in_progress = Gauge::new(
        "route_dispatch_jobs_in_progress",
        "Deliveries currently being handled",
    )?;

    let active_consumers = Gauge::new(
        "route_dispatch_active_consumers",
        "Number of running consume loops",
    )?;

    registry.register(Box::new(submissions_total.clone()))?;
    registry.register(Box::new(dispatch_failures_total.clone()))?;
    registry.register(Box::new(publishes_total.clone()))?;
    registry.register(Box::new(deliveries_total.clone()))?;
    registry.register(Box::new(store_operations_total.clone()))?;
    registry.register(Box::new(polls_total.clone()))?;
    registry.register(Box::new(solve_duration.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(active_consumers.clone()))?;

    // Already-set cells mean metrics were initialized earlier.
    let _ = REGISTRY.set(registry);
    let _ = SUBMISSIONS_TOTAL.set(submissions_total);
    let _ = DISPATCH_FAILURES_TOTAL.set(dispatch_failures_total);
    let _ = PUBLISHES_TOTAL.set(publishes_total);
    let _ = DELIVERIES_TOTAL.set(deliveries_total);
    let _ = STORE_OPERATIONS_TOTAL.set(store_operations_total);
    let _ = POLLS_TOTAL.set(polls_total);
    let _ = SOLVE_DURATION.set(solve_duration);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = ACTIVE_CONSUMERS.set(active_consumers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead when the registry has not been
/// initialized or encoding fails.
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

/// HTTP handler for the /metrics endpoint.
pub async fn metrics_handler() -> String {
    export_metrics()
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
        // Either real output or the uninitialized notice, depending on test order.
        let metrics = export_metrics();
        assert!(!metrics.is_empty());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(submissions) = SUBMISSIONS_TOTAL.get() {
            submissions.with_label_values(&["accepted"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("route_dispatch_submissions_total"));
    }
}
