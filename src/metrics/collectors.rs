//! Recording helpers for dispatch metrics.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics so call sites use
//! consistent labels. Every method is a no-op until `init_metrics()` runs.

use super::prometheus::{
    ACTIVE_CONSUMERS, DELIVERIES_TOTAL, DISPATCH_FAILURES_TOTAL, JOBS_IN_PROGRESS, POLLS_TOTAL, PUBLISHES_TOTAL,
    SOLVE_DURATION, STORE_OPERATIONS_TOTAL, SUBMISSIONS_TOTAL,
};

/// Metrics collector for recording dispatch operational metrics.
///
/// # Example
///
/// ```ignore
/// use route_dispatch::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_submission("accepted");
/// collector.record_delivery("planning.outbound", "acked");
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one admission attempt.
    pub fn record_submission(&self, outcome: &str) {
        if let Some(submissions) = SUBMISSIONS_TOTAL.get() {
            submissions.with_label_values(&[outcome]).inc();
        }

        tracing::trace!(outcome = outcome, "Recorded submission metric");
    }

    /// Record an admitted job that never reached the inbound queue.
    pub fn record_dispatch_failure(&self) {
        if let Some(failures) = DISPATCH_FAILURES_TOTAL.get() {
            failures.inc();
        }

        tracing::trace!("Recorded dispatch failure metric");
    }

    /// Record one envelope publish.
    pub fn record_publish(&self, exchange: &str, success: bool) {
        let status = if success { "success" } else { "failure" };

        if let Some(publishes) = PUBLISHES_TOTAL.get() {
            publishes.with_label_values(&[exchange, status]).inc();
        }

        tracing::trace!(exchange = exchange, status = status, "Recorded publish metric");
    }

    /// Record how a consumer settled one delivery.
    ///
    /// # Arguments
    ///
    /// * `queue` - Queue the delivery came from
    /// * `outcome` - "acked", "requeued", "discarded" or "unacked"
    pub fn record_delivery(&self, queue: &str, outcome: &str) {
        if let Some(deliveries) = DELIVERIES_TOTAL.get() {
            deliveries.with_label_values(&[queue, outcome]).inc();
        }

        tracing::trace!(queue = queue, outcome = outcome, "Recorded delivery metric");
    }

    /// Record one result store operation.
    pub fn record_store_op(&self, operation: &str, success: bool) {
        let status = if success { "success" } else { "failure" };

        if let Some(store_ops) = STORE_OPERATIONS_TOTAL.get() {
            store_ops.with_label_values(&[operation, status]).inc();
        }
    }

    /// Record one poll of the result endpoint.
    pub fn record_poll(&self, outcome: &str) {
        if let Some(polls) = POLLS_TOTAL.get() {
            polls.with_label_values(&[outcome]).inc();
        }
    }

    /// Record time spent solving one job.
    pub fn record_solve(&self, duration_secs: f64) {
        if let Some(solve_duration) = SOLVE_DURATION.get() {
            solve_duration.observe(duration_secs);
        }

        tracing::trace!(duration_secs = duration_secs, "Recorded solve metric");
    }

    /// Update the count of running consume loops.
    pub fn update_consumers(&self, count: usize) {
        if let Some(active_consumers) = ACTIVE_CONSUMERS.get() {
            active_consumers.set(count as f64);
        }

        tracing::trace!(count = count, "Updated active consumers metric");
    }

    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }
}
