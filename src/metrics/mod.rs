//! Metrics module for Prometheus-based monitoring.
//!
//! Counts submissions, lost dispatches, publishes, deliveries, store operations and polls,
//! and times the route solver.
//!
//! # Example
//!
//! ```ignore
//! use route_dispatch::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_poll("ready");
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics, metrics_handler};

pub use prometheus::{
    ACTIVE_CONSUMERS, DELIVERIES_TOTAL, DISPATCH_FAILURES_TOTAL, JOBS_IN_PROGRESS, POLLS_TOTAL,
    PUBLISHES_TOTAL, REGISTRY, SOLVE_DURATION, STORE_OPERATIONS_TOTAL, SUBMISSIONS_TOTAL,
};
