//! route-dispatch: asynchronous route-optimization job dispatch.
//!
//! Jobs are admitted over HTTP, travel through two durable queues (solver
//! side and cache side) and end up as entries in a keyed result store that
//! clients poll by correlation id.

// Core modules
pub mod admission;
pub mod api;
pub mod broker;
pub mod cli;
pub mod config;
pub mod envelope;
pub mod error;
pub mod job;
pub mod metrics;
pub mod pipeline;
pub mod polling;
pub mod retry;
pub mod solver;
pub mod store;

// Re-export commonly used error types
pub use error::{BrokerError, EnvelopeError, StoreError};
