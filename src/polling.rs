//! Client polling: correlation id in, cached result or "absent" out.
//!
//! Polling never mutates anything and is safe to call as often as clients
//! like. A job still in flight and an id that was never issued look the
//! same: both are `Absent`.

use std::sync::Arc;

use thiserror::Error;

use crate::job::{CorrelationId, CorrelationIdError};
use crate::metrics::MetricsCollector;
use crate::store::ResultStore;

/// Reasons a poll is refused before the store is consulted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    #[error("request id is missing")]
    MissingId,

    #[error("request id '{0}' is malformed")]
    MalformedId(String),
}

/// Result of a well-formed poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Serialized route as stored by the cache writer.
    Ready(String),
    Absent,
}

#[derive(Clone)]
pub struct ResultPoller {
    store: Arc<dyn ResultStore>,
    metrics: MetricsCollector,
}

impl ResultPoller {
    pub fn new(store: Arc<dyn ResultStore>) -> Self {
        Self {
            store,
            metrics: MetricsCollector::new(),
        }
    }

    /// Looks up `request_id` after checking its format.
    ///
    /// A store failure is reported as `Absent`; it is logged so operators
    /// can tell an outage from a missing result.
    pub async fn poll(&self, request_id: Option<&str>) -> Result<PollOutcome, PollError> {
        let id = match CorrelationId::parse(request_id.unwrap_or_default()) {
            Ok(id) => id,
            Err(CorrelationIdError::Empty) => {
                self.metrics.record_poll("bad_request");
                return Err(PollError::MissingId);
            }
            Err(CorrelationIdError::Malformed(raw)) => {
                self.metrics.record_poll("unprocessable");
                return Err(PollError::MalformedId(raw));
            }
        };

        let outcome = match self.store.read(&id).await {
            Ok(Some(value)) => {
                self.metrics.record_store_op("read", true);
                PollOutcome::Ready(value)
            }
            Ok(None) => {
                self.metrics.record_store_op("read", true);
                PollOutcome::Absent
            }
            Err(e) => {
                self.metrics.record_store_op("read", false);
                tracing::warn!(
                    correlation_id = %id,
                    error = %e,
                    "Result store read failed, reporting absent"
                );
                PollOutcome::Absent
            }
        };

        self.metrics.record_poll(match outcome {
            PollOutcome::Ready(_) => "ready",
            PollOutcome::Absent => "absent",
        });
        Ok(outcome)
    }
}
