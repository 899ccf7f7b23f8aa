//! Request admission: validate a submitted job, mint its correlation id and
//! hand it to the inbound queue without waiting for the solve.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::broker::{Publisher, QueueBinding};
use crate::envelope::RouteRequest;
use crate::error::BrokerError;
use crate::job::{CorrelationId, Job, JobSubmission};
use crate::metrics::MetricsCollector;
use crate::retry::RetryPolicy;

/// Reasons a submission is refused before it reaches the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// The body is not a JSON object.
    #[error("submission is not an object")]
    BadRequest,

    /// The body is an object but does not describe a job.
    #[error("submission cannot be processed: {0}")]
    Unprocessable(String),
}

impl AdmissionError {
    fn outcome(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::Unprocessable(_) => "unprocessable",
        }
    }
}

/// Front door of the pipeline.
///
/// `submit` returns as soon as the job has an id. Computing the distance
/// matrix and publishing happen on a spawned task, so a caller learns about
/// completion only by polling the result store. Spawned dispatches are
/// counted so shutdown can `drain` them before the broker closes.
#[derive(Clone)]
pub struct Admission {
    publisher: Arc<Publisher>,
    inbound: QueueBinding,
    retry: RetryPolicy,
    metrics: MetricsCollector,
    in_flight: Arc<watch::Sender<usize>>,
}

/// Decrements the in-flight count when a dispatch task ends, even by panic.
struct InFlight(Arc<watch::Sender<usize>>);

impl InFlight {
    fn enter(counter: &Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl Admission {
    pub fn new(publisher: Arc<Publisher>, inbound: QueueBinding, retry: RetryPolicy) -> Self {
        Self {
            publisher,
            inbound,
            retry,
            metrics: MetricsCollector::new(),
            in_flight: Arc::new(watch::channel(0).0),
        }
    }

    /// Number of dispatches spawned by `submit` that have not finished.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Waits for every spawned dispatch to finish.
    ///
    /// Returns `false` if some were still running after `timeout`. Call this
    /// after the HTTP server stops accepting work and before the broker
    /// closes, so an id already handed out is not lost on shutdown.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let mut rx = self.in_flight.subscribe();
        let drained = tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0)).await;
        match drained {
            Ok(_) => true,
            Err(_) => {
                warn!(
                    pending = self.in_flight(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Dispatches still running at drain timeout"
                );
                false
            }
        }
    }

    /// Validates `body` and binds it to a fresh correlation id.
    ///
    /// An empty object is unprocessable rather than a bad request: it is
    /// syntactically acceptable but describes nothing.
    pub fn admit(&self, body: Value) -> Result<Job, AdmissionError> {
        let fields = match &body {
            Value::Object(fields) => fields,
            _ => return Err(AdmissionError::BadRequest),
        };
        if fields.is_empty() {
            return Err(AdmissionError::Unprocessable(
                "submission is empty".to_string(),
            ));
        }

        let submission: JobSubmission = serde_json::from_value(body)
            .map_err(|e| AdmissionError::Unprocessable(e.to_string()))?;
        if let Some(problem) = submission.shape_problem() {
            return Err(AdmissionError::Unprocessable(problem));
        }

        Ok(Job::admit(submission))
    }

    /// Admits `body` and dispatches it in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, body: Value) -> Result<CorrelationId, AdmissionError> {
        let job = match self.admit(body) {
            Ok(job) => job,
            Err(e) => {
                self.metrics.record_submission(e.outcome());
                info!(error = %e, "Submission refused");
                return Err(e);
            }
        };

        let correlation_id = job.correlation_id.clone();
        info!(
            correlation_id = %correlation_id,
            locations = job.submission.locations.len(),
            vehicles = job.submission.vehicle_count,
            "Job admitted"
        );
        self.metrics.record_submission("accepted");

        let admission = self.clone();
        let guard = InFlight::enter(&self.in_flight);
        tokio::spawn(async move {
            let _guard = guard;
            let correlation_id = job.correlation_id.clone();
            if let Err(e) = admission.dispatch(job).await {
                error!(
                    correlation_id = %correlation_id,
                    error = %e,
                    "Job could not be enqueued"
                );
            }
        });

        Ok(correlation_id)
    }

    /// Computes the distance matrix and publishes the inbound envelope,
    /// retrying the publish per the configured policy.
    ///
    /// A failure here loses the job, so it is counted as a dispatch failure.
    pub async fn dispatch(&self, job: Job) -> Result<(), BrokerError> {
        let result = self.enqueue(job).await;
        if result.is_err() {
            self.metrics.record_dispatch_failure();
        }
        result
    }

    async fn enqueue(&self, job: Job) -> Result<(), BrokerError> {
        let job = job.with_distance_matrix();
        let request = match RouteRequest::from_job(&job) {
            Some(request) => request,
            None => {
                return Err(BrokerError::PublishFailed {
                    exchange: self.inbound.exchange.clone(),
                    routing_key: self.inbound.routing_key.clone(),
                    reason: "distance matrix missing".to_string(),
                })
            }
        };

        let publisher = &self.publisher;
        let inbound = &self.inbound;
        let pending = &request;
        self.retry
            .run("publish route request", move || {
                publisher.publish(inbound, pending)
            })
            .await?;

        info!(
            correlation_id = %request.correlation_id,
            queue = %self.inbound.queue,
            "Job enqueued"
        );
        Ok(())
    }
}
