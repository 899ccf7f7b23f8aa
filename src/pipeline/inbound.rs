//! Solver-side handler: route request in, route result out.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::broker::{Delivery, HandlerOutcome, MessageHandler, Publisher, QueueBinding};
use crate::envelope::{self, RouteRequest, RouteResult};
use crate::metrics::MetricsCollector;
use crate::retry::RetryPolicy;
use crate::solver::{RouteSolver, SolveError};

/// Solves inbound jobs and forwards the result to the outbound queue.
///
/// The inbound delivery is acked only once the result has been published.
/// Solving is deterministic, so a redelivered job yields the same result.
pub struct InboundHandler {
    solver: Arc<dyn RouteSolver>,
    publisher: Arc<Publisher>,
    outbound: QueueBinding,
    retry: RetryPolicy,
    metrics: MetricsCollector,
}

impl InboundHandler {
    pub fn new(
        solver: Arc<dyn RouteSolver>,
        publisher: Arc<Publisher>,
        outbound: QueueBinding,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            solver,
            publisher,
            outbound,
            retry,
            metrics: MetricsCollector::new(),
        }
    }

    async fn solve(&self, request: RouteRequest) -> Result<RouteResult, SolveFailure> {
        let solver = Arc::clone(&self.solver);
        let RouteRequest {
            correlation_id,
            distance_matrix,
            vehicle_count,
            depot,
        } = request;

        let started = Instant::now();
        let solved = tokio::task::spawn_blocking(move || {
            solver.solve(&distance_matrix, vehicle_count, depot)
        })
        .await;
        self.metrics.record_solve(started.elapsed().as_secs_f64());

        match solved {
            Ok(Ok(route)) => Ok(RouteResult::new(correlation_id, route)),
            Ok(Err(e)) => Err(SolveFailure::Infeasible(e)),
            Err(e) if e.is_cancelled() => Err(SolveFailure::Interrupted),
            Err(_) => Err(SolveFailure::Panicked),
        }
    }
}

enum SolveFailure {
    Infeasible(SolveError),
    /// The blocking task was cancelled, e.g. by runtime shutdown.
    Interrupted,
    Panicked,
}

#[async_trait]
impl MessageHandler for InboundHandler {
    async fn handle(&self, delivery: Delivery) -> HandlerOutcome {
        let request: RouteRequest = match envelope::decode(&delivery.body) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "Discarding invalid route request"
                );
                return super::discard(delivery, "").await;
            }
        };

        let correlation_id = request.correlation_id.to_string();
        tracing::info!(
            correlation_id = %correlation_id,
            locations = request.distance_matrix.dimension(),
            vehicles = request.vehicle_count,
            redelivered = delivery.redelivered,
            "Solving route request"
        );

        let result = match self.solve(request).await {
            Ok(result) => result,
            Err(SolveFailure::Infeasible(e)) => {
                tracing::error!(
                    correlation_id = %correlation_id,
                    error = %e,
                    "No feasible route, discarding job"
                );
                return super::discard(delivery, &correlation_id).await;
            }
            Err(SolveFailure::Interrupted) => {
                tracing::warn!(correlation_id = %correlation_id, "Solve interrupted, requeueing");
                return super::requeue(delivery, &correlation_id).await;
            }
            Err(SolveFailure::Panicked) => {
                tracing::error!(correlation_id = %correlation_id, "Solver panicked, discarding job");
                return super::discard(delivery, &correlation_id).await;
            }
        };

        let publisher = &self.publisher;
        let outbound = &self.outbound;
        let pending = &result;
        let published = self
            .retry
            .run("publish route result", move || publisher.publish(outbound, pending))
            .await;

        match published {
            Ok(()) => {
                tracing::info!(
                    correlation_id = %correlation_id,
                    stops = result.result.len(),
                    "Route result published"
                );
                super::ack(delivery, &correlation_id).await
            }
            Err(e) => {
                tracing::error!(
                    correlation_id = %correlation_id,
                    error = %e,
                    "Could not publish route result, requeueing job"
                );
                super::requeue(delivery, &correlation_id).await
            }
        }
    }
}
