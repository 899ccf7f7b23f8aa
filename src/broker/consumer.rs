//! Cancellable consume loop with handler-controlled acknowledgement.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{Broker, Delivery, QueueBinding};
use crate::error::BrokerError;
use crate::metrics::MetricsCollector;

/// How a handler settled a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Durable effect done, message removed from the queue.
    Acked,
    /// Transient failure, message returned for redelivery.
    Requeued,
    /// Message can never succeed and was rejected without requeue.
    Discarded,
    /// Acknowledgement itself failed; the broker will redeliver once the
    /// subscription ends.
    Unacked,
}

impl HandlerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerOutcome::Acked => "acked",
            HandlerOutcome::Requeued => "requeued",
            HandlerOutcome::Discarded => "discarded",
            HandlerOutcome::Unacked => "unacked",
        }
    }
}

impl std::fmt::Display for HandlerOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-message callback driven by [`QueueConsumer`].
///
/// The handler owns the delivery and must settle it itself: ack only after
/// the durable effect, requeue on transient failure, discard poison.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery) -> HandlerOutcome;
}

/// Counts of how deliveries were settled during one consume run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeSummary {
    pub acked: u64,
    pub requeued: u64,
    pub discarded: u64,
    pub unacked: u64,
}

impl ConsumeSummary {
    fn record(&mut self, outcome: HandlerOutcome) {
        match outcome {
            HandlerOutcome::Acked => self.acked += 1,
            HandlerOutcome::Requeued => self.requeued += 1,
            HandlerOutcome::Discarded => self.discarded += 1,
            HandlerOutcome::Unacked => self.unacked += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.acked + self.requeued + self.discarded + self.unacked
    }
}

/// Receives messages from one queue and hands them to a handler.
pub struct QueueConsumer {
    broker: Arc<dyn Broker>,
    prefetch: u16,
    metrics: MetricsCollector,
}

impl QueueConsumer {
    pub fn new(broker: Arc<dyn Broker>, prefetch: u16) -> Self {
        Self {
            broker,
            prefetch,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn prefetch(&self) -> u16 {
        self.prefetch
    }

    /// Declares the binding, subscribes and handles deliveries one at a
    /// time until `shutdown` fires or the broker ends the subscription.
    ///
    /// A delivery being handled when shutdown fires is finished first.
    /// Deliveries left unacknowledged on exit go back to the queue.
    pub async fn consume(
        &self,
        binding: &QueueBinding,
        handler: Arc<dyn MessageHandler>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<ConsumeSummary, BrokerError> {
        self.broker.declare(binding).await?;
        let mut subscription = self.broker.subscribe(binding, self.prefetch).await?;

        tracing::info!(
            queue = %binding.queue,
            prefetch = self.prefetch,
            "Consumer started, waiting for messages"
        );

        let mut summary = ConsumeSummary::default();
        let stop_reason: Result<(), BrokerError> = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    tracing::info!(queue = %binding.queue, "Consumer received shutdown signal");
                    break Ok(());
                }
                next = subscription.next_delivery() => next,
            };

            match next {
                Ok(Some(delivery)) => {
                    let tag = delivery.delivery_tag;
                    tracing::debug!(
                        queue = %binding.queue,
                        delivery_tag = tag,
                        redelivered = delivery.redelivered,
                        "Received delivery"
                    );

                    self.metrics.inc_jobs_in_progress();
                    let outcome = handler.handle(delivery).await;
                    self.metrics.dec_jobs_in_progress();

                    self.metrics.record_delivery(&binding.queue, outcome.as_str());
                    summary.record(outcome);
                    tracing::debug!(
                        queue = %binding.queue,
                        delivery_tag = tag,
                        outcome = %outcome,
                        "Delivery settled"
                    );
                }
                Ok(None) => {
                    tracing::info!(queue = %binding.queue, "Subscription ended by broker");
                    break Ok(());
                }
                Err(e) => {
                    tracing::error!(queue = %binding.queue, error = %e, "Consume failed");
                    break Err(e);
                }
            }
        };

        if let Err(e) = subscription.cancel().await {
            tracing::warn!(queue = %binding.queue, error = %e, "Failed to cancel subscription");
        }

        tracing::info!(
            queue = %binding.queue,
            acked = summary.acked,
            requeued = summary.requeued,
            discarded = summary.discarded,
            "Consumer stopped"
        );

        stop_reason.map(|()| summary)
    }
}
