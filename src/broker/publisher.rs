//! Envelope publisher.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Broker, QueueBinding};
use crate::envelope::{self, EnvelopeBody};
use crate::error::BrokerError;
use crate::metrics::MetricsCollector;

/// Publishes envelopes to durable topic exchanges.
///
/// Each binding's topology is declared on first use and remembered, so
/// repeated publishes skip the declare round trip. Retries are the caller's
/// concern; see [`crate::retry::RetryPolicy`].
pub struct Publisher {
    broker: Arc<dyn Broker>,
    declared: Mutex<HashSet<QueueBinding>>,
    metrics: MetricsCollector,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            declared: Mutex::new(HashSet::new()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Declares the binding's exchange, queue and binding unless this
    /// publisher already did.
    pub async fn ensure_declared(&self, binding: &QueueBinding) -> Result<(), BrokerError> {
        if let Some(component) = binding.empty_component() {
            return Err(BrokerError::TopologyFailed {
                exchange: binding.exchange.clone(),
                queue: binding.queue.clone(),
                reason: format!("{} name is empty", component),
            });
        }

        let known = self.declared.lock().contains(binding);
        if known {
            return Ok(());
        }

        self.broker.declare(binding).await?;
        self.declared.lock().insert(binding.clone());

        tracing::debug!(binding = %binding, "Declared broker topology");
        Ok(())
    }

    /// Encodes `body` and publishes it as a persistent message.
    pub async fn publish<T: EnvelopeBody>(
        &self,
        binding: &QueueBinding,
        body: &T,
    ) -> Result<(), BrokerError> {
        let payload = envelope::encode(body)?;
        self.publish_raw(binding, payload, body.correlation_id().as_str())
            .await
    }

    async fn publish_raw(
        &self,
        binding: &QueueBinding,
        payload: Vec<u8>,
        correlation_id: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_declared(binding).await?;

        let size = payload.len();
        let result = self.broker.send(binding, payload).await;
        self.metrics
            .record_publish(&binding.exchange, result.is_ok());

        match &result {
            Ok(()) => tracing::info!(
                correlation_id,
                exchange = %binding.exchange,
                routing_key = %binding.routing_key,
                bytes = size,
                "Published envelope"
            ),
            Err(e) => tracing::warn!(
                correlation_id,
                exchange = %binding.exchange,
                routing_key = %binding.routing_key,
                error = %e,
                "Publish failed"
            ),
        }
        result
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher").finish_non_exhaustive()
    }
}
