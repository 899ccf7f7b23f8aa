//! Cache-side handler: route result in, result store entry out.

use std::sync::Arc;

use async_trait::async_trait;

use crate::broker::{Delivery, HandlerOutcome, MessageHandler};
use crate::envelope::{self, RouteResult};
use crate::metrics::MetricsCollector;
use crate::retry::RetryPolicy;
use crate::store::ResultStore;

/// Persists route results. The only writer of the result store.
///
/// Acks only after the write succeeded; a redelivered result overwrites
/// the same key with the same value.
pub struct OutboundHandler {
    store: Arc<dyn ResultStore>,
    retry: RetryPolicy,
    metrics: MetricsCollector,
}

impl OutboundHandler {
    pub fn new(store: Arc<dyn ResultStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            metrics: MetricsCollector::new(),
        }
    }
}

#[async_trait]
impl MessageHandler for OutboundHandler {
    async fn handle(&self, delivery: Delivery) -> HandlerOutcome {
        let result: RouteResult = match envelope::decode(&delivery.body) {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "Discarding invalid route result"
                );
                return super::discard(delivery, "").await;
            }
        };
        let correlation_id = result.correlation_id.to_string();

        let store = &self.store;
        let metrics = self.metrics;
        let pending = &result;
        let written = self
            .retry
            .run("write route result", move || async move {
                let outcome = store.write(&pending.correlation_id, &pending.result).await;
                metrics.record_store_op("write", outcome.is_ok());
                outcome
            })
            .await;

        match written {
            Ok(()) => {
                tracing::info!(
                    correlation_id = %correlation_id,
                    redelivered = delivery.redelivered,
                    "Route result cached"
                );
                super::ack(delivery, &correlation_id).await
            }
            Err(e) => {
                tracing::error!(
                    correlation_id = %correlation_id,
                    error = %e,
                    "Could not cache route result, requeueing"
                );
                super::requeue(delivery, &correlation_id).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker, QueueBinding, Subscription};
    use crate::error::StoreError;
    use crate::job::{CorrelationId, Route};
    use crate::store::MemoryResultStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn outbound() -> QueueBinding {
        QueueBinding::new("planning.outbound", "planning.outbound", "route.result")
    }

    /// Fails the first `failures` writes, then delegates.
    struct FlakyStore {
        inner: MemoryResultStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl ResultStore for FlakyStore {
        async fn write(&self, id: &CorrelationId, route: &Route) -> Result<(), StoreError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("injected".to_string()));
            }
            self.inner.write(id, route).await
        }

        async fn read(&self, id: &CorrelationId) -> Result<Option<String>, StoreError> {
            self.inner.read(id).await
        }

        async fn delete(&self, id: &CorrelationId) -> Result<bool, StoreError> {
            self.inner.delete(id).await
        }
    }

    async fn deliver(broker: &MemoryBroker, body: Vec<u8>) -> (Box<dyn Subscription>, Delivery) {
        broker.declare(&outbound()).await.expect("declare");
        broker.send(&outbound(), body).await.expect("send");
        let mut sub = broker.subscribe(&outbound(), 1).await.expect("subscribe");
        let delivery = sub.next_delivery().await.expect("next").expect("delivery");
        (sub, delivery)
    }

    fn quick_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts).with_initial_backoff(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_writes_then_acks() {
        let broker = MemoryBroker::new();
        let store = MemoryResultStore::new();
        let result = RouteResult::new(CorrelationId::generate(), Route::new(vec![0, 1, 0]));
        let (_sub, delivery) = deliver(&broker, envelope::encode(&result).expect("encode")).await;

        let handler = OutboundHandler::new(Arc::new(store.clone()), quick_retry(1));
        assert_eq!(handler.handle(delivery).await, HandlerOutcome::Acked);

        assert_eq!(
            store.read(&result.correlation_id).await.expect("read").as_deref(),
            Some("[0,1,0]")
        );
        assert_eq!(broker.unacked_len("planning.outbound"), 0);
    }

    #[tokio::test]
    async fn test_transient_write_failure_is_retried() {
        let broker = MemoryBroker::new();
        let store = Arc::new(FlakyStore {
            inner: MemoryResultStore::new(),
            failures: AtomicU32::new(2),
        });
        let result = RouteResult::new(CorrelationId::generate(), Route::new(vec![2, 0, 1, 2]));
        let (_sub, delivery) = deliver(&broker, envelope::encode(&result).expect("encode")).await;

        let handler = OutboundHandler::new(store.clone(), quick_retry(3));
        assert_eq!(handler.handle(delivery).await, HandlerOutcome::Acked);
        assert!(store.read(&result.correlation_id).await.expect("read").is_some());
    }

    #[tokio::test]
    async fn test_exhausted_write_requeues() {
        let broker = MemoryBroker::new();
        let store = Arc::new(FlakyStore {
            inner: MemoryResultStore::new(),
            failures: AtomicU32::new(10),
        });
        let result = RouteResult::new(CorrelationId::generate(), Route::new(vec![0, 0]));
        let (_sub, delivery) = deliver(&broker, envelope::encode(&result).expect("encode")).await;

        let handler = OutboundHandler::new(store.clone(), quick_retry(2));
        assert_eq!(handler.handle(delivery).await, HandlerOutcome::Requeued);
        assert_eq!(broker.ready_len("planning.outbound"), 1);
        assert!(store.read(&result.correlation_id).await.expect("read").is_none());
    }

    #[tokio::test]
    async fn test_wrong_kind_is_discarded() {
        let broker = MemoryBroker::new();
        let body = br#"{"kind":"route_request","version":1}"#.to_vec();
        let (_sub, delivery) = deliver(&broker, body).await;

        let handler = OutboundHandler::new(Arc::new(MemoryResultStore::new()), quick_retry(1));
        assert_eq!(handler.handle(delivery).await, HandlerOutcome::Discarded);
        assert_eq!(broker.dead_letters("planning.outbound").len(), 1);
    }
}
