//! In-process broker with AMQP-like delivery semantics.
//!
//! Supports durable topic exchanges (routing-key patterns with `*` and `#`),
//! per-queue ready lists, prefetch-bounded unacknowledged windows per
//! subscription, requeue on negative acknowledgement or subscription end,
//! and a per-queue dead-letter list for discarded messages.
//!
//! Nothing here survives the process; "durable" only means declarations and
//! unacknowledged messages survive subscriptions coming and going.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::Notify;

use super::topology::topic_matches;
use super::{Acknowledger, Broker, Delivery, QueueBinding, Subscription};
use crate::error::BrokerError;

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct Unacked {
    subscriber: u64,
    message: StoredMessage,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, Unacked>,
    in_flight: HashMap<u64, usize>,
    dead_letters: Vec<Vec<u8>>,
    notify: Arc<Notify>,
}

impl QueueState {
    fn release_slot(&mut self, subscriber: u64) {
        if let Some(count) = self.in_flight.get_mut(&subscriber) {
            *count = count.saturating_sub(1);
        }
    }

    /// Puts a message back at the head of the queue, flagged as redelivered.
    fn requeue_front(&mut self, mut message: StoredMessage) {
        message.redelivered = true;
        self.ready.push_front(message);
    }
}

#[derive(Debug)]
struct ExchangeBinding {
    queue: String,
    pattern: String,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, Vec<ExchangeBinding>>,
    queues: HashMap<String, QueueState>,
    next_tag: u64,
    closed: bool,
}

/// In-memory broker. Cloning shares the same exchanges and queues.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    next_subscriber: Arc<AtomicU64>,
}

/// Every mutation leaves `BrokerState` consistent before the guard drops,
/// so a lock that does not poison is safe here.
fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock()
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages waiting in `queue`.
    pub fn ready_len(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Number of delivered but unacknowledged messages on `queue`.
    pub fn unacked_len(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or(0)
    }

    /// Bodies of messages discarded from `queue`.
    pub fn dead_letters(&self, queue: &str) -> Vec<Vec<u8>> {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.dead_letters.clone())
            .unwrap_or_default()
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        lock(&self.state).exchanges.contains_key(exchange)
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        lock(&self.state).queues.contains_key(queue)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare(&self, binding: &QueueBinding) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(BrokerError::Closed);
        }

        state.queues.entry(binding.queue.clone()).or_default();

        let bindings = state.exchanges.entry(binding.exchange.clone()).or_default();
        let already_bound = bindings
            .iter()
            .any(|b| b.queue == binding.queue && b.pattern == binding.routing_key);
        if !already_bound {
            bindings.push(ExchangeBinding {
                queue: binding.queue.clone(),
                pattern: binding.routing_key.clone(),
            });
        }
        Ok(())
    }

    async fn send(&self, binding: &QueueBinding, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(BrokerError::Closed);
        }

        let Some(bindings) = state.exchanges.get(&binding.exchange) else {
            return Err(BrokerError::UnknownExchange(binding.exchange.clone()));
        };

        let mut targets: Vec<String> = bindings
            .iter()
            .filter(|b| topic_matches(&b.pattern, &binding.routing_key))
            .map(|b| b.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        if targets.is_empty() {
            tracing::debug!(
                exchange = %binding.exchange,
                routing_key = %binding.routing_key,
                "Message matched no queue and was dropped"
            );
        }

        for name in targets {
            if let Some(queue) = state.queues.get_mut(&name) {
                queue.ready.push_back(StoredMessage {
                    body: payload.clone(),
                    redelivered: false,
                });
                queue.notify.notify_waiters();
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        binding: &QueueBinding,
        prefetch: u16,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        let state = lock(&self.state);
        if state.closed {
            return Err(BrokerError::Closed);
        }
        if !state.queues.contains_key(&binding.queue) {
            return Err(BrokerError::UnknownQueue(binding.queue.clone()));
        }

        let subscriber = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySubscription {
            state: Arc::clone(&self.state),
            queue: binding.queue.clone(),
            subscriber,
            prefetch,
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        state.closed = true;
        for queue in state.queues.values() {
            queue.notify.notify_waiters();
        }
        Ok(())
    }
}

enum Take {
    Delivered(Delivery),
    Closed,
    Empty(Arc<Notify>),
}

struct MemorySubscription {
    state: Arc<Mutex<BrokerState>>,
    queue: String,
    subscriber: u64,
    /// Zero means unlimited, as in AMQP.
    prefetch: u16,
}

impl MemorySubscription {
    fn try_take(&self) -> Result<Take, BrokerError> {
        let mut guard = lock(&self.state);
        let BrokerState {
            queues,
            next_tag,
            closed,
            ..
        } = &mut *guard;

        if *closed {
            return Ok(Take::Closed);
        }
        let queue = queues
            .get_mut(&self.queue)
            .ok_or_else(|| BrokerError::UnknownQueue(self.queue.clone()))?;

        let in_flight = queue.in_flight.get(&self.subscriber).copied().unwrap_or(0);
        let window_open = self.prefetch == 0 || in_flight < self.prefetch as usize;
        if !window_open {
            return Ok(Take::Empty(Arc::clone(&queue.notify)));
        }

        let Some(message) = queue.ready.pop_front() else {
            return Ok(Take::Empty(Arc::clone(&queue.notify)));
        };

        *next_tag += 1;
        let tag = *next_tag;
        *queue.in_flight.entry(self.subscriber).or_insert(0) += 1;
        queue.unacked.insert(
            tag,
            Unacked {
                subscriber: self.subscriber,
                message: message.clone(),
            },
        );

        let acker = MemoryAcker {
            state: Arc::clone(&self.state),
            queue: self.queue.clone(),
            tag,
        };
        Ok(Take::Delivered(Delivery::new(
            tag,
            message.redelivered,
            message.body,
            Box::new(acker),
        )))
    }

    /// Requeues everything this subscription still holds.
    fn release(&self) {
        let mut state = lock(&self.state);
        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return;
        };

        let mut tags: Vec<u64> = queue
            .unacked
            .iter()
            .filter(|(_, u)| u.subscriber == self.subscriber)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        for tag in tags.into_iter().rev() {
            if let Some(unacked) = queue.unacked.remove(&tag) {
                queue.requeue_front(unacked.message);
            }
        }
        queue.in_flight.remove(&self.subscriber);
        queue.notify.notify_waiters();
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, BrokerError> {
        loop {
            let notify = match self.try_take()? {
                Take::Delivered(delivery) => return Ok(Some(delivery)),
                Take::Closed => return Ok(None),
                Take::Empty(notify) => notify,
            };

            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Re-check after registering so a publish in between is not missed.
            match self.try_take()? {
                Take::Delivered(delivery) => return Ok(Some(delivery)),
                Take::Closed => return Ok(None),
                Take::Empty(_) => {}
            }

            notified.await;
        }
    }

    async fn cancel(self: Box<Self>) -> Result<(), BrokerError> {
        // Drop performs the requeue.
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.release();
    }
}

struct MemoryAcker {
    state: Arc<Mutex<BrokerState>>,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, outcome: Settle) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BrokerError::UnknownQueue(self.queue.clone()))?;

        let unacked = queue
            .unacked
            .remove(&self.tag)
            .ok_or_else(|| BrokerError::AckFailed {
                delivery_tag: self.tag,
                reason: "unknown delivery tag".to_string(),
            })?;
        queue.release_slot(unacked.subscriber);

        match outcome {
            Settle::Ack => {}
            Settle::Requeue => queue.requeue_front(unacked.message),
            Settle::Discard => queue.dead_letters.push(unacked.message.body),
        }
        queue.notify.notify_waiters();
        Ok(())
    }
}

enum Settle {
    Ack,
    Requeue,
    Discard,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle(Settle::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        if requeue {
            self.settle(Settle::Requeue)
        } else {
            self.settle(Settle::Discard)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn binding() -> QueueBinding {
        QueueBinding::new("planning.inbound", "planning.inbound.jobs", "route.request")
    }

    async fn declared_broker() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.declare(&binding()).await.expect("declare");
        broker
    }

    #[tokio::test]
    async fn test_broker_survives_panicking_lock_holder() {
        let broker = declared_broker().await;
        let state = Arc::clone(&broker.state);
        let crashed = std::thread::spawn(move || {
            let _held = lock(&state);
            panic!("holder died with the lock");
        })
        .join();
        assert!(crashed.is_err());

        broker.send(&binding(), b"after".to_vec()).await.expect("send");
        assert_eq!(broker.ready_len("planning.inbound.jobs"), 1);
    }

    #[tokio::test]
    async fn test_declare_is_idempotent() {
        let broker = declared_broker().await;
        broker.declare(&binding()).await.expect("declare again");

        assert!(broker.has_exchange("planning.inbound"));
        assert!(broker.has_queue("planning.inbound.jobs"));

        broker.send(&binding(), b"one".to_vec()).await.expect("send");
        // A duplicated binding would have routed the message twice.
        assert_eq!(broker.ready_len("planning.inbound.jobs"), 1);
    }

    #[tokio::test]
    async fn test_send_to_unknown_exchange_fails() {
        let broker = MemoryBroker::new();
        let err = broker.send(&binding(), b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, BrokerError::UnknownExchange(_)));
    }

    #[tokio::test]
    async fn test_topic_routing_to_matching_queues_only() {
        let broker = MemoryBroker::new();
        let wildcard = QueueBinding::new("planning", "audit", "route.#");
        let requests = QueueBinding::new("planning", "requests", "route.request");
        broker.declare(&wildcard).await.expect("declare");
        broker.declare(&requests).await.expect("declare");

        let result_key = QueueBinding::new("planning", "unused", "route.result");
        broker.send(&result_key, b"r".to_vec()).await.expect("send");
        broker.send(&requests, b"q".to_vec()).await.expect("send");

        assert_eq!(broker.ready_len("audit"), 2);
        assert_eq!(broker.ready_len("requests"), 1);
    }

    #[tokio::test]
    async fn test_delivery_ack_removes_message() {
        let broker = declared_broker().await;
        broker.send(&binding(), b"job".to_vec()).await.expect("send");

        let mut sub = broker.subscribe(&binding(), 10).await.expect("subscribe");
        let delivery = sub.next_delivery().await.expect("next").expect("delivery");
        assert_eq!(delivery.body, b"job");
        assert!(!delivery.redelivered);
        assert_eq!(broker.unacked_len("planning.inbound.jobs"), 1);

        delivery.ack().await.expect("ack");
        assert_eq!(broker.unacked_len("planning.inbound.jobs"), 0);
        assert_eq!(broker.ready_len("planning.inbound.jobs"), 0);
    }

    #[tokio::test]
    async fn test_requeue_redelivers_with_flag() {
        let broker = declared_broker().await;
        broker.send(&binding(), b"job".to_vec()).await.expect("send");

        let mut sub = broker.subscribe(&binding(), 10).await.expect("subscribe");
        let first = sub.next_delivery().await.expect("next").expect("delivery");
        first.requeue().await.expect("requeue");

        let second = sub.next_delivery().await.expect("next").expect("delivery");
        assert!(second.redelivered);
        assert_eq!(second.body, b"job");
    }

    #[tokio::test]
    async fn test_discard_moves_to_dead_letters() {
        let broker = declared_broker().await;
        broker.send(&binding(), b"poison".to_vec()).await.expect("send");

        let mut sub = broker.subscribe(&binding(), 10).await.expect("subscribe");
        let delivery = sub.next_delivery().await.expect("next").expect("delivery");
        delivery.discard().await.expect("discard");

        assert_eq!(broker.ready_len("planning.inbound.jobs"), 0);
        assert_eq!(
            broker.dead_letters("planning.inbound.jobs"),
            vec![b"poison".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_prefetch_bounds_unacked_window() {
        let broker = declared_broker().await;
        for i in 0..3u8 {
            broker.send(&binding(), vec![i]).await.expect("send");
        }

        let mut sub = broker.subscribe(&binding(), 2).await.expect("subscribe");
        let first = sub.next_delivery().await.expect("next").expect("delivery");
        let _second = sub.next_delivery().await.expect("next").expect("delivery");

        let blocked = tokio::time::timeout(Duration::from_millis(50), sub.next_delivery()).await;
        assert!(blocked.is_err(), "third delivery must wait for an ack");

        first.ack().await.expect("ack");
        let third = tokio::time::timeout(Duration::from_millis(500), sub.next_delivery())
            .await
            .expect("window reopened")
            .expect("next")
            .expect("delivery");
        assert_eq!(third.body, vec![2]);
    }

    #[tokio::test]
    async fn test_cancel_requeues_unacked_in_order() {
        let broker = declared_broker().await;
        for i in 0..2u8 {
            broker.send(&binding(), vec![i]).await.expect("send");
        }

        let mut sub = broker.subscribe(&binding(), 10).await.expect("subscribe");
        let _a = sub.next_delivery().await.expect("next").expect("delivery");
        let _b = sub.next_delivery().await.expect("next").expect("delivery");
        sub.cancel().await.expect("cancel");

        assert_eq!(broker.unacked_len("planning.inbound.jobs"), 0);
        assert_eq!(broker.ready_len("planning.inbound.jobs"), 2);

        let mut other = broker.subscribe(&binding(), 10).await.expect("subscribe");
        let first = other.next_delivery().await.expect("next").expect("delivery");
        assert_eq!(first.body, vec![0]);
        assert!(first.redelivered);
    }

    #[tokio::test]
    async fn test_waiting_subscriber_wakes_on_publish() {
        let broker = declared_broker().await;
        let mut sub = broker.subscribe(&binding(), 1).await.expect("subscribe");

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.send(&binding(), b"late".to_vec()).await.expect("send");
        });

        let delivery = tokio::time::timeout(Duration::from_secs(2), sub.next_delivery())
            .await
            .expect("woken")
            .expect("next")
            .expect("delivery");
        assert_eq!(delivery.body, b"late");
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let broker = declared_broker().await;
        let mut sub = broker.subscribe(&binding(), 1).await.expect("subscribe");
        broker.close().await.expect("close");

        assert!(sub.next_delivery().await.expect("next").is_none());
        assert!(matches!(
            broker.send(&binding(), b"x".to_vec()).await,
            Err(BrokerError::Closed)
        ));
    }
}
