//! Message broker abstraction over durable topic exchanges and queues.
//!
//! This module provides the transport both pipelines bind to:
//!
//! - **Broker**: declare topology, send bytes, open subscriptions
//! - **Publisher**: serializes envelopes and publishes them to a binding
//! - **QueueConsumer**: blocking receive loop with prefetch and
//!   handler-controlled acknowledgement
//!
//! # Architecture
//!
//! ```text
//!   Publisher ──send──▶ [exchange] ──routing key──▶ [durable queue]
//!                                                        │
//!                                       prefetch window  ▼
//!                                              QueueConsumer ──▶ MessageHandler
//!                                                                   │
//!                                                      ack / requeue / discard
//! ```
//!
//! # Backends
//!
//! - `AmqpBroker`: AMQP 0-9-1 (RabbitMQ) through `lapin`
//! - `MemoryBroker`: in-process broker with the same delivery semantics,
//!   used by tests and the standalone mode

pub mod amqp;
pub mod consumer;
pub mod memory;
pub mod publisher;
pub mod topology;

use std::fmt;

use async_trait::async_trait;

use crate::error::BrokerError;

pub use amqp::AmqpBroker;
pub use consumer::{ConsumeSummary, HandlerOutcome, MessageHandler, QueueConsumer};
pub use memory::MemoryBroker;
pub use publisher::Publisher;
pub use topology::{topic_matches, QueueBinding};

/// Transport operations every broker backend provides.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declares the durable topic exchange, the durable queue and the binding
    /// between them. Safe to repeat.
    async fn declare(&self, binding: &QueueBinding) -> Result<(), BrokerError>;

    /// Sends `payload` to the binding's exchange under its routing key.
    async fn send(&self, binding: &QueueBinding, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Opens a subscription on the binding's queue holding at most
    /// `prefetch` unacknowledged deliveries.
    async fn subscribe(
        &self,
        binding: &QueueBinding,
        prefetch: u16,
    ) -> Result<Box<dyn Subscription>, BrokerError>;

    /// Closes the underlying connection, if one was opened.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A stream of deliveries from one queue.
#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next delivery. `Ok(None)` means the broker ended the
    /// subscription.
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, BrokerError>;

    /// Stops the subscription. Deliveries still unacknowledged go back to
    /// the queue.
    async fn cancel(self: Box<Self>) -> Result<(), BrokerError>;
}

/// Backend-specific acknowledgement primitives for one delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Negative acknowledgement; `requeue` decides whether the message goes
    /// back to the queue or is dropped (dead-lettered when configured).
    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// One message handed to a consumer.
///
/// The consumer never acknowledges on its own. Each ack method consumes
/// the delivery; dropping it without calling one leaves the message
/// unacknowledged until the subscription ends.
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub body: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        redelivered: bool,
        body: Vec<u8>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            redelivered,
            body,
            acker,
        }
    }

    /// Permanently removes the message from its queue.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Returns the message to its queue for redelivery.
    pub async fn requeue(self) -> Result<(), BrokerError> {
        self.acker.nack(true).await
    }

    /// Rejects the message without requeueing it.
    pub async fn discard(self) -> Result<(), BrokerError> {
        self.acker.nack(false).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}
