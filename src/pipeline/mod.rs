//! The two consumer/handler pairs that move a job from the inbound queue to
//! the result store.
//!
//! ```text
//!   [inbound queue] ─▶ InboundHandler ─▶ solver ─▶ publish ─▶ [outbound queue]
//!                        ack after publish
//!
//!   [outbound queue] ─▶ OutboundHandler ─▶ ResultStore::write
//!                         ack after write
//! ```
//!
//! Neither handler tracks job state. A job's stage is whichever queue holds
//! its envelope, and clients only learn completion by polling the store.
//!
//! Settlement rules shared by both handlers:
//! - undecodable or invalid envelope: discard (never requeue poison)
//! - downstream effect failed after retries: requeue for redelivery
//! - downstream effect durable: ack

pub mod inbound;
pub mod outbound;
pub mod worker_pool;

pub use inbound::InboundHandler;
pub use outbound::OutboundHandler;
pub use worker_pool::{ConsumerPool, ConsumerPoolConfig, PoolError, PoolStats};

use crate::broker::{Delivery, HandlerOutcome};

/// Acks `delivery`, reporting `Unacked` if the ack itself fails.
pub(crate) async fn ack(delivery: Delivery, correlation_id: &str) -> HandlerOutcome {
    let tag = delivery.delivery_tag;
    match delivery.ack().await {
        Ok(()) => HandlerOutcome::Acked,
        Err(e) => {
            tracing::warn!(correlation_id, delivery_tag = tag, error = %e, "Ack failed");
            HandlerOutcome::Unacked
        }
    }
}

/// Returns `delivery` to its queue.
pub(crate) async fn requeue(delivery: Delivery, correlation_id: &str) -> HandlerOutcome {
    let tag = delivery.delivery_tag;
    match delivery.requeue().await {
        Ok(()) => HandlerOutcome::Requeued,
        Err(e) => {
            tracing::warn!(correlation_id, delivery_tag = tag, error = %e, "Requeue failed");
            HandlerOutcome::Unacked
        }
    }
}

/// Rejects `delivery` without requeue.
pub(crate) async fn discard(delivery: Delivery, correlation_id: &str) -> HandlerOutcome {
    let tag = delivery.delivery_tag;
    match delivery.discard().await {
        Ok(()) => HandlerOutcome::Discarded,
        Err(e) => {
            tracing::warn!(correlation_id, delivery_tag = tag, error = %e, "Discard failed");
            HandlerOutcome::Unacked
        }
    }
}
