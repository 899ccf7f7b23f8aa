//! Error types shared across the dispatch pipeline.
//!
//! Defines the error enums for the subsystems that more than one component
//! touches:
//! - Message broker transport (topology, publish, consume, acknowledgement)
//! - Envelope encoding and validation
//! - Result store access

use thiserror::Error;

/// Errors that can occur while talking to the message broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Failed to declare topology for exchange '{exchange}' / queue '{queue}': {reason}")]
    TopologyFailed {
        exchange: String,
        queue: String,
        reason: String,
    },

    #[error("Exchange '{0}' has not been declared")]
    UnknownExchange(String),

    #[error("Queue '{0}' has not been declared")]
    UnknownQueue(String),

    #[error("Publish to exchange '{exchange}' with routing key '{routing_key}' failed: {reason}")]
    PublishFailed {
        exchange: String,
        routing_key: String,
        reason: String,
    },

    #[error("Broker refused message for routing key '{0}'")]
    PublishNacked(String),

    #[error("Subscription to queue '{queue}' failed: {reason}")]
    SubscribeFailed { queue: String, reason: String },

    #[error("Acknowledgement of delivery {delivery_tag} failed: {reason}")]
    AckFailed { delivery_tag: u64, reason: String },

    #[error("Broker channel is closed")]
    Closed,

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
}

/// Errors that can occur while encoding or decoding a message envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Expected envelope kind '{expected}', found '{found}'")]
    WrongKind { expected: String, found: String },

    #[error("Unsupported envelope version {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid envelope field '{field}': {reason}")]
    InvalidField { field: String, reason: String },
}

/// Errors that can occur during result store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Result store connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Failed to serialize result: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Result store unavailable: {0}")]
    Unavailable(String),
}
