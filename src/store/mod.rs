//! Result store: keyed persistence of solved routes.
//!
//! Keys are correlation ids (optionally prefixed), values are the canonical
//! JSON text of the route. Writes overwrite, which is what makes redelivered
//! results idempotent.

pub mod memory;
pub mod redis;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::job::{CorrelationId, Route};

pub use self::memory::MemoryResultStore;
pub use self::redis::RedisResultStore;

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Stores `route` under `id`, replacing any previous value.
    async fn write(&self, id: &CorrelationId, route: &Route) -> Result<(), StoreError>;

    /// Returns the stored serialized route, or `None` when absent.
    async fn read(&self, id: &CorrelationId) -> Result<Option<String>, StoreError>;

    /// Removes the entry. Returns whether one existed.
    async fn delete(&self, id: &CorrelationId) -> Result<bool, StoreError>;
}

/// Canonical serialized form of a route as stored.
pub fn serialize_route(route: &Route) -> Result<String, StoreError> {
    Ok(serde_json::to_string(route)?)
}
