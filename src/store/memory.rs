//! In-process result store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{serialize_route, ResultStore};
use crate::error::StoreError;
use crate::job::{CorrelationId, Route};

/// `HashMap`-backed store. Cloning shares the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryResultStore {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn write(&self, id: &CorrelationId, route: &Route) -> Result<(), StoreError> {
        let value = serialize_route(route)?;
        self.entries.write().insert(id.as_str().to_string(), value);
        Ok(())
    }

    async fn read(&self, id: &CorrelationId) -> Result<Option<String>, StoreError> {
        Ok(self.entries.read().get(id.as_str()).cloned())
    }

    async fn delete(&self, id: &CorrelationId) -> Result<bool, StoreError> {
        Ok(self.entries.write().remove(id.as_str()).is_some())
    }
}
