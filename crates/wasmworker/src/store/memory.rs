//! In-memory storage backend.

use std::sync::Arc;

use dashmap::DashMap;

use crate::store::DataStore;
use crate::store::Result;

/// A map held in process memory.
///
/// Clones share the same map, so a test can keep a handle and inspect what a
/// module wrote.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Synchronous lookup, for inspection outside of a module call.
    pub fn peek(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }
}

#[async_trait::async_trait]
impl DataStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.peek(key))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }
}
