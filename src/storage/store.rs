//! In-Memory Key-Value Store
//!
//! Shared hashmap of byte keys to byte values.

use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::sync::Arc;

use super::KvStore;
use crate::error::StoreError;

/// In-memory key-value store. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<HashMap<Bytes, Bytes>>>,
}

impl MemoryStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: Bytes, value: Bytes) {
        self.inner.write().insert(key, value);
    }

    pub fn lookup(&self, key: &[u8]) -> Option<Bytes> {
        self.inner.read().get(key).cloned()
    }

    /// Get the number of keys
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Check if store is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        Ok(self.lookup(key))
    }

    /// Nothing to make durable; the flag is ignored
    fn put(&self, key: Bytes, value: Bytes, _durable: bool) -> Result<(), StoreError> {
        self.insert(key, value);
        Ok(())
    }
}
