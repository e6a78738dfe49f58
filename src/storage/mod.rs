//! Storage
//!
//! The server only sees `KvStore`. `MemoryStore` keeps everything in a
//! hashmap; `AofStore` adds an append-only log replayed on open.

mod aof;
mod store;

pub use aof::{AofConfig, AofStore, AofSyncMode};
pub use store::MemoryStore;

use bytes::Bytes;

use crate::error::StoreError;

/// Key-value engine boundary used by GET and SET
pub trait KvStore {
    /// `Ok(None)` when the key is absent
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError>;

    /// Store `value` under `key`. `durable` requests the write reach stable
    /// storage before returning.
    fn put(&self, key: Bytes, value: Bytes, durable: bool) -> Result<(), StoreError>;

    /// Push buffered writes to stable storage
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
