//! Key-value store contract and bundled adapters.
//!
//! The engine coordinates everything through five primitive operations on
//! independent keys. `add` and `incr` must be atomic at the backend; no
//! transactions or watches are required, which keeps the contract
//! implementable over memcached-style services.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

mod memory;

pub use memory::MemoryStore;

/// Contract over an external key-value cache service.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch a value. Absent and expired keys both return `None`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store a value, replacing any existing one.
    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Store a value only if the key is absent. Returns whether this call
    /// created it. Atomicity here is what makes the regeneration lock a
    /// single-winner race.
    async fn add(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Remove a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically increment an ASCII-decimal counter.
    ///
    /// Returns the new value, or `None` when the key does not exist. A
    /// counter must be created with [`CacheStore::add`] first.
    async fn incr(&self, key: &str, delta: u64) -> Result<Option<u64>, StoreError>;
}
