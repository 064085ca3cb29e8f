//! In-process store adapter.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};

use super::CacheStore;
use crate::error::StoreError;

/// TTL-aware in-memory store backed by a sharded map.
///
/// The default adapter for tests and single-process deployments. `add` and
/// `incr` run under the shard lock, which gives them the atomicity the
/// regeneration protocol relies on. Expiry is lazy: expired keys are
/// dropped when touched, or in bulk via [`MemoryStore::purge_expired`].
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
}

struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(bytes: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            bytes,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys, expired ones included until they are purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired key.
    pub fn purge_expired(&self) {
        self.entries.retain(|_, value| !value.is_expired());
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(value) = self.entries.get(key) else {
            return Ok(None);
        };
        if value.is_expired() {
            // The read guard must go before remove_if touches the shard.
            drop(value);
            self.entries.remove_if(key, |_, value| value.is_expired());
            return Ok(None);
        }
        Ok(Some(value.bytes.clone()))
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.entries
            .insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(())
    }

    async fn add(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(StoredValue::new(value, ttl));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, delta: u64) -> Result<Option<u64>, StoreError> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.remove();
                    return Ok(None);
                }
                let current = parse_counter(&occupied.get().bytes)?;
                let next = current.saturating_add(delta);
                occupied.get_mut().bytes = next.to_string().into_bytes();
                Ok(Some(next))
            }
            Entry::Vacant(_) => Ok(None),
        }
    }
}

fn parse_counter(bytes: &[u8]) -> Result<u64, StoreError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|text| text.trim().parse::<u64>().ok())
        .ok_or_else(|| StoreError::codec("counter value is not an unsigned integer"))
}

// ============================================================================
// Tests
// ============================================================================
