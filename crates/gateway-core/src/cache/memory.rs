//! In-process [`CacheBackend`] backed by a concurrent map.
//!
//! Entries carry an absolute deadline and are reaped lazily on access, so no
//! background sweeper is needed. Hash entries store decimal integers per
//! field, matching the `HINCRBY` contract.

use super::{CacheBackend, CacheError};
use async_trait::async_trait;
use dashmap::{mapref::entry::Entry as MapEntry, DashMap};
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

enum Value {
    Text(String),
    Hash(HashMap<String, i64>),
}

struct Entry {
    value: Value,
    expires_at: Instant,
}

impl Entry {
    fn live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Concurrent in-memory cache with lazy TTL expiry.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes the entry at `key` if its deadline has passed. Returns `true`
    /// when a live entry remains. The read guard must drop before the
    /// removal; holding it across `remove` would deadlock on the shard lock.
    fn prune(&self, key: &str) -> bool {
        let live = match self.entries.get(key) {
            Some(entry) => entry.live(),
            None => return false,
        };

        if !live {
            drop(self.entries.remove(key));
            return false;
        }
        true
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        if !self.prune(key) {
            return Ok(None);
        }

        match self.entries.get(key).as_deref() {
            Some(Entry { value: Value::Text(text), .. }) => Ok(Some(text.clone())),
            Some(Entry { value: Value::Hash(_), .. }) => Err(CacheError::Malformed {
                key: key.to_string(),
                reason: "GET against hash value".to_string(),
            }),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.entries.insert(
            key.to_string(),
            Entry { value: Value::Text(value.to_string()), expires_at: Instant::now() + ttl },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.prune(key);

        // The vacant-entry insert is atomic under DashMap's shard lock, which
        // is what gives SET NX its at-most-one-winner guarantee.
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(_) => Ok(false),
            MapEntry::Vacant(slot) => {
                slot.insert(Entry {
                    value: Value::Text(value.to_string()),
                    expires_at: Instant::now() + ttl,
                });
                Ok(true)
            }
        }
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64, CacheError> {
        self.prune(key);

        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            // HINCRBY on a fresh key creates a persistent-until-expired hash;
            // callers refresh the TTL explicitly via EXPIRE.
            expires_at: Instant::now() + Duration::from_secs(u64::from(u32::MAX)),
        });

        match &mut entry.value {
            Value::Hash(fields) => {
                let slot = fields.entry(field.to_string()).or_insert(0);
                *slot += delta;
                Ok(*slot)
            }
            Value::Text(_) => Err(CacheError::Malformed {
                key: key.to_string(),
                reason: "HINCRBY against string value".to_string(),
            }),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        if !self.prune(key) {
            return Ok(HashMap::new());
        }

        match self.entries.get(key).as_deref() {
            Some(Entry { value: Value::Hash(fields), .. }) => {
                Ok(fields.iter().map(|(k, v)| (k.clone(), v.to_string())).collect())
            }
            Some(Entry { value: Value::Text(_), .. }) => Err(CacheError::Malformed {
                key: key.to_string(),
                reason: "HGETALL against string value".to_string(),
            }),
            None => Ok(HashMap::new()),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Instant::now() + ttl;
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        drop(self.entries.remove(key));
        Ok(())
    }
}
