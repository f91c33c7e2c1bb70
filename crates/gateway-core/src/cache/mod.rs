//! Short-TTL key/value cache adapter.
//!
//! The gateway keeps no mutable state in-process; all cross-request and
//! cross-process coordination flows through a short-TTL key/value store
//! speaking a minimal Redis-like subset: `GET`, `SET EX [NX]`, `HINCRBY`,
//! `HGETALL`, `EXPIRE`, `DEL`.
//!
//! Two layers live here:
//!
//! - [`CacheBackend`]: the raw protocol surface. [`memory::MemoryCache`]
//!   implements it in-process for tests and single-node deployments; a Redis
//!   client satisfies the same trait out-of-process.
//! - [`RelayCache`]: the fail-open wrapper every component uses. Backend
//!   errors are logged and swallowed; reads degrade to misses and writes to
//!   no-ops, so a cache outage slows the gateway down without taking it down.

pub mod keys;
pub mod memory;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::warn;

/// Errors surfaced by a cache backend.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backend could not be reached or the operation timed out.
    #[error("cache backend unreachable: {0}")]
    Unreachable(String),

    /// The stored value does not have the shape the operation expects,
    /// e.g. `HINCRBY` against a plain string key.
    #[error("malformed cache value at {key}: {reason}")]
    Malformed { key: String, reason: String },
}

/// Minimal short-TTL key/value store surface.
///
/// All operations are async; implementations must be safe for concurrent use
/// from many relay tasks. Hash fields hold decimal integers.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// `SET key value EX ttl NX`. Returns `true` when the key was absent and
    /// has been set, `false` when another writer holds it.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Atomically increments `field` of the hash at `key` by `delta`,
    /// creating the hash and the field as needed. Returns the new value.
    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64, CacheError>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, CacheError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn del(&self, key: &str) -> Result<(), CacheError>;
}

/// Fail-open cache facade.
///
/// The relay path must never fail because the cache is unhealthy: a read
/// error is a cache miss, a write error is a dropped write, and both are
/// logged at `warn`. Lock acquisition degrades to "not acquired" so a cache
/// outage also stops all probing rather than electing every request a prober.
#[derive(Clone)]
pub struct RelayCache {
    backend: Arc<dyn CacheBackend>,
}

impl RelayCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        match self.backend.get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    /// Reads and deserializes a JSON value. Undecodable entries are treated
    /// as misses so a stale schema never wedges the relay path.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "undecodable cache entry, treating as miss");
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) {
        if let Err(e) = self.backend.set(key, value, ttl).await {
            warn!(key, error = %e, "cache write failed");
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(key, &raw, ttl).await,
            Err(e) => warn!(key, error = %e, "failed to serialize cache value"),
        }
    }

    /// Attempts to take the distributed lock at `key`. Returns `false` both
    /// when another holder owns the lock and when the backend is unreachable.
    pub async fn try_lock(&self, key: &str, ttl: Duration) -> bool {
        match self.backend.set_nx(key, "1", ttl).await {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(key, error = %e, "lock acquisition failed");
                false
            }
        }
    }

    pub async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Option<i64> {
        match self.backend.hincrby(key, field, delta).await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, field, error = %e, "cache hash increment failed");
                None
            }
        }
    }

    /// Returns the hash at `key`, or an empty map on miss or error.
    pub async fn hgetall(&self, key: &str) -> HashMap<String, String> {
        match self.backend.hgetall(key).await {
            Ok(fields) => fields,
            Err(e) => {
                warn!(key, error = %e, "cache hash read failed, treating as empty");
                HashMap::new()
            }
        }
    }

    pub async fn expire(&self, key: &str, ttl: Duration) {
        if let Err(e) = self.backend.expire(key, ttl).await {
            warn!(key, error = %e, "cache expire failed");
        }
    }

    pub async fn del(&self, key: &str) {
        if let Err(e) = self.backend.del(key).await {
            warn!(key, error = %e, "cache delete failed");
        }
    }
}
