//! Cache client capability and the in-memory implementation.
//!
//! The [`CacheClient`] trait is the surface the lock provider, job
//! runner, and metrics buffer are written against; backing stores
//! (Redis and friends) implement the same trait out of tree. The
//! in-process implementation lives in [`memory`].

mod entry;
pub mod memory;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

pub use entry::CacheEntry;
pub use memory::{CacheStats, InMemoryCacheClient, InMemoryCacheOptions, SizingMode};

use crate::error::PlinthResult;
use crate::value::Value;

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// TTL elapsed
    Expired,
    /// Capacity pressure chose it as a victim
    Evicted,
    /// Explicit removal
    Removed,
}

/// Best-effort notification emitted on every removal.
#[derive(Debug, Clone)]
pub struct ItemExpired {
    /// Key of the removed entry
    pub key: String,
    /// Why it was removed
    pub reason: RemovalReason,
}

/// Key/value cache capability.
///
/// All operations are safe under concurrent callers and serialize per
/// key. Absence on `get` is a miss (`Ok(None)`), never an error. TTLs
/// of zero mean "expired immediately": the write leaves nothing
/// readable.
#[async_trait]
pub trait CacheClient: Send + Sync {
    /// Fetch a value. Expired entries read as a miss and are removed.
    async fn get(&self, key: &str) -> PlinthResult<Option<Value>>;

    /// Batch of [`CacheClient::get`].
    async fn get_many(&self, keys: &[String]) -> PlinthResult<HashMap<String, Option<Value>>>;

    /// Every live entry. Intended for maintenance tooling, not hot paths.
    async fn get_all(&self) -> PlinthResult<HashMap<String, Value>>;

    /// Insert or replace. Returns whether a live prior value existed.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> PlinthResult<bool>;

    /// Insert only if absent; returns `true` iff inserted. Atomic with
    /// respect to concurrent `add`/`set` on the same key.
    async fn add(&self, key: &str, value: Value, ttl: Option<Duration>) -> PlinthResult<bool>;

    /// Replace only if present; returns `true` iff replaced.
    async fn replace(&self, key: &str, value: Value, ttl: Option<Duration>) -> PlinthResult<bool>;

    /// Replace only if the stored value equals `expected`.
    async fn replace_if_equal(
        &self,
        key: &str,
        expected: &Value,
        value: Value,
        ttl: Option<Duration>,
    ) -> PlinthResult<bool>;

    /// Delete a key; returns whether a live entry existed.
    async fn remove(&self, key: &str) -> PlinthResult<bool>;

    /// Compare-and-delete: remove only if the stored value equals
    /// `expected`. Prevents a stale holder from deleting a successor's
    /// entry.
    async fn remove_if_equal(&self, key: &str, expected: &Value) -> PlinthResult<bool>;

    /// Delete several keys; returns the number removed.
    async fn remove_many(&self, keys: &[String]) -> PlinthResult<usize>;

    /// Delete every key starting with `prefix`; returns the number
    /// removed.
    async fn remove_by_prefix(&self, prefix: &str) -> PlinthResult<usize>;

    /// Whether a live entry exists.
    async fn exists(&self, key: &str) -> PlinthResult<bool>;

    /// Extend a live entry's expiry; no-op (returns `false`) if absent.
    async fn touch(&self, key: &str, ttl: Duration) -> PlinthResult<bool>;

    /// Remaining TTL of a live entry; `None` if absent or unbounded.
    async fn expires_in(&self, key: &str) -> PlinthResult<Option<Duration>>;

    /// Atomic numeric mutation; creates the entry with `delta` when
    /// absent. Returns the new value.
    async fn increment(&self, key: &str, delta: f64, ttl: Option<Duration>) -> PlinthResult<f64>;

    /// Atomic numeric decrement; see [`CacheClient::increment`].
    async fn decrement(&self, key: &str, delta: f64, ttl: Option<Duration>) -> PlinthResult<f64> {
        self.increment(key, -delta, ttl).await
    }

    /// Atomic monotonic update: keep the larger of the stored and given
    /// values. Returns the value now stored.
    async fn set_if_higher(&self, key: &str, value: f64, ttl: Option<Duration>)
        -> PlinthResult<f64>;

    /// Atomic monotonic update: keep the smaller of the stored and
    /// given values. Returns the value now stored.
    async fn set_if_lower(&self, key: &str, value: f64, ttl: Option<Duration>)
        -> PlinthResult<f64>;
}
