//! Cache entry bookkeeping.

use chrono::{DateTime, Utc};

use crate::value::Value;

/// A stored cache entry with the metadata eviction relies on.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    value: Value,
    /// Tombstone instant; entries at or past it are treated as absent.
    pub(crate) expires_at: Option<DateTime<Utc>>,
    pub(crate) last_accessed_at: DateTime<Utc>,
    pub(crate) last_modified_at: DateTime<Utc>,
    pub(crate) size_bytes: u64,
    pub(crate) access_count: u64,
}

impl CacheEntry {
    pub(crate) fn new(
        value: Value,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        size_bytes: u64,
    ) -> Self {
        Self {
            value,
            expires_at,
            last_accessed_at: now,
            last_modified_at: now,
            size_bytes,
            access_count: 0,
        }
    }

    /// Whether the entry is tombstoned at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    /// The stored value (not cloned; internal use).
    pub(crate) fn value(&self) -> &Value {
        &self.value
    }

    pub(crate) fn touch_access(&mut self, now: DateTime<Utc>) {
        self.access_count += 1;
        self.last_accessed_at = now;
    }

    pub(crate) fn replace_value(
        &mut self,
        value: Value,
        size_bytes: u64,
        now: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) {
        self.value = value;
        self.size_bytes = size_bytes;
        self.last_modified_at = now;
        self.last_accessed_at = now;
        if expires_at.is_some() {
            self.expires_at = expires_at;
        }
    }

    /// Eviction ranking: entries with the least usage per byte go first.
    pub(crate) fn usage_ratio(&self) -> f64 {
        self.access_count as f64 / self.size_bytes.max(1) as f64
    }

    /// Size charged against the memory bound.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Number of read hits since insertion.
    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    /// Last read or write instant.
    pub fn last_accessed_at(&self) -> DateTime<Utc> {
        self.last_accessed_at
    }

    /// Last write instant.
    pub fn last_modified_at(&self) -> DateTime<Utc> {
        self.last_modified_at
    }
}
