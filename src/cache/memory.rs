//! Bounded, size-aware in-memory cache client.
//!
//! Supports TTL expiration, optional entry-count and byte bounds,
//! cost/benefit eviction, and mutation isolation through deep cloning
//! on both set and get. Removal notifications are best-effort and never
//! block callers.
//!
//! Eviction victims are found with a full scan of the map (O(n)). That
//! is a deliberate trade-off: the scan only runs when the cache is over
//! a bound, and it keeps reads and writes free of any shared ordering
//! structure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::entry::CacheEntry;
use super::{CacheClient, ItemExpired, RemovalReason};
use crate::deep_clone::clone_value;
use crate::error::{PlinthError, PlinthResult};
use crate::size::SizeCalculator;
use crate::time::{SystemClock, TimeSource};
use crate::value::Value;

/// How entry sizes are charged against the byte bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingMode {
    /// No size tracking; every entry costs zero bytes.
    Unbounded,
    /// Every entry costs the same fixed number of bytes.
    Fixed(u64),
    /// Entry cost is computed by the size calculator at insert.
    Dynamic,
}

/// Options for [`InMemoryCacheClient`].
#[derive(Clone)]
pub struct InMemoryCacheOptions {
    /// Maximum number of live entries; `None` for unbounded.
    pub max_entries: Option<usize>,
    /// Maximum total bytes; `None` for unbounded.
    pub max_bytes: Option<u64>,
    /// Sizing policy.
    pub sizing: SizingMode,
    /// Background sweep cadence; zero disables the sweeper.
    pub sweep_interval: Duration,
    /// Time source for expiry and access stamps.
    pub time: Arc<dyn TimeSource>,
    /// Calculator used by [`SizingMode::Dynamic`].
    pub size_calculator: Arc<SizeCalculator>,
}

impl Default for InMemoryCacheOptions {
    fn default() -> Self {
        Self {
            max_entries: None,
            max_bytes: None,
            sizing: SizingMode::Unbounded,
            sweep_interval: Duration::from_secs(30),
            time: Arc::new(SystemClock),
            size_calculator: Arc::new(SizeCalculator::new()),
        }
    }
}

impl InMemoryCacheOptions {
    /// Bound the number of live entries.
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    /// Bound the total byte cost.
    pub fn with_max_bytes(mut self, max: u64) -> Self {
        self.max_bytes = Some(max);
        self
    }

    /// Choose the sizing policy.
    pub fn with_sizing(mut self, sizing: SizingMode) -> Self {
        self.sizing = sizing;
        self
    }

    /// Change the background sweep cadence (zero disables it).
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Substitute the time source.
    pub fn with_time(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    /// Substitute the size calculator.
    pub fn with_size_calculator(mut self, calculator: Arc<SizeCalculator>) -> Self {
        self.size_calculator = calculator;
        self
    }
}

/// Monotonic operation counters and current occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Read hits
    pub hits: u64,
    /// Read misses
    pub misses: u64,
    /// Writes (set/add/replace/numeric mutations)
    pub writes: u64,
    /// Live + tombstoned entries currently stored
    pub entries: usize,
    /// Total charged bytes
    pub total_bytes: u64,
}

struct CacheState {
    entries: DashMap<String, CacheEntry>,
    total_bytes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    events: broadcast::Sender<ItemExpired>,
    closed: AtomicBool,
    opts: InMemoryCacheOptions,
}

/// In-process [`CacheClient`] implementation.
pub struct InMemoryCacheClient {
    state: Arc<CacheState>,
    sweeper: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl InMemoryCacheClient {
    /// Create a cache with default options (unbounded, system clock).
    pub fn new() -> Self {
        Self::with_options(InMemoryCacheOptions::default())
    }

    /// Create a cache with explicit options.
    pub fn with_options(opts: InMemoryCacheOptions) -> Self {
        let (events, _) = broadcast::channel(1024);
        let state = Arc::new(CacheState {
            entries: DashMap::new(),
            total_bytes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            events,
            closed: AtomicBool::new(false),
            opts,
        });
        let sweeper = spawn_sweeper(&state);
        Self {
            state,
            sweeper: parking_lot::Mutex::new(sweeper),
        }
    }

    /// Subscribe to removal notifications. Delivery is best-effort: a
    /// lagging receiver loses messages rather than blocking the cache.
    pub fn subscribe_removals(&self) -> broadcast::Receiver<ItemExpired> {
        self.state.events.subscribe()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.state.hits.load(Ordering::Relaxed),
            misses: self.state.misses.load(Ordering::Relaxed),
            writes: self.state.writes.load(Ordering::Relaxed),
            entries: self.state.entries.len(),
            total_bytes: self.state.total_bytes.load(Ordering::Relaxed),
        }
    }

    /// Number of stored entries (live and tombstoned).
    pub fn entry_count(&self) -> usize {
        self.state.entries.len()
    }

    /// Total charged bytes.
    pub fn total_bytes(&self) -> u64 {
        self.state.total_bytes.load(Ordering::Relaxed)
    }

    /// Run one maintenance sweep: purge expired entries, then enforce
    /// bounds. The background task calls this on its cadence.
    pub fn sweep(&self) {
        self.state.sweep();
    }

    /// Dispose the cache; further operations fail with `Closed`.
    pub fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

impl Default for InMemoryCacheClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InMemoryCacheClient {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

fn spawn_sweeper(state: &Arc<CacheState>) -> Option<JoinHandle<()>> {
    let interval = state.opts.sweep_interval;
    if interval.is_zero() {
        return None;
    }
    let runtime = tokio::runtime::Handle::try_current().ok()?;
    let weak = Arc::downgrade(state);
    Some(runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(state) = weak.upgrade() else { break };
            if state.closed.load(Ordering::SeqCst) {
                break;
            }
            trace!("cache maintenance sweep");
            state.sweep();
        }
    }))
}

impl CacheState {
    fn ensure_open(&self) -> PlinthResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(PlinthError::Closed)
        } else {
            Ok(())
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.opts.time.utc_now()
    }

    fn emit(&self, key: &str, reason: RemovalReason) {
        let _ = self.events.send(ItemExpired {
            key: key.to_string(),
            reason,
        });
    }

    fn adjust_bytes(&self, delta: i64) {
        if delta >= 0 {
            self.total_bytes.fetch_add(delta as u64, Ordering::Relaxed);
        } else {
            self.total_bytes
                .fetch_sub(delta.unsigned_abs(), Ordering::Relaxed);
        }
    }

    fn entry_size(&self, value: &Value) -> PlinthResult<u64> {
        match self.opts.sizing {
            SizingMode::Unbounded => Ok(0),
            SizingMode::Fixed(size) => Ok(size),
            SizingMode::Dynamic => self.opts.size_calculator.measure(value),
        }
    }

    fn check_capacity(&self, size: u64) -> PlinthResult<()> {
        if let Some(limit) = self.opts.max_bytes {
            if size > limit {
                return Err(PlinthError::TooLarge { size, limit });
            }
        }
        Ok(())
    }

    fn expiry(&self, now: DateTime<Utc>, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.map(|d| {
            chrono::Duration::from_std(d)
                .ok()
                .and_then(|cd| now.checked_add_signed(cd))
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        })
    }

    /// Remove a key unconditionally. Returns the entry and whether it
    /// was still live.
    fn take_entry(&self, key: &str, reason: RemovalReason) -> Option<(CacheEntry, bool)> {
        let now = self.now();
        let (_, entry) = self.entries.remove(key)?;
        let live = !entry.is_expired(now);
        self.adjust_bytes(-(entry.size_bytes as i64));
        self.emit(key, if live { reason } else { RemovalReason::Expired });
        Some((entry, live))
    }

    /// Drop a tombstoned entry if present.
    fn purge_if_expired(&self, key: &str, now: DateTime<Utc>) {
        if let Some((_, entry)) = self.entries.remove_if(key, |_, e| e.is_expired(now)) {
            self.adjust_bytes(-(entry.size_bytes as i64));
            self.emit(key, RemovalReason::Expired);
        }
    }

    fn purge_expired(&self, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().is_expired(now))
            .map(|e| e.key().clone())
            .collect();
        for key in expired {
            self.purge_if_expired(&key, now);
        }
    }

    fn over_limits(&self) -> bool {
        if let Some(max) = self.opts.max_entries {
            if self.entries.len() > max {
                return true;
            }
        }
        if let Some(max) = self.opts.max_bytes {
            if self.total_bytes.load(Ordering::Relaxed) > max {
                return true;
            }
        }
        false
    }

    fn enforce_after_mutation(&self, protect: &str) {
        if self.over_limits() {
            self.evict(Some(protect));
        }
    }

    fn sweep(&self) {
        self.purge_expired(self.now());
        if self.over_limits() {
            self.evict(None);
        }
    }

    /// Bring the cache back within its bounds.
    ///
    /// Order: expired entries first, then count pressure
    /// (oldest-accessed first), then byte pressure (worst
    /// `access_count / size_bytes` ratio, ties to the oldest access).
    /// The byte pass removes at most `min(1000, 10 × over_limit_factor)`
    /// entries per cycle; a later sweep finishes the job if the cap is
    /// hit. `protect` shields the key written by the triggering
    /// operation.
    fn evict(&self, protect: Option<&str>) {
        let now = self.now();
        self.purge_expired(now);

        if let Some(max) = self.opts.max_entries {
            while self.entries.len() > max {
                let victim = self
                    .entries
                    .iter()
                    .filter(|e| Some(e.key().as_str()) != protect)
                    .min_by_key(|e| e.value().last_accessed_at)
                    .map(|e| e.key().clone());
                let Some(key) = victim else { break };
                if self.take_entry(&key, RemovalReason::Evicted).is_some() {
                    debug!(key = %key, "evicted entry over count bound");
                }
            }
        }

        if let Some(max) = self.opts.max_bytes {
            let total = self.total_bytes.load(Ordering::Relaxed);
            if total <= max {
                return;
            }
            let over_limit_factor = (total + max - 1) / max;
            let removal_cap = (10 * over_limit_factor).min(1000);
            let mut removed = 0u64;
            while self.total_bytes.load(Ordering::Relaxed) > max && removed < removal_cap {
                let victim = self
                    .entries
                    .iter()
                    .filter(|e| Some(e.key().as_str()) != protect)
                    .map(|e| {
                        (
                            e.key().clone(),
                            e.value().usage_ratio(),
                            e.value().last_accessed_at,
                        )
                    })
                    .min_by(|a, b| {
                        a.1.partial_cmp(&b.1)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then(a.2.cmp(&b.2))
                    })
                    .map(|(key, _, _)| key);
                let Some(key) = victim else { break };
                if self.take_entry(&key, RemovalReason::Evicted).is_some() {
                    removed += 1;
                    debug!(key = %key, "evicted entry over byte bound");
                }
            }
        }
    }
}

fn expired_immediately(ttl: Option<Duration>) -> bool {
    matches!(ttl, Some(d) if d.is_zero())
}

#[async_trait]
impl CacheClient for InMemoryCacheClient {
    async fn get(&self, key: &str) -> PlinthResult<Option<Value>> {
        let state = &self.state;
        state.ensure_open()?;
        let now = state.now();
        if let Some(mut entry) = state.entries.get_mut(key) {
            if !entry.is_expired(now) {
                entry.touch_access(now);
                let value = clone_value((*entry).value());
                state.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(value));
            }
        }
        state.purge_if_expired(key, now);
        state.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    async fn get_many(&self, keys: &[String]) -> PlinthResult<HashMap<String, Option<Value>>> {
        let mut result = HashMap::with_capacity(keys.len());
        for key in keys {
            result.insert(key.clone(), self.get(key).await?);
        }
        Ok(result)
    }

    async fn get_all(&self) -> PlinthResult<HashMap<String, Value>> {
        let state = &self.state;
        state.ensure_open()?;
        let now = state.now();
        let mut result = HashMap::new();
        for entry in state.entries.iter() {
            if !entry.value().is_expired(now) {
                result.insert(entry.key().clone(), clone_value(entry.value().value()));
            }
        }
        Ok(result)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> PlinthResult<bool> {
        let state = &self.state;
        state.ensure_open()?;
        let now = state.now();
        if expired_immediately(ttl) {
            let existed = matches!(state.take_entry(key, RemovalReason::Removed), Some((_, true)));
            return Ok(existed);
        }
        let stored = clone_value(&value);
        let size = state.entry_size(&stored)?;
        state.check_capacity(size)?;
        let expires_at = state.expiry(now, ttl);
        let had_prior = match state.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let prior_live = !occupied.get().is_expired(now);
                let old_size = occupied.get().size_bytes;
                if !prior_live {
                    state.emit(key, RemovalReason::Expired);
                }
                occupied.insert(CacheEntry::new(stored, expires_at, now, size));
                state.adjust_bytes(size as i64 - old_size as i64);
                prior_live
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry::new(stored, expires_at, now, size));
                state.adjust_bytes(size as i64);
                false
            }
        };
        state.writes.fetch_add(1, Ordering::Relaxed);
        state.enforce_after_mutation(key);
        Ok(had_prior)
    }

    async fn add(&self, key: &str, value: Value, ttl: Option<Duration>) -> PlinthResult<bool> {
        let state = &self.state;
        state.ensure_open()?;
        let now = state.now();
        if expired_immediately(ttl) {
            state.take_entry(key, RemovalReason::Removed);
            return Ok(false);
        }
        let stored = clone_value(&value);
        let size = state.entry_size(&stored)?;
        state.check_capacity(size)?;
        let expires_at = state.expiry(now, ttl);
        let inserted = match state.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    let old_size = occupied.get().size_bytes;
                    state.emit(key, RemovalReason::Expired);
                    occupied.insert(CacheEntry::new(stored, expires_at, now, size));
                    state.adjust_bytes(size as i64 - old_size as i64);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry::new(stored, expires_at, now, size));
                state.adjust_bytes(size as i64);
                true
            }
        };
        if inserted {
            state.writes.fetch_add(1, Ordering::Relaxed);
            state.enforce_after_mutation(key);
        }
        Ok(inserted)
    }

    async fn replace(&self, key: &str, value: Value, ttl: Option<Duration>) -> PlinthResult<bool> {
        let state = &self.state;
        state.ensure_open()?;
        let now = state.now();
        if expired_immediately(ttl) {
            let existed = matches!(state.take_entry(key, RemovalReason::Removed), Some((_, true)));
            return Ok(existed);
        }
        let stored = clone_value(&value);
        let size = state.entry_size(&stored)?;
        state.check_capacity(size)?;
        let expires_at = state.expiry(now, ttl);
        let replaced = {
            match state.entries.get_mut(key) {
                Some(mut entry) if !entry.is_expired(now) => {
                    let old_size = entry.size_bytes;
                    entry.replace_value(stored, size, now, expires_at);
                    state.adjust_bytes(size as i64 - old_size as i64);
                    true
                }
                _ => false,
            }
        };
        if replaced {
            state.writes.fetch_add(1, Ordering::Relaxed);
            state.enforce_after_mutation(key);
        } else {
            state.purge_if_expired(key, now);
        }
        Ok(replaced)
    }

    async fn replace_if_equal(
        &self,
        key: &str,
        expected: &Value,
        value: Value,
        ttl: Option<Duration>,
    ) -> PlinthResult<bool> {
        let state = &self.state;
        state.ensure_open()?;
        let now = state.now();
        let stored = clone_value(&value);
        let size = state.entry_size(&stored)?;
        state.check_capacity(size)?;
        let expires_at = state.expiry(now, ttl);
        let replaced = {
            match state.entries.get_mut(key) {
                Some(mut entry) if !entry.is_expired(now) && (*entry).value() == expected => {
                    let old_size = entry.size_bytes;
                    entry.replace_value(stored, size, now, expires_at);
                    state.adjust_bytes(size as i64 - old_size as i64);
                    true
                }
                _ => false,
            }
        };
        if replaced {
            state.writes.fetch_add(1, Ordering::Relaxed);
            state.enforce_after_mutation(key);
        } else {
            state.purge_if_expired(key, now);
        }
        Ok(replaced)
    }

    async fn remove(&self, key: &str) -> PlinthResult<bool> {
        self.state.ensure_open()?;
        Ok(matches!(
            self.state.take_entry(key, RemovalReason::Removed),
            Some((_, true))
        ))
    }

    async fn remove_if_equal(&self, key: &str, expected: &Value) -> PlinthResult<bool> {
        let state = &self.state;
        state.ensure_open()?;
        let now = state.now();
        if let Some((_, entry)) = state
            .entries
            .remove_if(key, |_, e| !e.is_expired(now) && e.value() == expected)
        {
            state.adjust_bytes(-(entry.size_bytes as i64));
            state.emit(key, RemovalReason::Removed);
            return Ok(true);
        }
        state.purge_if_expired(key, now);
        Ok(false)
    }

    async fn remove_many(&self, keys: &[String]) -> PlinthResult<usize> {
        self.state.ensure_open()?;
        let mut removed = 0;
        for key in keys {
            if matches!(
                self.state.take_entry(key, RemovalReason::Removed),
                Some((_, true))
            ) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn remove_by_prefix(&self, prefix: &str) -> PlinthResult<usize> {
        let state = &self.state;
        state.ensure_open()?;
        let matching: Vec<String> = state
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        let mut removed = 0;
        for key in matching {
            if state.take_entry(&key, RemovalReason::Removed).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> PlinthResult<bool> {
        let state = &self.state;
        state.ensure_open()?;
        let now = state.now();
        let live = state
            .entries
            .get(key)
            .map(|e| !e.is_expired(now))
            .unwrap_or(false);
        if !live {
            state.purge_if_expired(key, now);
        }
        Ok(live)
    }

    async fn touch(&self, key: &str, ttl: Duration) -> PlinthResult<bool> {
        let state = &self.state;
        state.ensure_open()?;
        let now = state.now();
        if ttl.is_zero() {
            let existed = matches!(state.take_entry(key, RemovalReason::Removed), Some((_, true)));
            return Ok(existed);
        }
        let expires_at = state.expiry(now, Some(ttl));
        let touched = match state.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = expires_at;
                entry.last_modified_at = now;
                true
            }
            _ => false,
        };
        if !touched {
            state.purge_if_expired(key, now);
        }
        Ok(touched)
    }

    async fn expires_in(&self, key: &str) -> PlinthResult<Option<Duration>> {
        let state = &self.state;
        state.ensure_open()?;
        let now = state.now();
        let remaining = state.entries.get(key).and_then(|entry| {
            if entry.is_expired(now) {
                None
            } else {
                entry
                    .expires_at
                    .and_then(|at| (at - now).to_std().ok())
            }
        });
        if remaining.is_none() {
            state.purge_if_expired(key, now);
        }
        Ok(remaining)
    }

    async fn increment(&self, key: &str, delta: f64, ttl: Option<Duration>) -> PlinthResult<f64> {
        let state = &self.state;
        state.ensure_open()?;
        let now = state.now();
        if expired_immediately(ttl) {
            state.take_entry(key, RemovalReason::Removed);
            return Ok(delta);
        }
        let expires_at = state.expiry(now, ttl);
        let mut replaced_tombstone = false;
        let result = match state.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    replaced_tombstone = true;
                    let old_size = occupied.get().size_bytes;
                    let stored = Value::Float(delta);
                    let size = state.entry_size(&stored)?;
                    occupied.insert(CacheEntry::new(stored, expires_at, now, size));
                    state.adjust_bytes(size as i64 - old_size as i64);
                    delta
                } else {
                    let current = occupied.get().value().as_f64().ok_or_else(|| {
                        PlinthError::InvalidArgument(format!(
                            "value for key '{}' is not numeric",
                            key
                        ))
                    })?;
                    let next = current + delta;
                    let stored = Value::Float(next);
                    let size = state.entry_size(&stored)?;
                    let old_size = occupied.get().size_bytes;
                    occupied
                        .get_mut()
                        .replace_value(stored, size, now, expires_at);
                    state.adjust_bytes(size as i64 - old_size as i64);
                    next
                }
            }
            Entry::Vacant(vacant) => {
                let stored = Value::Float(delta);
                let size = state.entry_size(&stored)?;
                vacant.insert(CacheEntry::new(stored, expires_at, now, size));
                state.adjust_bytes(size as i64);
                delta
            }
        };
        if replaced_tombstone {
            state.emit(key, RemovalReason::Expired);
        }
        state.writes.fetch_add(1, Ordering::Relaxed);
        state.enforce_after_mutation(key);
        Ok(result)
    }

    async fn set_if_higher(
        &self,
        key: &str,
        value: f64,
        ttl: Option<Duration>,
    ) -> PlinthResult<f64> {
        self.set_monotonic(key, value, ttl, true).await
    }

    async fn set_if_lower(
        &self,
        key: &str,
        value: f64,
        ttl: Option<Duration>,
    ) -> PlinthResult<f64> {
        self.set_monotonic(key, value, ttl, false).await
    }
}

impl InMemoryCacheClient {
    async fn set_monotonic(
        &self,
        key: &str,
        value: f64,
        ttl: Option<Duration>,
        higher: bool,
    ) -> PlinthResult<f64> {
        let state = &self.state;
        state.ensure_open()?;
        let now = state.now();
        if expired_immediately(ttl) {
            state.take_entry(key, RemovalReason::Removed);
            return Ok(value);
        }
        let expires_at = state.expiry(now, ttl);
        let mut replaced_tombstone = false;
        let result = match state.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    replaced_tombstone = true;
                    let old_size = occupied.get().size_bytes;
                    let stored = Value::Float(value);
                    let size = state.entry_size(&stored)?;
                    occupied.insert(CacheEntry::new(stored, expires_at, now, size));
                    state.adjust_bytes(size as i64 - old_size as i64);
                    value
                } else {
                    let current = occupied.get().value().as_f64().ok_or_else(|| {
                        PlinthError::InvalidArgument(format!(
                            "value for key '{}' is not numeric",
                            key
                        ))
                    })?;
                    let keep_new = if higher { value > current } else { value < current };
                    if keep_new {
                        let stored = Value::Float(value);
                        let size = state.entry_size(&stored)?;
                        let old_size = occupied.get().size_bytes;
                        occupied
                            .get_mut()
                            .replace_value(stored, size, now, expires_at);
                        state.adjust_bytes(size as i64 - old_size as i64);
                        value
                    } else {
                        current
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let stored = Value::Float(value);
                let size = state.entry_size(&stored)?;
                vacant.insert(CacheEntry::new(stored, expires_at, now, size));
                state.adjust_bytes(size as i64);
                value
            }
        };
        if replaced_tombstone {
            state.emit(key, RemovalReason::Expired);
        }
        state.writes.fetch_add(1, Ordering::Relaxed);
        state.enforce_after_mutation(key);
        Ok(result)
    }
}
