//! Cache-backed distributed locks.
//!
//! Every process sharing the same cache and message bus pair contends
//! for the same locks. A lock is a cache entry holding an unguessable
//! token under the resource name; the lease TTL is authoritative, so a
//! crashed holder self-heals when the entry expires. Waiters sleep on
//! the holder's remaining TTL and are woken early by a release
//! notification on the bus.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::cache::CacheClient;
use crate::cancellation::CancelToken;
use crate::error::PlinthResult;
use crate::messaging::{MessageBus, MessageBusExt};
use crate::time::TimeSource;
use crate::value::Value;

/// Fallback poll cadence when the holder's TTL is unknown.
const DEFAULT_POLL: Duration = Duration::from_secs(1);
/// Lower bound on waits so contention never busy-spins.
const MIN_WAIT: Duration = Duration::from_millis(10);

/// Bus notification published after a lock is released.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockReleased {
    /// Resource name that was released
    pub name: String,
}

/// Distributed mutual-exclusion capability.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Acquire the named lock, waiting up to `max_wait` (`None` waits
    /// indefinitely, zero never waits). Returns `Ok(None)` when the
    /// wait elapses or `cancellation` fires.
    async fn acquire(
        &self,
        name: &str,
        lease: Duration,
        max_wait: Option<Duration>,
        cancellation: &CancelToken,
    ) -> PlinthResult<Option<LockHandle>>;

    /// Whether some token currently holds the named lock.
    async fn is_locked(&self, name: &str) -> PlinthResult<bool>;

    /// Force-release by name, without a token. Maintenance tooling only:
    /// this can release a live holder's lock.
    async fn release_lock(&self, name: &str) -> PlinthResult<()>;
}

enum HandleBackend {
    Cache {
        cache: Arc<dyn CacheClient>,
        bus: Arc<dyn MessageBus>,
    },
    Throttled,
}

/// Capability to renew or release an acquired lock.
///
/// Releasing twice is a no-op. Dropping an unreleased handle leaves the
/// lease to expire on its own.
pub struct LockHandle {
    name: String,
    lock_id: String,
    acquired_at: DateTime<Utc>,
    lease: parking_lot::Mutex<Duration>,
    renewal_count: AtomicU32,
    released: AtomicBool,
    backend: HandleBackend,
}

impl LockHandle {
    fn new(
        name: &str,
        lock_id: String,
        lease: Duration,
        acquired_at: DateTime<Utc>,
        backend: HandleBackend,
    ) -> Self {
        Self {
            name: name.to_string(),
            lock_id,
            acquired_at,
            lease: parking_lot::Mutex::new(lease),
            renewal_count: AtomicU32::new(0),
            released: AtomicBool::new(false),
            backend,
        }
    }

    /// Resource name this handle covers.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The unguessable token identifying this acquisition.
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    /// When the lock was acquired.
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Number of successful renewals.
    pub fn renewal_count(&self) -> u32 {
        self.renewal_count.load(Ordering::SeqCst)
    }

    /// Whether the handle has been released.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Release the lock and notify waiters. A handle can only release
    /// its own acquisition: the removal is conditional on the stored
    /// token still being ours, so a delayed holder cannot release a
    /// successor's lock.
    pub async fn release(&self) -> PlinthResult<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match &self.backend {
            HandleBackend::Cache { cache, bus } => {
                let removed = cache
                    .remove_if_equal(&self.name, &Value::from(self.lock_id.as_str()))
                    .await?;
                if !removed {
                    debug!(name = %self.name, "lock already expired or taken over at release");
                }
                bus.publish(LockReleased {
                    name: self.name.clone(),
                })?;
                trace!(name = %self.name, "released lock");
                Ok(())
            }
            HandleBackend::Throttled => Ok(()),
        }
    }

    /// Extend the lease, guarded by the same token compare. Fails with
    /// `NotFound` when the lock is no longer held by this handle.
    pub async fn renew(&self, lease: Option<Duration>) -> PlinthResult<()> {
        if self.is_released() {
            return Err(crate::error::PlinthError::NotFound(self.name.clone()));
        }
        match &self.backend {
            HandleBackend::Cache { cache, .. } => {
                let duration = lease.unwrap_or(*self.lease.lock());
                let renewed = cache
                    .replace_if_equal(
                        &self.name,
                        &Value::from(self.lock_id.as_str()),
                        Value::from(self.lock_id.as_str()),
                        Some(duration),
                    )
                    .await?;
                if !renewed {
                    return Err(crate::error::PlinthError::NotFound(self.name.clone()));
                }
                *self.lease.lock() = duration;
                self.renewal_count.fetch_add(1, Ordering::SeqCst);
                trace!(name = %self.name, "renewed lock");
                Ok(())
            }
            HandleBackend::Throttled => Ok(()),
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if !self.is_released() {
            trace!(name = %self.name, "lock handle dropped; lease will expire on its own");
        }
    }
}

/// Lock provider over a shared cache and message bus.
pub struct CacheLockProvider {
    cache: Arc<dyn CacheClient>,
    bus: Arc<dyn MessageBus>,
    time: Arc<dyn TimeSource>,
}

impl CacheLockProvider {
    /// Create a provider over the given cache/bus/time capabilities.
    pub fn new(
        cache: Arc<dyn CacheClient>,
        bus: Arc<dyn MessageBus>,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        Self { cache, bus, time }
    }

    async fn try_acquire(&self, name: &str, token_id: &str, lease: Duration) -> PlinthResult<bool> {
        self.cache
            .add(name, Value::from(token_id), Some(lease))
            .await
    }

    fn handle(&self, name: &str, token_id: String, lease: Duration) -> LockHandle {
        LockHandle::new(
            name,
            token_id,
            lease,
            self.time.utc_now(),
            HandleBackend::Cache {
                cache: self.cache.clone(),
                bus: self.bus.clone(),
            },
        )
    }
}

#[async_trait]
impl LockProvider for CacheLockProvider {
    async fn acquire(
        &self,
        name: &str,
        lease: Duration,
        max_wait: Option<Duration>,
        cancellation: &CancelToken,
    ) -> PlinthResult<Option<LockHandle>> {
        if cancellation.is_cancelled() {
            return Ok(None);
        }
        let token_id = Uuid::new_v4().to_string();
        let started = self.time.utc_now();
        let deadline = max_wait.and_then(|w| {
            chrono::Duration::from_std(w)
                .ok()
                .and_then(|cd| started.checked_add_signed(cd))
        });

        if self.try_acquire(name, &token_id, lease).await? {
            trace!(name = %name, "acquired lock on first attempt");
            return Ok(Some(self.handle(name, token_id, lease)));
        }
        if matches!(max_wait, Some(w) if w.is_zero()) {
            trace!(name = %name, "lock busy and max wait is zero");
            return Ok(None);
        }

        // Woken by release notifications; notify_one keeps a permit so a
        // release between retry and wait is not lost.
        let notify = Arc::new(Notify::new());
        let waker = notify.clone();
        let watched = name.to_string();
        let _subscription = self.bus.subscribe::<LockReleased, _>(move |msg| {
            if msg.name == watched {
                waker.notify_one();
            }
        });

        loop {
            if self.try_acquire(name, &token_id, lease).await? {
                trace!(name = %name, "acquired lock after waiting");
                return Ok(Some(self.handle(name, token_id, lease)));
            }

            let now = self.time.utc_now();
            let remaining = match deadline {
                Some(d) => match (d - now).to_std() {
                    Ok(r) if !r.is_zero() => Some(r),
                    _ => {
                        trace!(name = %name, "lock wait elapsed");
                        return Ok(None);
                    }
                },
                None => None,
            };

            // Sleep until the holder's lease would expire, bounded by the
            // remaining wait; release notifications cut it short.
            let holder_ttl = self.cache.expires_in(name).await?;
            let mut wait = holder_ttl.unwrap_or(DEFAULT_POLL);
            if let Some(remaining) = remaining {
                wait = wait.min(remaining);
            }
            wait = wait.clamp(MIN_WAIT, Duration::from_secs(60));

            tokio::select! {
                _ = notify.notified() => {}
                result = self.time.sleep(wait, cancellation) => {
                    if result.is_err() {
                        return Ok(None);
                    }
                }
            }
            if cancellation.is_cancelled() {
                return Ok(None);
            }
        }
    }

    async fn is_locked(&self, name: &str) -> PlinthResult<bool> {
        self.cache.exists(name).await
    }

    async fn release_lock(&self, name: &str) -> PlinthResult<()> {
        self.cache.remove(name).await?;
        self.bus.publish(LockReleased {
            name: name.to_string(),
        })?;
        Ok(())
    }
}

/// Lock provider that admits at most `max_hits` acquisitions per rolling
/// window per name.
///
/// Implemented with a monotonically incremented counter in the cache,
/// bucketed by window start. Releasing a throttled lock does not return
/// a permit; the budget is per window. The lease argument is unused:
/// this provider arbitrates admission, not exclusivity.
pub struct ThrottlingLockProvider {
    cache: Arc<dyn CacheClient>,
    time: Arc<dyn TimeSource>,
    max_hits: u32,
    throttle_period: Duration,
}

impl ThrottlingLockProvider {
    /// Create a provider admitting `max_hits` per `throttle_period`.
    pub fn new(
        cache: Arc<dyn CacheClient>,
        time: Arc<dyn TimeSource>,
        max_hits: u32,
        throttle_period: Duration,
    ) -> Self {
        Self {
            cache,
            time,
            max_hits: max_hits.max(1),
            throttle_period: throttle_period.max(Duration::from_secs(1)),
        }
    }

    fn period_secs(&self) -> i64 {
        self.throttle_period.as_secs() as i64
    }

    fn bucket_key(&self, name: &str, now: DateTime<Utc>) -> String {
        let bucket = now.timestamp() / self.period_secs();
        format!("throttle:{}:{}", name, bucket)
    }

    fn until_next_window(&self, now: DateTime<Utc>) -> Duration {
        let period = self.period_secs();
        let into = now.timestamp().rem_euclid(period);
        // Pad past the boundary so the retry lands in the next bucket.
        Duration::from_secs((period - into) as u64) + Duration::from_millis(10)
    }
}

#[async_trait]
impl LockProvider for ThrottlingLockProvider {
    async fn acquire(
        &self,
        name: &str,
        _lease: Duration,
        max_wait: Option<Duration>,
        cancellation: &CancelToken,
    ) -> PlinthResult<Option<LockHandle>> {
        let started = self.time.utc_now();
        let deadline = max_wait.and_then(|w| {
            chrono::Duration::from_std(w)
                .ok()
                .and_then(|cd| started.checked_add_signed(cd))
        });
        loop {
            if cancellation.is_cancelled() {
                return Ok(None);
            }
            let now = self.time.utc_now();
            let key = self.bucket_key(name, now);
            let count = self
                .cache
                .increment(&key, 1.0, Some(self.throttle_period * 2))
                .await?;
            if count <= self.max_hits as f64 {
                trace!(name = %name, count, "throttled lock admitted");
                return Ok(Some(LockHandle::new(
                    name,
                    Uuid::new_v4().to_string(),
                    self.throttle_period,
                    now,
                    HandleBackend::Throttled,
                )));
            }

            let mut wait = self.until_next_window(now);
            match deadline {
                Some(d) => match (d - now).to_std() {
                    Ok(remaining) if remaining > wait => {}
                    _ => {
                        trace!(name = %name, "throttled lock budget exhausted for this window");
                        return Ok(None);
                    }
                },
                None => {}
            }
            wait = wait.max(MIN_WAIT);
            if self.time.sleep(wait, cancellation).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn is_locked(&self, name: &str) -> PlinthResult<bool> {
        let key = self.bucket_key(name, self.time.utc_now());
        let count = self
            .cache
            .get(&key)
            .await?
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        Ok(count >= self.max_hits as f64)
    }

    async fn release_lock(&self, _name: &str) -> PlinthResult<()> {
        // Window budgets are not returnable.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheClient;
    use crate::messaging::InProcessMessageBus;
    use crate::time::SystemClock;

    fn provider() -> CacheLockProvider {
        CacheLockProvider::new(
            Arc::new(InMemoryCacheClient::new()),
            Arc::new(InProcessMessageBus::new()),
            Arc::new(SystemClock),
        )
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let locks = provider();
        let token = CancelToken::new();
        let handle = locks
            .acquire("res", Duration::from_secs(30), Some(Duration::ZERO), &token)
            .await
            .unwrap()
            .expect("lock should be free");
        assert!(locks.is_locked("res").await.unwrap());
        handle.release().await.unwrap();
        assert!(!locks.is_locked("res").await.unwrap());
    }

    #[tokio::test]
    async fn test_double_release_is_noop() {
        let locks = provider();
        let token = CancelToken::new();
        let handle = locks
            .acquire("res", Duration::from_secs(30), Some(Duration::ZERO), &token)
            .await
            .unwrap()
            .unwrap();
        handle.release().await.unwrap();
        handle.release().await.unwrap();
        assert!(handle.is_released());
    }

    #[tokio::test]
    async fn test_contended_acquire_returns_none_at_zero_wait() {
        let locks = provider();
        let token = CancelToken::new();
        let _held = locks
            .acquire("res", Duration::from_secs(30), Some(Duration::ZERO), &token)
            .await
            .unwrap()
            .unwrap();
        let second = locks
            .acquire("res", Duration::from_secs(30), Some(Duration::ZERO), &token)
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_stale_handle_cannot_release_successor() {
        let cache: Arc<dyn CacheClient> = Arc::new(InMemoryCacheClient::new());
        let bus: Arc<dyn MessageBus> = Arc::new(InProcessMessageBus::new());
        let locks = CacheLockProvider::new(cache.clone(), bus, Arc::new(SystemClock));
        let token = CancelToken::new();
        let first = locks
            .acquire("res", Duration::from_millis(50), Some(Duration::ZERO), &token)
            .await
            .unwrap()
            .unwrap();
        // Let the first lease lapse, then let a successor take the lock.
        tokio::time::sleep(Duration::from_millis(80)).await;
        let second = locks
            .acquire("res", Duration::from_secs(30), Some(Duration::ZERO), &token)
            .await
            .unwrap()
            .expect("expired lease should be acquirable");
        first.release().await.unwrap();
        // The successor's token is still in place.
        assert!(locks.is_locked("res").await.unwrap());
        second.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_renew_extends_lease() {
        let locks = provider();
        let token = CancelToken::new();
        let handle = locks
            .acquire("res", Duration::from_secs(5), Some(Duration::ZERO), &token)
            .await
            .unwrap()
            .unwrap();
        handle.renew(Some(Duration::from_secs(60))).await.unwrap();
        assert_eq!(handle.renewal_count(), 1);
        handle.release().await.unwrap();
        assert!(matches!(
            handle.renew(None).await,
            Err(crate::error::PlinthError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_wait_returns_none() {
        let locks = provider();
        let token = CancelToken::new();
        let _held = locks
            .acquire("res", Duration::from_secs(30), Some(Duration::ZERO), &token)
            .await
            .unwrap()
            .unwrap();
        let waiter_token = CancelToken::new();
        let canceller = waiter_token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let result = locks
            .acquire(
                "res",
                Duration::from_secs(30),
                Some(Duration::from_secs(10)),
                &waiter_token,
            )
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_throttling_admits_up_to_limit() {
        let cache: Arc<dyn CacheClient> = Arc::new(InMemoryCacheClient::new());
        let locks = ThrottlingLockProvider::new(
            cache,
            Arc::new(SystemClock),
            2,
            Duration::from_secs(3600),
        );
        let token = CancelToken::new();
        let first = locks
            .acquire("job", Duration::from_secs(1), Some(Duration::ZERO), &token)
            .await
            .unwrap();
        let second = locks
            .acquire("job", Duration::from_secs(1), Some(Duration::ZERO), &token)
            .await
            .unwrap();
        let third = locks
            .acquire("job", Duration::from_secs(1), Some(Duration::ZERO), &token)
            .await
            .unwrap();
        assert!(first.is_some());
        assert!(second.is_some());
        assert!(third.is_none());
        assert!(locks.is_locked("job").await.unwrap());
    }
}
