//! Time source capability.
//!
//! Components never read the wall clock directly; they go through a
//! [`TimeSource`] so tests can substitute virtual time.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::cancellation::CancelToken;
use crate::error::{PlinthError, PlinthResult};

/// Provides the current instant and cancellable sleeps.
#[async_trait]
pub trait TimeSource: Send + Sync {
    /// The current instant in UTC.
    fn utc_now(&self) -> DateTime<Utc>;

    /// Sleep for `duration` or until `cancellation` fires, whichever
    /// comes first. Cancellation yields [`PlinthError::Cancelled`].
    async fn sleep(&self, duration: Duration, cancellation: &CancelToken) -> PlinthResult<()>;
}

/// Wall-clock time source backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl TimeSource for SystemClock {
    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration, cancellation: &CancelToken) -> PlinthResult<()> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = cancellation.cancelled() => Err(PlinthError::Cancelled),
        }
    }
}

/// Virtual time source for deterministic tests.
///
/// `sleep` advances the clock by the requested duration instead of
/// waiting, then yields once so other tasks can observe the new time.
/// Concurrent sleepers each advance the clock independently; tests that
/// need a strict ordering should drive a single task at a time.
pub struct VirtualClock {
    now: Mutex<DateTime<Utc>>,
}

impl VirtualClock {
    /// Create a virtual clock starting at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Advance the clock without sleeping.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
    }

    /// Move the clock to an absolute instant.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

#[async_trait]
impl TimeSource for VirtualClock {
    fn utc_now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration, cancellation: &CancelToken) -> PlinthResult<()> {
        cancellation.check()?;
        self.advance(duration);
        tokio::task::yield_now().await;
        cancellation.check()?;
        Ok(())
    }
}
