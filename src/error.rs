//! Error types shared by every component in the crate.

use std::time::Duration;
use thiserror::Error;

/// Result type for all fallible operations in this crate.
pub type PlinthResult<T> = Result<T, PlinthError>;

/// Error taxonomy for the foundation components.
///
/// Absence of a cache key on `get` is a miss, not an error; only
/// operations that require presence report [`PlinthError::NotFound`].
#[derive(Error, Debug)]
pub enum PlinthError {
    /// A key required by the operation does not exist
    #[error("key not found: {0}")]
    NotFound(String),

    /// A single value exceeds the cache memory bound
    #[error("value of {size} bytes exceeds cache limit of {limit} bytes")]
    TooLarge {
        /// Computed size of the rejected value
        size: u64,
        /// Configured memory bound
        limit: u64,
    },

    /// A resilience policy short-circuited the call
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// A per-attempt time budget was exceeded
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Cooperative cancellation was observed
    #[error("operation was cancelled")]
    Cancelled,

    /// A lock could not be acquired before its max wait elapsed
    #[error("lock contention: {0}")]
    Contention(String),

    /// A cron expression or serialized payload is malformed
    #[error("parse error: {0}")]
    Parse(String),

    /// The component was disposed before the call
    #[error("component is closed")]
    Closed,

    /// A cache or bus backing store failed
    #[error("transport error: {0}")]
    Transport(String),

    /// A published message exceeds the configured maximum size
    #[error("message of {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge {
        /// Serialized size of the rejected message
        size: usize,
        /// Configured maximum
        limit: usize,
    },

    /// The operation received a value it cannot act on
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Invariant violation inside the crate
    #[error("internal error: {0}")]
    Internal(String),
}

impl PlinthError {
    /// Whether the error class is transient and worth retrying by default.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PlinthError::Transport(_) | PlinthError::Timeout(_) | PlinthError::Contention(_)
        )
    }
}
