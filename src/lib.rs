//! # Plinth: a pluggable foundation for distributed services
//!
//! A common set of building blocks for services that share state across
//! instances:
//!
//! - `cache`: bounded, size-aware in-memory cache with TTL expiration
//!   and cost/benefit eviction
//! - `messaging`: in-process typed pub/sub with delayed delivery
//! - `lock`: cache-backed distributed locks with bus-driven wakeups
//! - `resilience`: retry + circuit breaker + timeout policies
//! - `jobs`: cron-driven job runner with cross-instance arbitration
//! - `metrics`: buffered counter/gauge/timer aggregation
//!
//! Everything is written against pluggable capabilities (cache client,
//! message bus, time source, serializer) so backing stores such as
//! Redis or cloud buses can be swapped in without touching callers. The
//! in-process implementations here are complete and production-shaped;
//! out-of-process adapters live out of tree.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Capabilities and glue
pub mod cancellation;
pub mod error;
pub mod serializer;
pub mod time;
pub mod value;

// Value plumbing used by the cache
pub mod deep_clone;
pub mod size;

// Components
pub mod cache;
pub mod jobs;
pub mod lock;
pub mod messaging;
pub mod metrics;
pub mod resilience;

pub use cache::{CacheClient, InMemoryCacheClient, InMemoryCacheOptions, SizingMode};
pub use cancellation::{CancelScope, CancelToken};
pub use error::{PlinthError, PlinthResult};
pub use jobs::{Job, JobFactory, JobOptions, JobRunner, JobRunnerOptions, StartupGate};
pub use lock::{CacheLockProvider, LockHandle, LockProvider, ThrottlingLockProvider};
pub use messaging::{InProcessMessageBus, MessageBus, MessageBusExt, Subscription};
pub use metrics::BufferedMetricsClient;
pub use resilience::{CircuitBreaker, PolicyRegistry, ResiliencePolicy};
pub use time::{SystemClock, TimeSource, VirtualClock};
pub use value::Value;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
