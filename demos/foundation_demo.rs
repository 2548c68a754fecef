//! End-to-end tour of the foundation components: one in-process
//! cache/bus pair shared by locks, a resilience policy, a metrics
//! buffer, and the job runner.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use plinth::cache::{CacheClient, InMemoryCacheClient, InMemoryCacheOptions, SizingMode};
use plinth::cancellation::CancelToken;
use plinth::jobs::{Job, JobOptions, JobRunner, JobRunnerOptions};
use plinth::lock::{CacheLockProvider, LockProvider};
use plinth::messaging::{InProcessMessageBus, MessageBus};
use plinth::metrics::BufferedMetricsClient;
use plinth::resilience::{Backoff, ResiliencePolicy};
use plinth::time::SystemClock;
use plinth::{PlinthError, PlinthResult, Value};

struct HeartbeatJob;

#[async_trait]
impl Job for HeartbeatJob {
    async fn run(&self, _cancellation: &CancelToken) -> PlinthResult<()> {
        println!("heartbeat job executed");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> PlinthResult<()> {
    let cache: Arc<dyn CacheClient> = Arc::new(InMemoryCacheClient::with_options(
        InMemoryCacheOptions::default()
            .with_max_bytes(64 * 1024)
            .with_sizing(SizingMode::Dynamic),
    ));
    let bus: Arc<dyn MessageBus> = Arc::new(InProcessMessageBus::new());
    let locks = Arc::new(CacheLockProvider::new(
        cache.clone(),
        bus.clone(),
        Arc::new(SystemClock),
    ));
    let token = CancelToken::new();

    // Cache round trip with a TTL.
    cache
        .set("greeting", Value::from("hello"), Some(Duration::from_secs(60)))
        .await?;
    println!("cached: {:?}", cache.get("greeting").await?);

    // Distributed lock over the shared cache and bus.
    if let Some(lock) = locks
        .acquire("demo", Duration::from_secs(30), Some(Duration::ZERO), &token)
        .await?
    {
        println!("holding lock {}", lock.lock_id());
        lock.release().await?;
    }

    // A guarded call through a retry policy.
    let policy = ResiliencePolicy::builder()
        .max_attempts(3)
        .backoff(Backoff::Constant(Duration::from_millis(50)))
        .build();
    let answer = policy
        .execute(&token, |_| async { Ok::<_, PlinthError>(42) })
        .await?;
    println!("resilient call returned {}", answer);

    // Buffered metrics aggregated into the same cache.
    let metrics = BufferedMetricsClient::new(cache.clone());
    metrics.counter("demo.runs");
    metrics.flush().await;

    // A manually triggered job.
    let runner = JobRunner::new(JobRunnerOptions::new(cache, bus, locks));
    runner.register(JobOptions::new(
        "heartbeat",
        "* * * * *",
        Arc::new(|| Arc::new(HeartbeatJob) as Arc<dyn Job>),
    ));
    runner.run_now("heartbeat").await?;
    runner.stop().await;
    Ok(())
}
