//! Buffered metrics client with time-bucket aggregation.
//!
//! Samples are enqueued lock-free and flushed on a short cadence.
//! Each flush groups samples by `(name, bucket_start, bucket_size)` and
//! writes aggregates through a [`CacheClient`] store, so any process
//! sharing the store can answer cluster-wide queries. Store failures
//! are retried and then logged; they are never surfaced to samplers.
//!
//! Key layout: `m:{c|g|t}:{name}:{bucket_minutes}:{yy-MM-dd-hh-mm}`
//! with `:cnt`, `:tot`, `:min`, `:max`, `:last` suffixes for gauge and
//! timer aggregates. Counters are a single increment per bucket.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::cache::CacheClient;
use crate::cancellation::CancelToken;
use crate::error::{PlinthError, PlinthResult};
use crate::resilience::{Backoff, ResiliencePolicy};
use crate::time::{SystemClock, TimeSource};

/// Kind of a metric sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MetricKind {
    /// Monotonic count of events
    Counter,
    /// Point-in-time reading
    Gauge,
    /// Duration measurement
    Timing,
}

impl MetricKind {
    fn key_tag(&self) -> &'static str {
        match self {
            MetricKind::Counter => "c",
            MetricKind::Gauge => "g",
            MetricKind::Timing => "t",
        }
    }
}

/// One buffered sample.
#[derive(Debug, Clone)]
pub struct MetricSample {
    /// When the sample was enqueued
    pub enqueued_at: DateTime<Utc>,
    /// Metric name
    pub name: String,
    /// Sample kind
    pub kind: MetricKind,
    /// Numeric value (count, reading, or milliseconds)
    pub value: f64,
}

/// An aggregation bucket: samples are grouped by `size`-wide windows
/// and the written aggregates carry `ttl`.
#[derive(Debug, Clone, Copy)]
pub struct MetricBucket {
    /// Window width
    pub size: Duration,
    /// TTL on aggregate entries in the store
    pub ttl: Duration,
}

/// Options for [`BufferedMetricsClient`].
#[derive(Clone)]
pub struct MetricsOptions {
    /// Aggregation buckets; defaults to 5-minute and 1-hour windows.
    pub buckets: Vec<MetricBucket>,
    /// Flush cadence; zero disables the background flusher.
    pub flush_interval: Duration,
    /// Time source for bucket alignment.
    pub time: Arc<dyn TimeSource>,
}

impl Default for MetricsOptions {
    fn default() -> Self {
        Self {
            buckets: vec![
                MetricBucket {
                    size: Duration::from_secs(5 * 60),
                    ttl: Duration::from_secs(3 * 60 * 60),
                },
                MetricBucket {
                    size: Duration::from_secs(60 * 60),
                    ttl: Duration::from_secs(7 * 24 * 60 * 60),
                },
            ],
            flush_interval: Duration::from_secs(2),
            time: Arc::new(SystemClock),
        }
    }
}

/// Align a timestamp to the start of its bucket.
fn align(timestamp: DateTime<Utc>, size: Duration) -> DateTime<Utc> {
    let size_secs = size.as_secs().max(1) as i64;
    let aligned = timestamp.timestamp().div_euclid(size_secs) * size_secs;
    DateTime::from_timestamp(aligned, 0).unwrap_or(timestamp)
}

fn bucket_stamp(start: DateTime<Utc>) -> String {
    start.format("%y-%m-%d-%H-%M").to_string()
}

#[derive(Debug, Default)]
struct Aggregate {
    count: u64,
    total: f64,
    min: f64,
    max: f64,
    last: f64,
}

impl Aggregate {
    fn fold(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.total += value;
        self.last = value;
    }
}

#[derive(Default)]
struct CounterTracker {
    total: std::sync::atomic::AtomicU64,
    notify: Notify,
}

struct MetricsInner {
    store: Arc<dyn CacheClient>,
    queue: SegQueue<MetricSample>,
    flush_gate: tokio::sync::Mutex<()>,
    counters: DashMap<String, Arc<CounterTracker>>,
    retry: ResiliencePolicy,
    opts: MetricsOptions,
}

/// Buffered, bucket-aggregating metrics client.
pub struct BufferedMetricsClient {
    inner: Arc<MetricsInner>,
    flusher: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl BufferedMetricsClient {
    /// Create a client writing aggregates through `store`.
    pub fn new(store: Arc<dyn CacheClient>) -> Self {
        Self::with_options(store, MetricsOptions::default())
    }

    /// Create a client with explicit options.
    pub fn with_options(store: Arc<dyn CacheClient>, opts: MetricsOptions) -> Self {
        let retry = ResiliencePolicy::builder()
            .max_attempts(3)
            .backoff(Backoff::Exponential {
                initial: Duration::from_millis(50),
                max: Duration::from_secs(1),
                multiplier: 2.0,
            })
            .should_retry(|_, error| error.is_transient())
            .build();
        let inner = Arc::new(MetricsInner {
            store,
            queue: SegQueue::new(),
            flush_gate: tokio::sync::Mutex::new(()),
            counters: DashMap::new(),
            retry,
            opts,
        });
        let flusher = spawn_flusher(&inner);
        Self {
            inner,
            flusher: parking_lot::Mutex::new(flusher),
        }
    }

    /// Record one event.
    pub fn counter(&self, name: &str) {
        self.counter_by(name, 1);
    }

    /// Record `count` events.
    pub fn counter_by(&self, name: &str, count: u64) {
        self.enqueue(name, MetricKind::Counter, count as f64);
        let tracker = self
            .inner
            .counters
            .entry(name.to_string())
            .or_default()
            .clone();
        tracker
            .total
            .fetch_add(count, std::sync::atomic::Ordering::SeqCst);
        tracker.notify.notify_waiters();
    }

    /// Record a gauge reading.
    pub fn gauge(&self, name: &str, value: f64) {
        self.enqueue(name, MetricKind::Gauge, value);
    }

    /// Record a duration, stored in milliseconds.
    pub fn timer(&self, name: &str, duration: Duration) {
        self.enqueue(name, MetricKind::Timing, duration.as_secs_f64() * 1000.0);
    }

    fn enqueue(&self, name: &str, kind: MetricKind, value: f64) {
        self.inner.queue.push(MetricSample {
            enqueued_at: self.inner.opts.time.utc_now(),
            name: name.to_string(),
            kind,
            value,
        });
    }

    /// Flush buffered samples now. Overlapping flushes are serialized:
    /// a second flush starting while one is in progress returns
    /// immediately.
    pub async fn flush(&self) {
        flush_inner(&self.inner).await;
    }

    /// Number of samples waiting to be flushed.
    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }

    /// Wait until `count` more counter events for `name` have been
    /// recorded (counted from this call), or time out.
    pub async fn wait_for_counter(
        &self,
        name: &str,
        count: u64,
        timeout: Duration,
    ) -> PlinthResult<()> {
        if count == 0 {
            return Ok(());
        }
        let tracker = self
            .inner
            .counters
            .entry(name.to_string())
            .or_default()
            .clone();
        let target = tracker.total.load(std::sync::atomic::Ordering::SeqCst) + count;
        let token = CancelToken::new();
        let deadline = self.inner.opts.time.utc_now()
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::seconds(30));
        loop {
            // Created before the counter check so an increment between
            // the check and the await is not missed.
            let notified = tracker.notify.notified();
            if tracker.total.load(std::sync::atomic::Ordering::SeqCst) >= target {
                return Ok(());
            }
            let now = self.inner.opts.time.utc_now();
            let remaining = match (deadline - now).to_std() {
                Ok(r) if !r.is_zero() => r,
                _ => return Err(PlinthError::Timeout(timeout)),
            };
            tokio::select! {
                _ = notified => {}
                _ = self.inner.opts.time.sleep(remaining, &token) => {
                    if tracker.total.load(std::sync::atomic::Ordering::SeqCst) >= target {
                        return Ok(());
                    }
                    return Err(PlinthError::Timeout(timeout));
                }
            }
        }
    }
}

impl Drop for BufferedMetricsClient {
    fn drop(&mut self) {
        if let Some(handle) = self.flusher.lock().take() {
            handle.abort();
        }
    }
}

fn spawn_flusher(inner: &Arc<MetricsInner>) -> Option<JoinHandle<()>> {
    let interval = inner.opts.flush_interval;
    if interval.is_zero() {
        return None;
    }
    let runtime = tokio::runtime::Handle::try_current().ok()?;
    let weak = Arc::downgrade(inner);
    Some(runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else { break };
            flush_inner(&inner).await;
        }
    }))
}

async fn flush_inner(inner: &Arc<MetricsInner>) {
    // A flush already in progress owns the gate; skip instead of queueing.
    let Ok(_guard) = inner.flush_gate.try_lock() else {
        trace!("flush already in progress");
        return;
    };

    let mut samples = Vec::new();
    while let Some(sample) = inner.queue.pop() {
        samples.push(sample);
    }
    if samples.is_empty() {
        return;
    }
    trace!(samples = samples.len(), "flushing metric samples");

    // BTreeMap keeps the write order deterministic.
    let mut groups: BTreeMap<(MetricKind, String, u64, DateTime<Utc>), (Aggregate, Duration)> =
        BTreeMap::new();
    for sample in &samples {
        for bucket in &inner.opts.buckets {
            let start = align(sample.enqueued_at, bucket.size);
            let minutes = bucket.size.as_secs() / 60;
            let key = (sample.kind, sample.name.clone(), minutes, start);
            let entry = groups.entry(key).or_insert((Aggregate::default(), bucket.ttl));
            entry.0.fold(sample.value);
        }
    }

    for ((kind, name, minutes, start), (aggregate, ttl)) in groups {
        let base = format!(
            "m:{}:{}:{}:{}",
            kind.key_tag(),
            name,
            minutes,
            bucket_stamp(start)
        );
        if let Err(error) = write_aggregate(inner, kind, &base, &aggregate, ttl).await {
            warn!(key = %base, %error, "failed to store metric aggregate");
        }
    }
}

async fn write_aggregate(
    inner: &Arc<MetricsInner>,
    kind: MetricKind,
    base: &str,
    aggregate: &Aggregate,
    ttl: Duration,
) -> PlinthResult<()> {
    let store = &inner.store;
    let token = CancelToken::new();
    match kind {
        MetricKind::Counter => {
            inner
                .retry
                .execute(&token, |_| {
                    store.increment(base, aggregate.total, Some(ttl))
                })
                .await?;
        }
        MetricKind::Gauge => {
            inner
                .retry
                .execute(&token, |_| async {
                    store
                        .increment(&format!("{}:cnt", base), aggregate.count as f64, Some(ttl))
                        .await?;
                    store
                        .increment(&format!("{}:tot", base), aggregate.total, Some(ttl))
                        .await?;
                    store
                        .set(
                            &format!("{}:last", base),
                            crate::value::Value::Float(aggregate.last),
                            Some(ttl),
                        )
                        .await?;
                    store
                        .set_if_lower(&format!("{}:min", base), aggregate.min, Some(ttl))
                        .await?;
                    store
                        .set_if_higher(&format!("{}:max", base), aggregate.max, Some(ttl))
                        .await?;
                    Ok(())
                })
                .await?;
        }
        MetricKind::Timing => {
            inner
                .retry
                .execute(&token, |_| async {
                    store
                        .increment(&format!("{}:cnt", base), aggregate.count as f64, Some(ttl))
                        .await?;
                    store
                        .increment(&format!("{}:tot", base), aggregate.total, Some(ttl))
                        .await?;
                    store
                        .set_if_lower(&format!("{}:min", base), aggregate.min, Some(ttl))
                        .await?;
                    store
                        .set_if_higher(&format!("{}:max", base), aggregate.max, Some(ttl))
                        .await?;
                    Ok(())
                })
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheClient, InMemoryCacheClient};
    use crate::time::VirtualClock;
    use chrono::TimeZone;

    fn client() -> (BufferedMetricsClient, Arc<dyn CacheClient>, Arc<VirtualClock>) {
        let clock = Arc::new(VirtualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 2, 0).unwrap(),
        ));
        let store: Arc<dyn CacheClient> = Arc::new(InMemoryCacheClient::new());
        let opts = MetricsOptions {
            flush_interval: Duration::ZERO,
            time: clock.clone(),
            ..Default::default()
        };
        (
            BufferedMetricsClient::with_options(store.clone(), opts),
            store,
            clock,
        )
    }

    #[test]
    fn test_align_to_bucket_start() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 10, 7, 42).unwrap();
        assert_eq!(
            align(at, Duration::from_secs(300)),
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 5, 0).unwrap()
        );
        assert_eq!(
            align(at, Duration::from_secs(3600)),
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_counter_aggregates_to_buckets() {
        let (metrics, store, _) = client();
        metrics.counter("requests");
        metrics.counter_by("requests", 4);
        metrics.flush().await;
        assert_eq!(metrics.pending(), 0);

        // 10:02 falls in the 10:00 five-minute and hour buckets.
        let five = store.get("m:c:requests:5:24-03-01-10-00").await.unwrap();
        assert_eq!(five.and_then(|v| v.as_f64()), Some(5.0));
        let hour = store.get("m:c:requests:60:24-03-01-10-00").await.unwrap();
        assert_eq!(hour.and_then(|v| v.as_f64()), Some(5.0));
    }

    #[tokio::test]
    async fn test_gauge_aggregates() {
        let (metrics, store, _) = client();
        metrics.gauge("depth", 3.0);
        metrics.gauge("depth", 9.0);
        metrics.gauge("depth", 6.0);
        metrics.flush().await;

        let base = "m:g:depth:5:24-03-01-10-00";
        let get = |suffix: &str| {
            let store = store.clone();
            let key = format!("{}:{}", base, suffix);
            async move { store.get(&key).await.unwrap().and_then(|v| v.as_f64()) }
        };
        assert_eq!(get("cnt").await, Some(3.0));
        assert_eq!(get("tot").await, Some(18.0));
        assert_eq!(get("min").await, Some(3.0));
        assert_eq!(get("max").await, Some(9.0));
        assert_eq!(get("last").await, Some(6.0));
    }

    #[tokio::test]
    async fn test_timer_aggregates() {
        let (metrics, store, _) = client();
        metrics.timer("latency", Duration::from_millis(120));
        metrics.timer("latency", Duration::from_millis(80));
        metrics.flush().await;

        let base = "m:t:latency:5:24-03-01-10-00";
        let cnt = store.get(&format!("{}:cnt", base)).await.unwrap();
        assert_eq!(cnt.and_then(|v| v.as_f64()), Some(2.0));
        let min = store.get(&format!("{}:min", base)).await.unwrap();
        assert_eq!(min.and_then(|v| v.as_f64()), Some(80.0));
        let max = store.get(&format!("{}:max", base)).await.unwrap();
        assert_eq!(max.and_then(|v| v.as_f64()), Some(120.0));
    }

    #[tokio::test]
    async fn test_flushes_accumulate_in_same_bucket() {
        let (metrics, store, clock) = client();
        metrics.counter("ticks");
        metrics.flush().await;
        clock.advance(Duration::from_secs(30));
        metrics.counter("ticks");
        metrics.flush().await;
        let value = store.get("m:c:ticks:5:24-03-01-10-00").await.unwrap();
        assert_eq!(value.and_then(|v| v.as_f64()), Some(2.0));
    }

    #[tokio::test]
    async fn test_wait_for_counter() {
        let store: Arc<dyn CacheClient> = Arc::new(InMemoryCacheClient::new());
        let metrics = Arc::new(BufferedMetricsClient::with_options(
            store,
            MetricsOptions {
                flush_interval: Duration::ZERO,
                ..Default::default()
            },
        ));
        let signaller = metrics.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            signaller.counter_by("done", 2);
        });
        metrics
            .wait_for_counter("done", 2, Duration::from_secs(2))
            .await
            .unwrap();
        let timed_out = metrics
            .wait_for_counter("done", 1, Duration::from_millis(20))
            .await;
        assert!(matches!(timed_out, Err(PlinthError::Timeout(_))));
    }
}
