//! Composable resilience policies: retry + circuit breaker + timeout.
//!
//! Policies are built once and immutable afterwards. The happy path
//! (first attempt succeeds, breaker closed, no timeout hit) runs
//! through plain generics with no boxing, so it allocates nothing after
//! warm-up.

mod circuit_breaker;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, trace};

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerOptions, CircuitState};

use crate::cancellation::CancelToken;
use crate::error::{PlinthError, PlinthResult};
use crate::time::{SystemClock, TimeSource};

/// Delay progression between retry attempts.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// No delay between attempts.
    None,
    /// The same delay before every retry.
    Constant(Duration),
    /// `delay × attempt` before retry number `attempt`.
    Linear(Duration),
    /// Multiplicative growth from `initial`, capped at `max`.
    Exponential {
        /// Delay before the first retry
        initial: Duration,
        /// Upper bound on any delay
        max: Duration,
        /// Growth factor per attempt
        multiplier: f64,
    },
}

impl Backoff {
    fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Constant(delay) => *delay,
            Backoff::Linear(delay) => delay.saturating_mul(attempt),
            Backoff::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let factor = multiplier.powi(attempt.saturating_sub(1) as i32);
                let millis = (initial.as_millis() as f64 * factor) as u64;
                Duration::from_millis(millis).min(*max)
            }
        }
    }
}

/// Predicate gating retries: `(attempt, error) -> retry?`.
pub type RetryPredicate = Arc<dyn Fn(u32, &PlinthError) -> bool + Send + Sync>;

/// Builder for [`ResiliencePolicy`].
pub struct ResiliencePolicyBuilder {
    max_attempts: u32,
    backoff: Backoff,
    jitter: f64,
    timeout: Option<Duration>,
    breaker: Option<Arc<CircuitBreaker>>,
    should_retry: Option<RetryPredicate>,
    time: Arc<dyn TimeSource>,
}

impl ResiliencePolicyBuilder {
    /// Start a builder with defaults: 3 attempts, exponential backoff
    /// from 100 ms, no timeout, no breaker.
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                initial: Duration::from_millis(100),
                max: Duration::from_secs(10),
                multiplier: 2.0,
            },
            jitter: 0.0,
            timeout: None,
            breaker: None,
            should_retry: None,
            time: Arc::new(SystemClock),
        }
    }

    /// Total attempts including the first (minimum 1).
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Delay progression between attempts.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Randomize each delay by ±`factor` (0.0–1.0).
    pub fn jitter(mut self, factor: f64) -> Self {
        self.jitter = factor.clamp(0.0, 1.0);
        self
    }

    /// Per-attempt wall-clock bound.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Share a circuit breaker with this policy.
    pub fn circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Gate retries with a predicate. Errors the predicate rejects are
    /// surfaced immediately (permanently unhandled).
    pub fn should_retry(
        mut self,
        predicate: impl Fn(u32, &PlinthError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    /// Substitute the time source (delays and timeouts follow it).
    pub fn time(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    /// Finalize the policy.
    pub fn build(self) -> ResiliencePolicy {
        ResiliencePolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            timeout: self.timeout,
            breaker: self.breaker,
            should_retry: self.should_retry,
            time: self.time,
        }
    }
}

impl Default for ResiliencePolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Execution wrapper combining retry, per-attempt timeout, and an
/// optional shared circuit breaker.
pub struct ResiliencePolicy {
    max_attempts: u32,
    backoff: Backoff,
    jitter: f64,
    timeout: Option<Duration>,
    breaker: Option<Arc<CircuitBreaker>>,
    should_retry: Option<RetryPredicate>,
    time: Arc<dyn TimeSource>,
}

impl ResiliencePolicy {
    /// Builder entry point.
    pub fn builder() -> ResiliencePolicyBuilder {
        ResiliencePolicyBuilder::new()
    }

    /// A policy that runs the operation once, unguarded.
    pub fn noop() -> Self {
        ResiliencePolicyBuilder::new()
            .max_attempts(1)
            .backoff(Backoff::None)
            .build()
    }

    /// Execute `op` under this policy. The operation receives a child
    /// cancellation token so in-flight attempts observe cancellation.
    pub async fn execute<T, F, Fut>(
        &self,
        cancellation: &CancelToken,
        mut op: F,
    ) -> PlinthResult<T>
    where
        F: FnMut(CancelToken) -> Fut,
        Fut: Future<Output = PlinthResult<T>>,
    {
        self.execute_with_state(cancellation, (), move |(), token| op(token))
            .await
    }

    /// Like [`ResiliencePolicy::execute`], threading `state` through to
    /// each attempt so callers in tight loops need not capture it in a
    /// fresh closure per call.
    pub async fn execute_with_state<S, T, F, Fut>(
        &self,
        cancellation: &CancelToken,
        state: S,
        mut op: F,
    ) -> PlinthResult<T>
    where
        S: Clone,
        F: FnMut(S, CancelToken) -> Fut,
        Fut: Future<Output = PlinthResult<T>>,
    {
        let mut attempt: u32 = 1;
        loop {
            cancellation.check()?;
            if let Some(breaker) = &self.breaker {
                breaker.allow()?;
            }

            let attempt_token = cancellation.child();
            let result = self
                .run_attempt(cancellation, op(state.clone(), attempt_token.clone()))
                .await;
            // A timed-out attempt must stop running in the background.
            attempt_token.cancel();

            match result {
                Ok(value) => {
                    if let Some(breaker) = &self.breaker {
                        breaker.record_success();
                    }
                    return Ok(value);
                }
                Err(PlinthError::Cancelled) => return Err(PlinthError::Cancelled),
                Err(error) => {
                    if let Some(breaker) = &self.breaker {
                        breaker.record_failure();
                    }
                    if attempt >= self.max_attempts || !self.retryable(attempt, &error) {
                        debug!(attempt, error = %error, "giving up");
                        return Err(error);
                    }
                    let delay = self.jittered(self.backoff.delay_for(attempt));
                    trace!(attempt, ?delay, error = %error, "retrying");
                    if !delay.is_zero() {
                        self.time.sleep(delay, cancellation).await?;
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn run_attempt<T, Fut>(&self, cancellation: &CancelToken, fut: Fut) -> PlinthResult<T>
    where
        Fut: Future<Output = PlinthResult<T>>,
    {
        match self.timeout {
            None => {
                tokio::select! {
                    result = fut => result,
                    _ = cancellation.cancelled() => Err(PlinthError::Cancelled),
                }
            }
            Some(timeout) => {
                tokio::select! {
                    result = fut => result,
                    slept = self.time.sleep(timeout, cancellation) => match slept {
                        Ok(()) => Err(PlinthError::Timeout(timeout)),
                        Err(err) => Err(err),
                    },
                }
            }
        }
    }

    fn retryable(&self, attempt: u32, error: &PlinthError) -> bool {
        // These classes are never retried: cancellation is cooperative,
        // an open breaker will not close mid-loop, and an oversized
        // value stays oversized.
        if matches!(
            error,
            PlinthError::Cancelled | PlinthError::CircuitOpen | PlinthError::TooLarge { .. }
        ) {
            return false;
        }
        match &self.should_retry {
            Some(predicate) => predicate(attempt, error),
            None => true,
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
    }
}

/// Immutable registry of named policies with a default fallback.
pub struct PolicyRegistry {
    default: Arc<ResiliencePolicy>,
    named: HashMap<String, Arc<ResiliencePolicy>>,
}

impl PolicyRegistry {
    /// Create a registry with the given default policy.
    pub fn new(default: ResiliencePolicy) -> Self {
        Self {
            default: Arc::new(default),
            named: HashMap::new(),
        }
    }

    /// Register a named policy (construction-time only).
    pub fn with_policy(mut self, name: impl Into<String>, policy: ResiliencePolicy) -> Self {
        self.named.insert(name.into(), Arc::new(policy));
        self
    }

    /// The default policy.
    pub fn get_default(&self) -> Arc<ResiliencePolicy> {
        self.default.clone()
    }

    /// The named policy, or the default when the name is unknown.
    pub fn get(&self, name: &str) -> Arc<ResiliencePolicy> {
        self.named
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}
