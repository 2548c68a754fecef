//! Circuit breaker with a rolling sample window.
//!
//! State machine: `Closed → Open` when enough recent calls fail,
//! `Open → HalfOpen` after the break duration, `HalfOpen → Closed` on a
//! successful probe, `HalfOpen → Open` on any failure. Transitions are
//! atomic under a single mutex; a breaker is shareable across policies.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{PlinthError, PlinthResult};
use crate::time::{SystemClock, TimeSource};

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing fast
    Open,
    /// Cooldown elapsed; a single probe is allowed through
    HalfOpen,
}

/// Options for [`CircuitBreaker`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerOptions {
    /// Samples required in the window before the breaker evaluates.
    pub minimum_calls: usize,
    /// Failure ratio over the window that trips the breaker.
    pub failure_threshold: f64,
    /// Consecutive failures that trip a warmed-up breaker regardless of
    /// the overall ratio.
    pub consecutive_failure_trip: u32,
    /// How long the breaker stays open before probing.
    pub break_duration: Duration,
    /// Rolling duration of the sample window.
    pub window_duration: Duration,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            minimum_calls: 10,
            failure_threshold: 0.5,
            consecutive_failure_trip: 2,
            break_duration: Duration::from_secs(30),
            window_duration: Duration::from_secs(60),
        }
    }
}

struct BreakerState {
    state: CircuitState,
    opened_at: Option<DateTime<Utc>>,
    window: VecDeque<(DateTime<Utc>, bool)>,
    consecutive_failures: u32,
    probe_in_flight: bool,
}

/// Shared pass/fail tracker that fails fast while open.
pub struct CircuitBreaker {
    opts: CircuitBreakerOptions,
    time: Arc<dyn TimeSource>,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a breaker on the system clock.
    pub fn new(opts: CircuitBreakerOptions) -> Self {
        Self::with_time(opts, Arc::new(SystemClock))
    }

    /// Create a breaker on an explicit time source.
    pub fn with_time(opts: CircuitBreakerOptions, time: Arc<dyn TimeSource>) -> Self {
        Self {
            opts,
            time,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                opened_at: None,
                window: VecDeque::new(),
                consecutive_failures: 0,
                probe_in_flight: false,
            }),
        }
    }

    /// Current position, after applying any due time-based transition.
    pub fn state(&self) -> CircuitState {
        let now = self.time.utc_now();
        let mut state = self.state.lock();
        self.transition_if_due(&mut state, now);
        state.state
    }

    /// Gate a call: `Ok` admits it, `Err(CircuitOpen)` fails fast.
    pub fn allow(&self) -> PlinthResult<()> {
        let now = self.time.utc_now();
        let mut state = self.state.lock();
        self.transition_if_due(&mut state, now);
        match state.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(PlinthError::CircuitOpen),
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    Err(PlinthError::CircuitOpen)
                } else {
                    state.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let now = self.time.utc_now();
        let mut state = self.state.lock();
        self.prune(&mut state, now);
        state.window.push_back((now, true));
        state.consecutive_failures = 0;
        if state.state == CircuitState::HalfOpen {
            info!("circuit breaker closing after successful probe");
            state.state = CircuitState::Closed;
            state.opened_at = None;
            state.probe_in_flight = false;
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let now = self.time.utc_now();
        let mut state = self.state.lock();
        self.prune(&mut state, now);
        state.window.push_back((now, false));
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        match state.state {
            CircuitState::HalfOpen => {
                warn!("circuit breaker reopening after failed probe");
                self.open(&mut state, now);
            }
            CircuitState::Closed => {
                if self.should_trip(&state) {
                    warn!(
                        samples = state.window.len(),
                        consecutive = state.consecutive_failures,
                        "circuit breaker opening"
                    );
                    self.open(&mut state, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn open(&self, state: &mut BreakerState, now: DateTime<Utc>) {
        state.state = CircuitState::Open;
        state.opened_at = Some(now);
        state.probe_in_flight = false;
    }

    fn transition_if_due(&self, state: &mut BreakerState, now: DateTime<Utc>) {
        if state.state != CircuitState::Open {
            return;
        }
        let due = state
            .opened_at
            .and_then(|at| chrono::Duration::from_std(self.opts.break_duration).ok().map(|d| at + d))
            .map(|until| now >= until)
            .unwrap_or(true);
        if due {
            info!("circuit breaker entering half-open");
            state.state = CircuitState::HalfOpen;
            state.probe_in_flight = false;
        }
    }

    fn prune(&self, state: &mut BreakerState, now: DateTime<Utc>) {
        let horizon = chrono::Duration::from_std(self.opts.window_duration)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        while let Some((at, _)) = state.window.front() {
            if now - *at > horizon {
                state.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn should_trip(&self, state: &BreakerState) -> bool {
        if state.window.len() < self.opts.minimum_calls {
            return false;
        }
        if state.consecutive_failures >= self.opts.consecutive_failure_trip {
            return true;
        }
        let failures = state.window.iter().filter(|(_, ok)| !ok).count();
        failures as f64 / state.window.len() as f64 >= self.opts.failure_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::VirtualClock;
    use chrono::TimeZone;

    fn breaker(opts: CircuitBreakerOptions) -> (CircuitBreaker, Arc<VirtualClock>) {
        let clock = Arc::new(VirtualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
        ));
        (CircuitBreaker::with_time(opts, clock.clone()), clock)
    }

    #[test]
    fn test_stays_closed_under_minimum_calls() {
        let (breaker, _) = breaker(CircuitBreakerOptions::default());
        for _ in 0..5 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_trips_on_consecutive_failures_when_warm() {
        let (breaker, _) = breaker(CircuitBreakerOptions {
            failure_threshold: 1.0,
            ..Default::default()
        });
        for _ in 0..10 {
            breaker.record_success();
        }
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(breaker.allow(), Err(PlinthError::CircuitOpen)));
    }

    #[test]
    fn test_trips_on_failure_ratio() {
        let (breaker, _) = breaker(CircuitBreakerOptions {
            failure_threshold: 0.5,
            consecutive_failure_trip: u32::MAX,
            ..Default::default()
        });
        for _ in 0..5 {
            breaker.record_success();
        }
        for _ in 0..4 {
            breaker.record_failure();
            breaker.record_success();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        // 13 samples, 5th failure pushes the ratio over one half only
        // after more failures accumulate.
        for _ in 0..9 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_probe_cycle() {
        let (breaker, clock) = breaker(CircuitBreakerOptions {
            failure_threshold: 1.0,
            break_duration: Duration::from_secs(5),
            ..Default::default()
        });
        for _ in 0..10 {
            breaker.record_success();
        }
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(6));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // Only one probe is admitted.
        assert!(breaker.allow().is_ok());
        assert!(matches!(breaker.allow(), Err(PlinthError::CircuitOpen)));
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow().is_ok());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (breaker, clock) = breaker(CircuitBreakerOptions {
            failure_threshold: 1.0,
            break_duration: Duration::from_secs(5),
            ..Default::default()
        });
        for _ in 0..10 {
            breaker.record_success();
        }
        breaker.record_failure();
        breaker.record_failure();
        clock.advance(Duration::from_secs(6));
        assert!(breaker.allow().is_ok());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
