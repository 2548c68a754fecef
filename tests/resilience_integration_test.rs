//! Circuit breaker trip and recovery through the policy surface.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use plinth::cancellation::CancelToken;
use plinth::resilience::{
    Backoff, CircuitBreaker, CircuitBreakerOptions, CircuitState, ResiliencePolicy,
};
use plinth::time::VirtualClock;
use plinth::{PlinthError, PlinthResult};

#[tokio::test]
async fn breaker_trips_fails_fast_and_recovers() {
    let clock = Arc::new(VirtualClock::new(
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
    ));
    let breaker = Arc::new(CircuitBreaker::with_time(
        CircuitBreakerOptions {
            minimum_calls: 10,
            failure_threshold: 1.0,
            consecutive_failure_trip: 2,
            break_duration: Duration::from_secs(5),
            window_duration: Duration::from_secs(300),
        },
        clock.clone(),
    ));
    let policy = ResiliencePolicy::builder()
        .max_attempts(1)
        .backoff(Backoff::None)
        .circuit_breaker(breaker.clone())
        .time(clock.clone())
        .build();
    let token = CancelToken::new();

    // Ten successful calls leave the breaker closed.
    for _ in 0..10 {
        policy
            .execute(&token, |_| async { Ok::<_, PlinthError>(()) })
            .await
            .unwrap();
    }
    assert_eq!(breaker.state(), CircuitState::Closed);

    // Two failing calls trip it.
    for _ in 0..2 {
        let _: PlinthResult<()> = policy
            .execute(&token, |_| async {
                Err(PlinthError::Transport("dependency down".to_string()))
            })
            .await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // While open, calls fail fast without invoking the operation.
    let mut invoked = false;
    let result: PlinthResult<()> = policy
        .execute(&token, |_| {
            invoked = true;
            async { Ok(()) }
        })
        .await;
    assert!(matches!(result, Err(PlinthError::CircuitOpen)));
    assert!(!invoked);

    // Before the break elapses the breaker stays open.
    clock.advance(Duration::from_secs(3));
    let result: PlinthResult<()> = policy.execute(&token, |_| async { Ok(()) }).await;
    assert!(matches!(result, Err(PlinthError::CircuitOpen)));

    // After the break, the first success closes it again.
    clock.advance(Duration::from_secs(3));
    policy
        .execute(&token, |_| async { Ok::<_, PlinthError>(()) })
        .await
        .unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
    policy
        .execute(&token, |_| async { Ok::<_, PlinthError>(()) })
        .await
        .unwrap();
}

#[tokio::test]
async fn breaker_is_shared_across_policies() {
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerOptions {
        minimum_calls: 2,
        failure_threshold: 1.0,
        consecutive_failure_trip: 2,
        break_duration: Duration::from_secs(60),
        window_duration: Duration::from_secs(300),
    }));
    let writer_policy = ResiliencePolicy::builder()
        .max_attempts(1)
        .circuit_breaker(breaker.clone())
        .build();
    let reader_policy = ResiliencePolicy::builder()
        .max_attempts(1)
        .circuit_breaker(breaker.clone())
        .build();
    let token = CancelToken::new();

    for _ in 0..2 {
        let _: PlinthResult<()> = writer_policy
            .execute(&token, |_| async {
                Err(PlinthError::Transport("down".to_string()))
            })
            .await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // The sibling policy observes the shared breaker.
    let result: PlinthResult<()> = reader_policy.execute(&token, |_| async { Ok(()) }).await;
    assert!(matches!(result, Err(PlinthError::CircuitOpen)));
}

#[tokio::test]
async fn retry_with_timeout_gives_up_with_last_error() {
    let policy = ResiliencePolicy::builder()
        .max_attempts(3)
        .backoff(Backoff::Constant(Duration::from_millis(5)))
        .timeout(Duration::from_millis(20))
        .build();
    let token = CancelToken::new();
    let result: PlinthResult<()> = policy
        .execute(&token, |_| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
    assert!(matches!(result, Err(PlinthError::Timeout(_))));
}
