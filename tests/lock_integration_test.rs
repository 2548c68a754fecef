//! Lock contention across instances sharing one cache and bus.

use std::sync::Arc;
use std::time::{Duration, Instant};

use plinth::cache::{CacheClient, InMemoryCacheClient};
use plinth::cancellation::CancelToken;
use plinth::lock::{CacheLockProvider, LockProvider};
use plinth::messaging::{InProcessMessageBus, MessageBus};
use plinth::time::SystemClock;

fn shared_pair() -> (Arc<dyn CacheClient>, Arc<dyn MessageBus>) {
    (
        Arc::new(InMemoryCacheClient::new()),
        Arc::new(InProcessMessageBus::new()),
    )
}

#[tokio::test]
async fn release_notification_wakes_waiter_early() {
    let (cache, bus) = shared_pair();
    let instance_a = CacheLockProvider::new(cache.clone(), bus.clone(), Arc::new(SystemClock));
    let instance_b = CacheLockProvider::new(cache, bus, Arc::new(SystemClock));
    let token = CancelToken::new();

    let held = instance_a
        .acquire("L", Duration::from_secs(60), Some(Duration::ZERO), &token)
        .await
        .unwrap()
        .expect("first acquire succeeds");

    // Holder releases shortly after the waiter starts blocking.
    let releaser = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        held.release().await.unwrap();
    });

    let started = Instant::now();
    let handle = instance_b
        .acquire(
            "L",
            Duration::from_secs(60),
            Some(Duration::from_secs(30)),
            &token,
        )
        .await
        .unwrap()
        .expect("waiter should obtain the lock after release");
    let elapsed = started.elapsed();
    releaser.await.unwrap();

    // Bus-driven wakeup: well before the holder's 60 s lease or the
    // 30 s max wait would fire.
    assert!(
        elapsed < Duration::from_millis(500),
        "acquire took {:?}",
        elapsed
    );
    handle.release().await.unwrap();
}

#[tokio::test]
async fn at_most_one_token_outstanding_per_resource() {
    let (cache, bus) = shared_pair();
    let provider = Arc::new(CacheLockProvider::new(
        cache,
        bus,
        Arc::new(SystemClock),
    ));
    let token = CancelToken::new();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let provider = provider.clone();
        let token = token.clone();
        tasks.push(tokio::spawn(async move {
            provider
                .acquire("res", Duration::from_secs(30), Some(Duration::ZERO), &token)
                .await
                .unwrap()
        }));
    }
    let mut winners = 0;
    let mut held = Vec::new();
    for task in tasks {
        if let Some(handle) = task.await.unwrap() {
            winners += 1;
            held.push(handle);
        }
    }
    assert_eq!(winners, 1, "exactly one concurrent acquire may win");
    for handle in held {
        handle.release().await.unwrap();
    }
}

#[tokio::test]
async fn expired_lease_self_heals() {
    let (cache, bus) = shared_pair();
    let provider = CacheLockProvider::new(cache, bus, Arc::new(SystemClock));
    let token = CancelToken::new();

    let _crashed_holder = provider
        .acquire("res", Duration::from_millis(60), Some(Duration::ZERO), &token)
        .await
        .unwrap()
        .unwrap();
    // The "crashed" holder never releases; the lease expires on its own.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let successor = provider
        .acquire("res", Duration::from_secs(30), Some(Duration::ZERO), &token)
        .await
        .unwrap();
    assert!(successor.is_some());
}

#[tokio::test]
async fn force_release_frees_the_resource() {
    let (cache, bus) = shared_pair();
    let provider = CacheLockProvider::new(cache, bus, Arc::new(SystemClock));
    let token = CancelToken::new();

    let _held = provider
        .acquire("res", Duration::from_secs(60), Some(Duration::ZERO), &token)
        .await
        .unwrap()
        .unwrap();
    assert!(provider.is_locked("res").await.unwrap());
    provider.release_lock("res").await.unwrap();
    assert!(!provider.is_locked("res").await.unwrap());
}
