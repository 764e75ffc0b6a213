//! End-to-end behavior of the stampede protocol against the in-memory store.
//!
//! All tests run on a paused Tokio clock, so the real 100ms poll interval,
//! 5s cache TTL and 10s wait budget are exercised without real waiting.

mod helpers;

use bytes::Bytes;
use helpers::FakeOrigin;
use image_proxy::coordinator::{
    FetchCoordinator, ResolveError, Resolution, StampedeConfig, cache_key,
};
use image_proxy::store::{CoordinationStore, InMemoryStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const LOCK_KEY: &str = "image_lock";

fn coordinator(store: &InMemoryStore, origin: Arc<FakeOrigin>) -> Arc<FetchCoordinator> {
    Arc::new(FetchCoordinator::new(
        Arc::new(store.clone()),
        origin,
        StampedeConfig::default(),
    ))
}

/// Simulate another proxy instance holding the fetch lock.
async fn hold_lock_elsewhere(store: &InMemoryStore) {
    assert!(
        store
            .acquire_if_absent(LOCK_KEY, Duration::from_secs(60))
            .await
            .unwrap()
    );
}

#[tokio::test(start_paused = true)]
async fn cached_resource_skips_origin() {
    let store = InMemoryStore::spawn();
    let origin = FakeOrigin::new(b"fresh");
    store
        .set_with_ttl(&cache_key("r1"), Bytes::from_static(b"cached"), Duration::from_secs(5))
        .await
        .unwrap();

    let resolved = coordinator(&store, origin.clone()).resolve("r1").await.unwrap();

    assert_eq!(resolved.bytes, Bytes::from_static(b"cached"));
    assert_eq!(resolved.resolution, Resolution::CacheHit);
    assert_eq!(origin.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn cold_fetch_then_cache_hit() {
    let store = InMemoryStore::spawn();
    let origin = FakeOrigin::new(b"B");
    let coordinator = coordinator(&store, origin.clone());

    let first = coordinator.resolve("r1").await.unwrap();
    assert_eq!(first.bytes, Bytes::from_static(b"B"));
    assert_eq!(first.resolution, Resolution::Fetched);

    let second = coordinator.resolve("r1").await.unwrap();
    assert_eq!(second.bytes, Bytes::from_static(b"B"));
    assert_eq!(second.resolution, Resolution::CacheHit);
    assert_eq!(origin.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn cache_entry_expires_after_ttl() {
    let store = InMemoryStore::spawn();
    let origin = FakeOrigin::new(b"B");
    let coordinator = coordinator(&store, origin.clone());

    coordinator.resolve("r1").await.unwrap();
    tokio::time::advance(Duration::from_secs(5)).await;

    let again = coordinator.resolve("r1").await.unwrap();
    assert_eq!(again.resolution, Resolution::Fetched);
    assert_eq!(origin.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn concurrent_cold_requests_fetch_once() {
    let store = InMemoryStore::spawn();
    let origin = FakeOrigin::slow(b"B", Duration::from_secs(3));
    let coordinator = coordinator(&store, origin.clone());

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.resolve("r1").await.unwrap() })
        })
        .collect();
    let results: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let fetched = results
        .iter()
        .filter(|r| r.resolution == Resolution::Fetched)
        .count();
    let awaited = results
        .iter()
        .filter(|r| r.resolution == Resolution::Awaited)
        .count();
    assert_eq!(fetched, 1);
    assert_eq!(awaited, 9);
    assert!(results.iter().all(|r| r.bytes == Bytes::from_static(b"B")));
    assert_eq!(origin.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn lock_is_released_after_successful_fetch() {
    let store = InMemoryStore::spawn();
    coordinator(&store, FakeOrigin::new(b"B"))
        .resolve("r1")
        .await
        .unwrap();

    assert!(
        store
            .acquire_if_absent(LOCK_KEY, Duration::from_secs(10))
            .await
            .unwrap()
    );
}

#[tokio::test(start_paused = true)]
async fn lock_is_released_after_failed_fetch() {
    let store = InMemoryStore::spawn();
    let result = coordinator(&store, FakeOrigin::failing()).resolve("r1").await;

    assert!(matches!(result, Err(ResolveError::Origin(_))));
    assert_eq!(store.get(&cache_key("r1")).await.unwrap(), None);
    assert!(
        store
            .acquire_if_absent(LOCK_KEY, Duration::from_secs(10))
            .await
            .unwrap()
    );
}

#[tokio::test(start_paused = true)]
async fn waiter_returns_bytes_populated_by_other_fetcher() {
    let store = InMemoryStore::spawn();
    let origin = FakeOrigin::new(b"mine");
    hold_lock_elsewhere(&store).await;

    let other_fetcher = store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        other_fetcher
            .set_with_ttl(&cache_key("r1"), Bytes::from_static(b"theirs"), Duration::from_secs(5))
            .await
            .unwrap();
    });

    let start = Instant::now();
    let resolved = coordinator(&store, origin.clone()).resolve("r1").await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(resolved.resolution, Resolution::Awaited);
    assert_eq!(resolved.bytes, Bytes::from_static(b"theirs"));
    assert_eq!(origin.calls(), 0);
    assert!(elapsed >= Duration::from_secs(2), "returned early: {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(2_100), "returned late: {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn waiter_fetches_itself_after_budget() {
    let store = InMemoryStore::spawn();
    let origin = FakeOrigin::new(b"fallback");
    hold_lock_elsewhere(&store).await;

    let start = Instant::now();
    let resolved = coordinator(&store, origin.clone()).resolve("r1").await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(resolved.resolution, Resolution::Fallback);
    assert_eq!(resolved.bytes, Bytes::from_static(b"fallback"));
    assert_eq!(origin.calls(), 1);
    assert!(elapsed >= Duration::from_secs(10), "gave up early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(10_200), "gave up late: {elapsed:?}");

    // The unlocked fallback neither writes the cache nor touches someone else's lock.
    assert_eq!(store.get(&cache_key("r1")).await.unwrap(), None);
    assert!(
        !store
            .acquire_if_absent(LOCK_KEY, Duration::from_secs(10))
            .await
            .unwrap()
    );
}

#[tokio::test(start_paused = true)]
async fn waiter_fallback_failure_is_surfaced() {
    let store = InMemoryStore::spawn();
    let origin = FakeOrigin::failing();
    hold_lock_elsewhere(&store).await;

    let result = coordinator(&store, origin.clone()).resolve("r1").await;

    assert!(matches!(result, Err(ResolveError::Origin(_))));
    assert_eq!(origin.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn lock_is_shared_across_resources() {
    let store = InMemoryStore::spawn();
    let origin = FakeOrigin::slow(b"B", Duration::from_secs(3));
    let coordinator = coordinator(&store, origin.clone());

    let first = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.resolve("r1").await.unwrap() })
    };
    // Let r1 take the lock before r2 arrives.
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let start = Instant::now();
    let second = coordinator.resolve("r2").await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(first.await.unwrap().resolution, Resolution::Fetched);
    // r2 never gets a cache entry of its own, so it waits out the whole budget.
    assert_eq!(second.resolution, Resolution::Fallback);
    assert!(elapsed >= Duration::from_secs(10));
    assert_eq!(origin.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn shrunk_timings_are_honoured() {
    let store = InMemoryStore::spawn();
    let origin = FakeOrigin::new(b"B");
    hold_lock_elsewhere(&store).await;
    let coordinator = FetchCoordinator::new(
        Arc::new(store.clone()),
        origin.clone(),
        StampedeConfig {
            wait_budget: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
            ..StampedeConfig::default()
        },
    );

    let start = Instant::now();
    let resolved = coordinator.resolve("r1").await.unwrap();

    assert_eq!(resolved.resolution, Resolution::Fallback);
    assert!(start.elapsed() < Duration::from_millis(100));
    assert_eq!(origin.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn abandoned_fetcher_still_populates_cache() {
    let store = InMemoryStore::spawn();
    let origin = FakeOrigin::slow(b"B", Duration::from_secs(3));
    let coordinator = coordinator(&store, origin.clone());

    // The lock holder's client goes away a second into the origin call.
    let abandoned = tokio::time::timeout(Duration::from_secs(1), coordinator.resolve("r1")).await;
    assert!(abandoned.is_err());

    let waiters: Vec<_> = (0..5)
        .map(|_| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.resolve("r1").await.unwrap() })
        })
        .collect();
    let results: Vec<_> = futures::future::join_all(waiters)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert!(results.iter().all(|r| r.resolution == Resolution::Awaited));
    assert!(results.iter().all(|r| r.bytes == Bytes::from_static(b"B")));
    assert_eq!(origin.calls(), 1);
    assert_eq!(
        store.get(&cache_key("r1")).await.unwrap(),
        Some(Bytes::from_static(b"B"))
    );
    // The detached fetch releases right after writing the cache.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(
        store
            .acquire_if_absent(LOCK_KEY, Duration::from_secs(10))
            .await
            .unwrap()
    );
}
