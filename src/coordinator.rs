//! Stampede-controlled read-through fetches.
//!
//! A request for a resource is answered from the shared cache when possible.
//! On a miss, exactly one request system-wide wins the fetch lock and goes to
//! the origin; everyone else polls the cache until that result lands, and
//! falls back to an unlocked origin fetch once their wait budget runs out.
//!
//! ```text
//! get(cache) ── hit ──────────────────────────────► CacheHit
//!     │ miss
//! acquire_if_absent(lock)
//!     ├─ true  ─► fetch ─► set(cache) ─► release ─► Fetched
//!     └─ false ─► poll get(cache) every interval
//!                   ├─ hit ──────────────────────► Awaited
//!                   └─ budget spent ─► fetch ────► Fallback (not cached)
//! ```
//!
//! The lock key is global, not per resource, so at most one locked origin
//! fetch is in flight across every proxy instance at any time.

use crate::origin::{OriginError, OriginFetch};
use crate::store::{CoordinationStore, StoreError};
use crate::utils::fmt_duration;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const CACHE_KEY_PREFIX: &str = "image:";

/// Cache key for a resource identifier.
pub fn cache_key(resource_id: &str) -> String {
    format!("{CACHE_KEY_PREFIX}{resource_id}")
}

/// Timing and keying for the stampede protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StampedeConfig {
    /// Lock key shared by every resource.
    pub lock_key: String,
    /// Expiry on the lock, covering a fetcher that dies without releasing.
    pub lock_ttl: Duration,
    /// Expiry on cached bytes.
    pub cache_ttl: Duration,
    /// How long a waiter polls before fetching on its own.
    pub wait_budget: Duration,
    /// Sleep between cache polls while waiting.
    pub poll_interval: Duration,
}

impl Default for StampedeConfig {
    fn default() -> Self {
        Self {
            lock_key: "image_lock".to_string(),
            lock_ttl: Duration::from_secs(10),
            cache_ttl: Duration::from_secs(5),
            wait_budget: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Origin(#[from] OriginError),
    #[error("fetch task failed")]
    FetchTask(#[from] tokio::task::JoinError),
}

/// Which path produced the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Served straight from the cache.
    CacheHit,
    /// This request held the lock, fetched and populated the cache.
    Fetched,
    /// Another request's fetch populated the cache while this one waited.
    Awaited,
    /// The wait budget ran out; fetched without the lock and without caching.
    Fallback,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::CacheHit => "cache_hit",
            Resolution::Fetched => "fetched",
            Resolution::Awaited => "awaited",
            Resolution::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resolved {
    pub bytes: Bytes,
    pub resolution: Resolution,
}

/// Running totals of resolutions, for the status endpoint.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    cache_hits: AtomicU64,
    fetched: AtomicU64,
    awaited: AtomicU64,
    fallbacks: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub cache_hits: u64,
    pub fetched: u64,
    pub awaited: u64,
    pub fallbacks: u64,
    pub failures: u64,
}

impl CoordinatorStats {
    fn record(&self, resolution: Resolution) {
        let counter = match resolution {
            Resolution::CacheHit => &self.cache_hits,
            Resolution::Fetched => &self.fetched,
            Resolution::Awaited => &self.awaited,
            Resolution::Fallback => &self.fallbacks,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            fetched: self.fetched.load(Ordering::Relaxed),
            awaited: self.awaited.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

pub struct FetchCoordinator {
    store: Arc<dyn CoordinationStore>,
    origin: Arc<dyn OriginFetch>,
    config: StampedeConfig,
    stats: CoordinatorStats,
}

impl FetchCoordinator {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        origin: Arc<dyn OriginFetch>,
        config: StampedeConfig,
    ) -> Self {
        Self {
            store,
            origin,
            config,
            stats: CoordinatorStats::default(),
        }
    }

    pub fn config(&self) -> &StampedeConfig {
        &self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Produce the bytes for `resource_id`, fetching from the origin at most once system-wide
    /// while the cache is cold.
    pub async fn resolve(&self, resource_id: &str) -> Result<Resolved, ResolveError> {
        let result = self.resolve_uncounted(resource_id).await;
        match &result {
            Ok(resolved) => self.stats.record(resolved.resolution),
            Err(_) => self.stats.record_failure(),
        }
        result
    }

    async fn resolve_uncounted(&self, resource_id: &str) -> Result<Resolved, ResolveError> {
        let cache_key = cache_key(resource_id);

        let cached = self.store.get(&cache_key).await.inspect_err(|e| {
            error!(error = ?e, cache_key = %cache_key, "failed to read cache");
        })?;
        if let Some(bytes) = cached {
            debug!(cache_key = %cache_key, bytes = bytes.len(), "cache hit");
            return Ok(Resolved {
                bytes,
                resolution: Resolution::CacheHit,
            });
        }

        let lock = LockGuard::acquire(&self.store, &self.config.lock_key, self.config.lock_ttl)
            .await
            .inspect_err(|e| {
                error!(error = ?e, lock_key = %self.config.lock_key, "failed to acquire fetch lock");
            })?;

        match lock {
            Some(guard) => self.fetch_detached(guard, resource_id, cache_key).await,
            None => self.wait_for_fetcher(resource_id, &cache_key).await,
        }
    }

    /// Runs the lock holder's fetch on its own task.
    ///
    /// Waiters depend on this fetch landing in the cache, so it must outlive
    /// the request that started it. Dropping the returned future only drops
    /// the join handle.
    async fn fetch_detached(
        &self,
        guard: LockGuard,
        resource_id: &str,
        cache_key: String,
    ) -> Result<Resolved, ResolveError> {
        let store = self.store.clone();
        let origin = self.origin.clone();
        let cache_ttl = self.config.cache_ttl;
        let resource_id = resource_id.to_owned();

        let task = tokio::spawn(async move {
            let result = fetch_and_populate(
                store.as_ref(),
                origin.as_ref(),
                &resource_id,
                &cache_key,
                cache_ttl,
            )
            .await;
            guard.release().await;
            result
        });

        task.await.unwrap_or_else(|e| {
            error!(error = ?e, "fetch task did not complete");
            Err(ResolveError::FetchTask(e))
        })
    }

    async fn wait_for_fetcher(
        &self,
        resource_id: &str,
        cache_key: &str,
    ) -> Result<Resolved, ResolveError> {
        let started = Instant::now();
        debug!(cache_key, "fetch lock held elsewhere, waiting for cache");

        while started.elapsed() < self.config.wait_budget {
            let cached = self.store.get(cache_key).await.inspect_err(|e| {
                error!(error = ?e, cache_key, "failed to poll cache while waiting");
            })?;
            if let Some(bytes) = cached {
                debug!(
                    cache_key,
                    waited = fmt_duration(started.elapsed()),
                    "cache populated while waiting"
                );
                return Ok(Resolved {
                    bytes,
                    resolution: Resolution::Awaited,
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }

        warn!(
            resource = resource_id,
            waited = fmt_duration(started.elapsed()),
            "wait budget exhausted, fetching without lock"
        );
        let bytes = self.origin.fetch(resource_id).await.inspect_err(|e| {
            error!(error = ?e, resource = resource_id, "fallback origin fetch failed");
        })?;
        Ok(Resolved {
            bytes,
            resolution: Resolution::Fallback,
        })
    }
}

/// Runs while holding the lock. The caller releases it whatever the outcome.
async fn fetch_and_populate(
    store: &dyn CoordinationStore,
    origin: &dyn OriginFetch,
    resource_id: &str,
    cache_key: &str,
    cache_ttl: Duration,
) -> Result<Resolved, ResolveError> {
    let bytes = origin.fetch(resource_id).await.inspect_err(|e| {
        error!(error = ?e, resource = resource_id, "origin fetch failed while holding lock");
    })?;

    store
        .set_with_ttl(cache_key, bytes.clone(), cache_ttl)
        .await
        .inspect_err(|e| {
            error!(error = ?e, cache_key, "failed to populate cache");
        })?;

    info!(
        resource = resource_id,
        bytes = bytes.len(),
        ttl = fmt_duration(cache_ttl),
        "cache populated"
    );
    Ok(Resolved {
        bytes,
        resolution: Resolution::Fetched,
    })
}

/// A held fetch lock.
///
/// Release it with [`LockGuard::release`]. A guard dropped without that call
/// (a panic, or `release` itself being cancelled) spawns the release on the
/// current runtime instead.
struct LockGuard {
    store: Arc<dyn CoordinationStore>,
    key: String,
    released: bool,
}

impl LockGuard {
    async fn acquire(
        store: &Arc<dyn CoordinationStore>,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<Self>, StoreError> {
        if !store.acquire_if_absent(key, ttl).await? {
            return Ok(None);
        }
        debug!(lock_key = key, ttl = fmt_duration(ttl), "fetch lock acquired");
        Ok(Some(Self {
            store: store.clone(),
            key: key.to_owned(),
            released: false,
        }))
    }

    async fn release(mut self) {
        release_logged(self.store.as_ref(), &self.key).await;
        self.released = true;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(lock_key = %self.key, "fetch lock dropped outside a runtime; left to expire");
            return;
        };
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        handle.spawn(async move {
            release_logged(store.as_ref(), &key).await;
        });
    }
}

/// Release failures are logged, never surfaced: the lock TTL bounds the damage.
async fn release_logged(store: &dyn CoordinationStore, key: &str) {
    match store.release(key).await {
        Ok(()) => debug!(lock_key = key, "fetch lock released"),
        Err(e) => warn!(error = ?e, lock_key = key, "failed to release fetch lock"),
    }
}
