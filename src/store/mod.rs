//! Coordination store: the shared key-value service every proxy instance talks to.
//!
//! Holds both cache entries and the fetch lock. No business logic lives here;
//! the coordinator decides what the keys mean.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

pub mod memory;
pub mod redis;

pub use memory::InMemoryStore;
pub use redis::RedisStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("coordination store unavailable during {op} on {key:?}")]
    Unavailable {
        op: &'static str,
        key: String,
        #[source]
        source: anyhow::Error,
    },
}

impl StoreError {
    pub(crate) fn unavailable(
        op: &'static str,
        key: &str,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Self::Unavailable {
            op,
            key: key.to_owned(),
            source: source.into(),
        }
    }
}

/// Operations the coordinator needs from the shared store.
///
/// Implementations must be safe to use from many processes at once;
/// `acquire_if_absent` in particular has to be atomic on the server side.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Fetch a value. `Ok(None)` means the key is absent (or expired).
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Unconditionally write `value` with an expiry.
    async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError>;

    /// Create `key` with an expiry only if it does not exist. Returns whether it was created.
    async fn acquire_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Delete `key`. Deleting an absent key is not an error.
    async fn release(&self, key: &str) -> Result<(), StoreError>;

    /// Round-trip to the store, for health checks.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Millisecond TTL for store commands.
///
/// Never zero, since a zero expiry is rejected or means "no expiry", and never
/// above `i64::MAX`, the largest `PX` Redis accepts.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    const MAX_PX: u64 = i64::MAX as u64;
    u64::try_from(ttl.as_millis())
        .unwrap_or(MAX_PX)
        .clamp(1, MAX_PX)
}
