//! Shared test doubles for the coordinator and HTTP tests.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use image_proxy::origin::{OriginError, OriginFetch};
use image_proxy::store::{CoordinationStore, StoreError};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Origin that answers after a fixed delay and counts every call.
pub struct FakeOrigin {
    body: Bytes,
    delay: Duration,
    fail: bool,
    calls: AtomicUsize,
}

impl FakeOrigin {
    pub fn new(body: &'static [u8]) -> Arc<Self> {
        Self::build(body, Duration::ZERO, false)
    }

    pub fn slow(body: &'static [u8], delay: Duration) -> Arc<Self> {
        Self::build(body, delay, false)
    }

    pub fn failing() -> Arc<Self> {
        Self::build(b"", Duration::ZERO, true)
    }

    fn build(body: &'static [u8], delay: Duration, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            body: Bytes::from_static(body),
            delay,
            fail,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OriginFetch for FakeOrigin {
    async fn fetch(&self, resource_id: &str) -> Result<Bytes, OriginError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(OriginError::Unavailable {
                url: resource_id.to_owned(),
                source: anyhow::anyhow!("origin responded with 502 Bad Gateway"),
            });
        }
        Ok(self.body.clone())
    }
}

/// Store whose every operation fails, as if Redis were down.
pub struct DownStore;

fn refused(op: &'static str, key: &str) -> StoreError {
    StoreError::Unavailable {
        op,
        key: key.to_owned(),
        source: anyhow::anyhow!("Connection refused (os error 111)"),
    }
}

#[async_trait]
impl CoordinationStore for DownStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        Err(refused("GET", key))
    }

    async fn set_with_ttl(&self, key: &str, _: Bytes, _: Duration) -> Result<(), StoreError> {
        Err(refused("SET", key))
    }

    async fn acquire_if_absent(&self, key: &str, _: Duration) -> Result<bool, StoreError> {
        Err(refused("SET NX", key))
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        Err(refused("DEL", key))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Err(refused("PING", ""))
    }
}
