//! In-process coordination store for tests and local runs without Redis.
//!
//! The map is owned by a single actor task and every operation is a
//! request/reply message, so callers see the same contract as the networked
//! store: no shared memory, atomic set-if-absent, per-key expiry.
//! Expiry uses `tokio::time::Instant` and therefore follows a paused test clock.

use super::{CoordinationStore, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::trace;

const CHANNEL_CAPACITY: usize = 256;

enum Command {
    Get {
        key: String,
        reply: oneshot::Sender<Option<Bytes>>,
    },
    Set {
        key: String,
        value: Bytes,
        ttl: Duration,
        reply: oneshot::Sender<()>,
    },
    AcquireIfAbsent {
        key: String,
        ttl: Duration,
        reply: oneshot::Sender<bool>,
    },
    Release {
        key: String,
        reply: oneshot::Sender<()>,
    },
    Ping {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the store actor. Clone-cheap; the actor stops once every handle is dropped.
#[derive(Clone)]
pub struct InMemoryStore {
    tx: mpsc::Sender<Command>,
}

impl InMemoryStore {
    /// Spawn the actor on the current Tokio runtime.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(run(rx));
        Self { tx }
    }

    async fn request<T>(
        &self,
        op: &'static str,
        key: &str,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| StoreError::unavailable(op, key, anyhow::anyhow!("store actor stopped")))?;
        reply_rx
            .await
            .map_err(|_| StoreError::unavailable(op, key, anyhow::anyhow!("store actor dropped reply")))
    }
}

struct Entry {
    value: Bytes,
    expires_at: Instant,
}

/// Expiry instant, saturating far in the future for TTLs past the clock's range.
fn expiry(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .unwrap_or_else(|| now + Duration::from_secs(100 * 365 * 24 * 60 * 60))
}

async fn run(mut rx: mpsc::Receiver<Command>) {
    let mut entries: HashMap<String, Entry> = HashMap::new();

    while let Some(command) = rx.recv().await {
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);

        match command {
            Command::Get { key, reply } => {
                let value = entries.get(&key).map(|entry| entry.value.clone());
                let _ = reply.send(value);
            }
            Command::Set {
                key,
                value,
                ttl,
                reply,
            } => {
                entries.insert(
                    key,
                    Entry {
                        value,
                        expires_at: expiry(now, ttl),
                    },
                );
                let _ = reply.send(());
            }
            Command::AcquireIfAbsent { key, ttl, reply } => {
                let acquired = !entries.contains_key(&key);
                if acquired {
                    entries.insert(
                        key,
                        Entry {
                            value: Bytes::from_static(b"1"),
                            expires_at: expiry(now, ttl),
                        },
                    );
                }
                let _ = reply.send(acquired);
            }
            Command::Release { key, reply } => {
                entries.remove(&key);
                let _ = reply.send(());
            }
            Command::Ping { reply } => {
                let _ = reply.send(());
            }
        }
    }

    trace!("in-memory store actor stopped");
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.request("GET", key, |reply| Command::Get {
            key: key.to_owned(),
            reply,
        })
        .await
    }

    async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
        self.request("SET", key, |reply| Command::Set {
            key: key.to_owned(),
            value,
            ttl,
            reply,
        })
        .await
    }

    async fn acquire_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.request("SET NX", key, |reply| Command::AcquireIfAbsent {
            key: key.to_owned(),
            ttl,
            reply,
        })
        .await
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        self.request("DEL", key, |reply| Command::Release {
            key: key.to_owned(),
            reply,
        })
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.request("PING", "", |reply| Command::Ping { reply }).await
    }
}
