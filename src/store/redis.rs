//! Redis-backed coordination store.
//!
//! Uses a multiplexed `ConnectionManager`, which reconnects on its own after
//! a dropped connection. Each call clones the manager (cheap) rather than
//! holding a lock around a single connection.

use super::{CoordinationStore, StoreError, ttl_millis};
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Value stored under a held lock. Only the key's existence matters.
const LOCK_SENTINEL: &str = "1";

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis and verify the connection with a `PING`.
    pub async fn connect(
        host: &str,
        port: u16,
        password: Option<&str>,
    ) -> Result<Self, anyhow::Error> {
        let url = connection_url(host, port, password)?;
        let client = redis::Client::open(url.as_str()).context("Invalid Redis connection info")?;
        let conn = client
            .get_connection_manager()
            .await
            .with_context(|| format!("Failed to connect to Redis at {host}:{port}"))?;

        let store = Self { conn };
        store
            .ping()
            .await
            .with_context(|| format!("Redis at {host}:{port} did not answer PING"))?;

        info!(host, port, auth = password.is_some(), "connected to redis");
        Ok(store)
    }
}

/// Build a `redis://` URL for database 0. The password is percent-encoded by `Url`.
fn connection_url(host: &str, port: u16, password: Option<&str>) -> Result<Url, anyhow::Error> {
    let mut url = Url::parse(&format!("redis://{host}"))
        .with_context(|| format!("Invalid Redis host {host:?}"))?;
    url.set_port(Some(port))
        .map_err(|()| anyhow::anyhow!("Cannot set port on Redis URL"))?;
    if let Some(password) = password.filter(|p| !p.is_empty()) {
        url.set_password(Some(password))
            .map_err(|()| anyhow::anyhow!("Cannot set password on Redis URL"))?;
    }
    url.set_path("/0");
    Ok(url)
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::unavailable("GET", key, e))?;
        Ok(value.map(Bytes::from))
    }

    async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value.as_ref())
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::unavailable("SET", key, e))?;
        Ok(())
    }

    async fn acquire_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        // SET NX replies OK when the key was created and nil when it already existed.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(LOCK_SENTINEL)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::unavailable("SET NX", key, e))?;
        let acquired = reply.is_some();
        debug!(key, acquired, "lock acquisition attempted");
        Ok(acquired)
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::unavailable("DEL", key, e))?;
        debug!(key, removed, "lock released");
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::unavailable("PING", "", e))?;
        Ok(())
    }
}
