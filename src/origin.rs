//! Origin fetch: the slow upstream that actually produces image bytes.

use crate::utils::{fmt_duration, log_if_slow};
use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use url::Url;

/// Fetches that take longer than this are logged as slow.
const SLOW_FETCH_THRESHOLD: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum OriginError {
    #[error("origin request to {url} failed")]
    Unavailable {
        url: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to read origin response body from {url}")]
    ReadFailure {
        url: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Produces the bytes for a resource identifier.
#[async_trait]
pub trait OriginFetch: Send + Sync {
    async fn fetch(&self, resource_id: &str) -> Result<Bytes, OriginError>;
}

/// Origin reached over HTTP, treating the resource identifier as a literal URL.
pub struct HttpOrigin {
    http: reqwest::Client,
}

impl HttpOrigin {
    pub fn new(timeout: Duration) -> Result<Self, anyhow::Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl OriginFetch for HttpOrigin {
    async fn fetch(&self, resource_id: &str) -> Result<Bytes, OriginError> {
        let url = Url::parse(resource_id).map_err(|e| OriginError::Unavailable {
            url: resource_id.to_owned(),
            source: anyhow!(e).context("resource identifier is not a valid URL"),
        })?;

        info!(url = %url, "fetching from origin");
        let start = Instant::now();

        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| OriginError::Unavailable {
                url: url.to_string(),
                source: e.into(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(OriginError::Unavailable {
                url: url.to_string(),
                source: anyhow!("origin responded with {status}"),
            });
        }

        let body = response.bytes().await.map_err(|e| OriginError::ReadFailure {
            url: url.to_string(),
            source: e.into(),
        })?;

        log_if_slow(start, SLOW_FETCH_THRESHOLD, "origin fetch");
        debug!(
            url = %url,
            bytes = body.len(),
            duration = fmt_duration(start.elapsed()),
            "origin fetch completed"
        );
        Ok(body)
    }
}
