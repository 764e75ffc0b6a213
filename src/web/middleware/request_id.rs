//! Per-request tracing spans with request IDs.
//!
//! Reuses an inbound `X-Request-Id` when a load balancer already assigned one,
//! otherwise generates a ULID. The resolved ID is echoed on the response.

use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::response::Response;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tower::{Layer, Service};
use tracing::{Instrument, debug, info, warn};

static REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Longest inbound request ID that is trusted as-is.
const MAX_INBOUND_ID_LEN: usize = 128;

#[derive(Clone)]
pub struct RequestIdLayer;

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService { inner }
    }
}

#[derive(Clone)]
pub struct RequestIdService<S> {
    inner: S,
}

/// The inbound ID if it is usable, otherwise a fresh ULID.
fn request_id(req: &Request) -> String {
    req.headers()
        .get(&REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= MAX_INBOUND_ID_LEN)
        .map(String::from)
        .unwrap_or_else(|| ulid::Ulid::new().to_string())
}

/// Image misses and health checks are routine; only failures are worth noise.
fn log_response(method: &Method, path: &str, status: StatusCode, started: Instant) {
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    let status = status.as_u16();
    if status >= 500 {
        warn!(%method, path, status, elapsed_ms, "request failed");
    } else if status >= 400 {
        info!(%method, path, status, elapsed_ms, "request rejected");
    } else {
        debug!(%method, path, status, elapsed_ms, "request served");
    }
}

impl<S, B> Service<Request> for RequestIdService<S>
where
    S: Service<Request, Response = Response<B>> + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let id = request_id(&req);
        let echoed = HeaderValue::from_str(&id).ok();
        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        let span = tracing::info_span!("request", req_id = %id);
        let started = Instant::now();

        let response = self.inner.call(req);
        Box::pin(
            async move {
                let mut response = response.await?;
                log_response(&method, &path, response.status(), started);
                if let Some(value) = echoed {
                    response.headers_mut().insert(REQUEST_ID.clone(), value);
                }
                Ok(response)
            }
            .instrument(span),
        )
    }
}
