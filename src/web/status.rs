//! Health and status handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tracing::{trace, warn};

use crate::coordinator::StatsSnapshot;
use crate::state::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StampedeSettings {
    lock_key: String,
    lock_ttl_ms: u64,
    cache_ttl_ms: u64,
    wait_budget_ms: u64,
    poll_interval_ms: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    version: String,
    commit: String,
    uptime_secs: u64,
    resolutions: StatsSnapshot,
    stampede: StampedeSettings,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Health check endpoint: healthy only while the coordination store answers.
pub(super) async fn health(State(state): State<AppState>) -> Response {
    trace!("health check requested");
    match state.store.ping().await {
        Ok(()) => Json(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))
        .into_response(),
        Err(e) => {
            warn!(error = ?e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "timestamp": chrono::Utc::now().to_rfc3339()
                })),
            )
                .into_response()
        }
    }
}

/// Status endpoint showing resolution counters and the active stampede settings.
pub(super) async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let config = state.coordinator.config();
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        commit: env!("GIT_COMMIT_SHORT").to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        resolutions: state.coordinator.stats(),
        stampede: StampedeSettings {
            lock_key: config.lock_key.clone(),
            lock_ttl_ms: millis(config.lock_ttl),
            cache_ttl_ms: millis(config.cache_ttl),
            wait_budget_ms: millis(config.wait_budget),
            poll_interval_ms: millis(config.poll_interval),
        },
    })
}
