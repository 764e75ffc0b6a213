//! `GET /images?url=<resource>`: the proxied image endpoint.

use axum::extract::{Query, State};
use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::debug;

use crate::state::AppState;
use crate::web::error::ApiError;

/// Every cached resource is assumed to share this content type; it is not stored.
pub const IMAGE_CONTENT_TYPE: &str = "image/jpeg";

#[derive(Debug, Deserialize)]
pub struct ImageParams {
    pub url: String,
}

pub(super) async fn get_image(
    State(state): State<AppState>,
    Query(params): Query<ImageParams>,
) -> Result<Response, ApiError> {
    let resolved = state.coordinator.resolve(&params.url).await?;
    debug!(
        resource = %params.url,
        resolution = resolved.resolution.as_str(),
        bytes = resolved.bytes.len(),
        "image resolved"
    );

    Ok((
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static(IMAGE_CONTENT_TYPE),
        )],
        resolved.bytes,
    )
        .into_response())
}
