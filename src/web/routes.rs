//! Web router construction.

use axum::{Router, routing::get};
use tower_http::catch_panic::CatchPanicLayer;

use crate::state::AppState;
use crate::web::middleware::request_id::RequestIdLayer;
use crate::web::{images, status};

/// Creates the web server router.
///
/// No request timeout layer: a slow origin holds its request for as long as it takes.
pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/images", get(images::get_image))
        .route("/health", get(status::health))
        .route("/status", get(status::status))
        .with_state(app_state)
        .layer(CatchPanicLayer::new())
        .layer(RequestIdLayer)
}
