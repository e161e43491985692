//! Web server module for the ingest endpoint.
//!
//! This module provides a small HTTP surface that:
//! - Refuses traffic until the broker topology is established
//! - Decodes each submitted body and publishes it unchanged
//! - Echoes the accepted body back to the caller

pub mod handlers;
pub mod readiness;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use handlers::{health, post_data, AppState, ErrorResponse, HealthResponse};
pub use readiness::Readiness;

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/post-data", post(post_data))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
