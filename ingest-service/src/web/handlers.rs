//! Endpoint handlers.
//!
//! `post_data` runs the ingest pipeline for one request and maps its outcome
//! onto an HTTP status. A failed publish is never reported as success.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{DecodeError, PublishError};
use crate::pipeline::{ingest, IngestError, Target};
use crate::publisher::Publisher;
use crate::web::readiness::Readiness;
use crate::Config;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub readiness: Readiness,
    target: Arc<Target>,
}

impl AppState {
    /// State with a closed readiness gate.
    pub fn new(config: Config) -> Self {
        let target = Target {
            exchange: config.exchange_name.clone(),
            queue: Some(config.queue_name.clone()),
        };
        Self {
            config: Arc::new(config),
            readiness: Readiness::new(),
            target: Arc::new(target),
        }
    }

    /// Install the publisher and start accepting requests.
    pub fn mark_ready(&self, publisher: Publisher) -> bool {
        self.readiness.mark_ready(publisher)
    }
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint. Reports 503 until the topology is ready.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    if state.readiness.is_ready() {
        (StatusCode::OK, Json(HealthResponse { status: "ok" }))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse { status: "starting" }),
        )
    }
}

// =============================================================================
// Ingest
// =============================================================================

/// Error body returned for rejected requests.
#[derive(Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub detail: String,
}

fn error_response(code: StatusCode, status: &'static str, detail: String) -> Response {
    (code, Json(ErrorResponse { status, detail })).into_response()
}

/// Ingest endpoint.
///
/// Responds with the decoded body as a JSON string once the broker has
/// accepted the message.
pub async fn post_data(State(state): State<AppState>, body: Bytes) -> Response {
    let Some(publisher) = state.readiness.publisher() else {
        warn!(body_length = body.len(), "post_data_not_ready");
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "unavailable",
            "broker topology is not ready".to_string(),
        );
    };

    match ingest(publisher, &state.target, body).await {
        Ok(accepted) => {
            info!(
                exchange = %accepted.receipt.exchange,
                body_length = accepted.receipt.body_length,
                "post_data_enqueued"
            );
            (StatusCode::OK, Json(accepted.text)).into_response()
        }
        Err(IngestError::Decode(e @ DecodeError::InvalidUtf8(_))) => {
            warn!(error = %e, "post_data_decode_failed");
            error_response(StatusCode::BAD_REQUEST, "decode_error", e.to_string())
        }
        Err(IngestError::Decode(e @ DecodeError::InvalidItem(_))) => {
            warn!(error = %e, "post_data_invalid_item");
            error_response(StatusCode::UNPROCESSABLE_ENTITY, "invalid_item", e.to_string())
        }
        Err(IngestError::Publish(e @ PublishError::UnknownExchange(_))) => {
            error!(error = %e, "post_data_misconfigured");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "error", e.to_string())
        }
        Err(IngestError::Publish(e @ PublishError::Failed { .. })) => {
            error!(error = %e, "post_data_publish_failed");
            error_response(StatusCode::BAD_GATEWAY, "publish_failed", e.to_string())
        }
    }
}
