//! HTTP command handlers
//!
//! This module contains the axum handlers for the JSON API. Handlers are
//! organized by functionality and share one error type.

pub mod download;
pub mod probe;
pub mod system;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::core::models::AppError;
use crate::AppState;

// Re-export all handler functions for easy access
pub use download::*;
pub use probe::*;
pub use system::*;

/// Error body returned by every handler: `{"error": ..., "kind": ...}`
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: "NotFoundError",
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "InternalError",
            message: message.into(),
        }
    }
}

impl From<AppError> for ApiError {
    fn from(error: AppError) -> Self {
        let status = match &error {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Probe(_) | AppError::InvalidFormat(_) | AppError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::InvalidState(_)
            | AppError::FatalFetch(_)
            | AppError::Postprocess(_)
            | AppError::Cancelled(_) => StatusCode::CONFLICT,
            AppError::ToolNotFound(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("API error ({}): {}", self.kind, self.message);
        }
        let body = serde_json::json!({
            "error": self.message,
            "kind": self.kind,
        });
        let mut response = (self.status, Json(body)).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Build the API router over shared state
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/probe", post(probe_url))
        .route("/api/jobs", post(create_job).get(list_jobs).delete(clear_jobs))
        .route("/api/jobs/{id}", get(get_job).delete(delete_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/jobs/{id}/postprocess", post(postprocess_job))
        .route("/api/jobs/{id}/file", get(download_file))
        .fallback(|| async { ApiError::not_found("endpoint not found") })
        .with_state(state)
}

/// State over scripted runners with output under `dir`
#[cfg(test)]
pub(crate) fn test_state(
    fetcher: std::sync::Arc<crate::downloaders::testing::ScriptedFetcher>,
    processor: crate::downloaders::testing::ScriptedProcessor,
    dir: &tempfile::TempDir,
) -> AppState {
    use crate::core::config::AppConfig;
    use crate::core::orchestrator::{DownloadOrchestrator, OrchestratorSettings};
    use crate::core::tools::ToolPaths;
    use std::sync::Arc;

    let mut config = AppConfig::default();
    config.download.output_directory = dir.path().join("downloads");
    config.download.preview_directory = dir.path().join("downloads").join("previews");
    config.retry.base_delay_ms = 10;

    let orchestrator = DownloadOrchestrator::new(
        fetcher,
        Arc::new(processor),
        OrchestratorSettings::from_config(&config),
    );
    AppState::with_orchestrator(config, ToolPaths::default(), orchestrator)
}
