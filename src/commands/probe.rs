//! Probe handlers
//!
//! Reads metadata and the list of offered formats for a URL before a job
//! is started.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use tracing::{error, info};

use super::ApiResult;
use crate::core::models::VideoInfo;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ProbeRequest {
    pub url: String,
}

/// Probe a media URL for title, duration and formats
pub async fn probe_url(
    State(state): State<AppState>,
    Json(payload): Json<ProbeRequest>,
) -> ApiResult<Json<VideoInfo>> {
    info!("📺 Probing: {}", payload.url);

    match state.orchestrator.probe(&payload.url).await {
        Ok(info) => {
            info!(
                "✅ Probed '{}' ({} formats)",
                info.title,
                info.available_formats.len()
            );
            Ok(Json(info))
        }
        Err(e) => {
            error!("❌ Probe failed for {}: {}", payload.url, e);
            Err(e.into())
        }
    }
}
