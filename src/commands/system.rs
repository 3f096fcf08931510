//! System status handlers

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::core::models::JobState;
use crate::core::tools::ToolPaths;
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounts {
    pub total: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub name: &'static str,
    pub version: &'static str,
    pub tools: ToolPaths,
    pub jobs: JobCounts,
}

/// Liveness plus which external tools were found at start-up
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let jobs = state.orchestrator.list_jobs();
    let count = |wanted: JobState| jobs.iter().filter(|j| j.state == wanted).count();

    let ready = state.tools.ytdlp.is_some() && state.tools.ffmpeg.is_some();
    Json(HealthResponse {
        status: if ready { "ok" } else { "degraded" },
        name: crate::NAME,
        version: crate::VERSION,
        tools: (*state.tools).clone(),
        jobs: JobCounts {
            total: jobs.len(),
            active: jobs.iter().filter(|j| j.state.is_active()).count(),
            completed: count(JobState::Completed),
            failed: count(JobState::Failed),
        },
    })
}
