//! Download job handlers

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

use super::{ApiError, ApiResult};
use crate::core::models::{DownloadJob, PostprocessOp};
use crate::core::progress_tracker::{human_duration, human_size};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct StartJobRequest {
    pub url: String,
    pub format: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobCreatedResponse {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearedResponse {
    pub removed: usize,
}

/// Job snapshot plus human-readable progress text
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    #[serde(flatten)]
    pub job: DownloadJob,
    pub speed_text: String,
    pub eta_text: String,
}

impl From<DownloadJob> for JobStatusResponse {
    fn from(job: DownloadJob) -> Self {
        let speed_text = if job.progress.speed_bytes_per_sec > 0.0 {
            format!("{}/s", human_size(job.progress.speed_bytes_per_sec))
        } else {
            String::new()
        };
        let eta_text = if job.state.is_active() && job.progress.eta_seconds > 0.0 {
            human_duration(job.progress.eta_seconds)
        } else {
            String::new()
        };
        Self {
            job,
            speed_text,
            eta_text,
        }
    }
}

pub async fn create_job(
    State(state): State<AppState>,
    Json(payload): Json<StartJobRequest>,
) -> ApiResult<(StatusCode, Json<JobCreatedResponse>)> {
    let id = state
        .orchestrator
        .start(&payload.url, &payload.format)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(JobCreatedResponse { id })))
}

pub async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobStatusResponse>> {
    Json(
        state
            .orchestrator
            .list_jobs()
            .into_iter()
            .map(JobStatusResponse::from)
            .collect(),
    )
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobStatusResponse>> {
    let job = state.orchestrator.get_status(&id)?;
    Ok(Json(job.into()))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobStatusResponse>> {
    let job = state.orchestrator.cancel(&id)?;
    Ok(Json(job.into()))
}

pub async fn postprocess_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(op): Json<PostprocessOp>,
) -> ApiResult<(StatusCode, Json<JobStatusResponse>)> {
    let job = state.orchestrator.postprocess(&id, op)?;
    Ok((StatusCode::ACCEPTED, Json(job.into())))
}

pub async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobStatusResponse>> {
    let job = state.orchestrator.remove(&id)?;
    Ok(Json(job.into()))
}

pub async fn clear_jobs(State(state): State<AppState>) -> Json<ClearedResponse> {
    Json(ClearedResponse {
        removed: state.orchestrator.clear_finished(),
    })
}

fn content_type_for(path: &std::path::Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "opus" | "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
}

/// Stream a completed job's artifact
pub async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let path = state.orchestrator.artifact_path(&id)?;
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = file
        .metadata()
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .len();

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for(&path)),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().replace('"', "_"))
        .unwrap_or_else(|| "download".to_string());
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{file_name}\"")) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_state;
    use crate::core::models::{AudioFormat, JobState};
    use crate::downloaders::testing::{ScriptedFetcher, ScriptedProcessor, Step};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn settle(state: &AppState, id: &str) -> DownloadJob {
        tokio::time::timeout(
            Duration::from_secs(5),
            state
                .orchestrator
                .wait_until_settled(id, Duration::from_millis(5)),
        )
        .await
        .unwrap()
        .unwrap()
    }

    async fn start(state: &AppState, format: &str) -> ApiResult<String> {
        let (status, Json(created)) = create_job(
            State(state.clone()),
            Json(StartJobRequest {
                url: "https://example.com/video1".to_string(),
                format: format.to_string(),
            }),
        )
        .await?;
        assert_eq!(status, StatusCode::ACCEPTED);
        Ok(created.id)
    }

    #[tokio::test]
    async fn test_create_and_poll_job() {
        let dir = TempDir::new().unwrap();
        let state = test_state(
            ScriptedFetcher::new(vec![Step::Succeed]),
            ScriptedProcessor::default(),
            &dir,
        );

        let id = start(&state, "720p").await.unwrap();
        let Json(status) = get_job(State(state.clone()), Path(id.clone())).await.unwrap();
        assert_eq!(status.job.id, id);

        settle(&state, &id).await;
        let Json(status) = get_job(State(state.clone()), Path(id.clone())).await.unwrap();
        assert_eq!(status.job.state, JobState::Completed);
        assert!(status.eta_text.is_empty());

        let body = serde_json::to_value(&status).unwrap();
        assert_eq!(body["state"], "Completed");
        assert_eq!(body["resolvedFormat"], "22");
        assert!(body["speedText"].is_string());
        assert!(body["outputPath"].is_string());

        let Json(jobs) = list_jobs(State(state.clone())).await;
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_format_is_bad_request() {
        let dir = TempDir::new().unwrap();
        let state = test_state(ScriptedFetcher::new(vec![]), ScriptedProcessor::default(), &dir);

        let err = start(&state, "4320p").await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.kind, "InvalidFormatError");
    }

    #[tokio::test]
    async fn test_missing_job_is_not_found() {
        let dir = TempDir::new().unwrap();
        let state = test_state(ScriptedFetcher::new(vec![]), ScriptedProcessor::default(), &dir);

        let err = get_job(State(state.clone()), Path("nope".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err = cancel_job(State(state), Path("nope".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_postprocess_conflict_then_accepted() {
        let dir = TempDir::new().unwrap();
        let state = test_state(
            ScriptedFetcher::new(vec![Step::Hang, Step::Succeed]),
            ScriptedProcessor::default(),
            &dir,
        );

        let hanging = start(&state, "720p").await.unwrap();
        let err = postprocess_job(
            State(state.clone()),
            Path(hanging.clone()),
            Json(PostprocessOp::ExtractAudio(AudioFormat::Mp3)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);

        let Json(cancelled) = cancel_job(State(state.clone()), Path(hanging.clone()))
            .await
            .unwrap();
        assert_eq!(cancelled.job.id, hanging);
        assert_eq!(settle(&state, &hanging).await.state, JobState::Failed);

        let done = start(&state, "720p").await.unwrap();
        settle(&state, &done).await;
        let (status, _) = postprocess_job(
            State(state.clone()),
            Path(done.clone()),
            Json(PostprocessOp::ExtractAudio(AudioFormat::Wav)),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);

        let job = settle(&state, &done).await;
        assert_eq!(job.state, JobState::Completed);
        assert!(job.output_path.unwrap().to_string_lossy().ends_with(".wav"));
    }

    #[tokio::test]
    async fn test_download_file_streams_artifact() {
        let dir = TempDir::new().unwrap();
        let state = test_state(
            ScriptedFetcher::new(vec![Step::Succeed]),
            ScriptedProcessor::default(),
            &dir,
        );

        let id = start(&state, "1080p").await.unwrap();
        settle(&state, &id).await;

        let response = download_file(State(state), Path(id)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "5");
        assert!(response.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .contains("Sample Clip_1080p.mp4"));
    }

    #[tokio::test]
    async fn test_download_file_of_failed_job_reports_failure() {
        let dir = TempDir::new().unwrap();
        let state = test_state(
            ScriptedFetcher::new(vec![Step::Fatal("Unsupported URL")]),
            ScriptedProcessor::default(),
            &dir,
        );

        let id = start(&state, "720p").await.unwrap();
        settle(&state, &id).await;

        let Err(err) = download_file(State(state), Path(id)).await else {
            panic!("failed job must not serve a file");
        };
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.kind, "FatalFetchError");
        assert!(err.message.contains("Unsupported URL"));
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let dir = TempDir::new().unwrap();
        let state = test_state(
            ScriptedFetcher::new(vec![Step::Succeed, Step::Succeed]),
            ScriptedProcessor::default(),
            &dir,
        );

        let first = start(&state, "720p").await.unwrap();
        let second = start(&state, "720p").await.unwrap();
        settle(&state, &first).await;
        settle(&state, &second).await;

        let Json(removed) = delete_job(State(state.clone()), Path(first)).await.unwrap();
        assert_eq!(removed.job.state, JobState::Completed);

        let Json(cleared) = clear_jobs(State(state.clone())).await;
        assert_eq!(cleared.removed, 1);
        assert!(list_jobs(State(state)).await.0.is_empty());
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for(std::path::Path::new("a.MP3")), "audio/mpeg");
        assert_eq!(content_type_for(std::path::Path::new("a.jpg")), "image/jpeg");
        assert_eq!(
            content_type_for(std::path::Path::new("a.bin")),
            "application/octet-stream"
        );
    }
}
