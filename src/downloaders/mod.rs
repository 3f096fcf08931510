//! External tool runners
//!
//! The orchestrator talks to yt-dlp and ffmpeg only through the
//! `MediaFetcher` and `MediaProcessor` traits defined here.

pub mod ffmpeg_processor;
pub mod process;
pub mod ytdlp_fetcher;

#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::error_handling::{FetchError, ProcessError};
use crate::core::models::{AppResult, AvailableFormat, JobProgress, PostprocessOp, VideoInfo};

// Re-export runners
pub use ffmpeg_processor::{plan_postprocess, FfmpegProcessor, MediaPlan};
pub use ytdlp_fetcher::YtDlpFetcher;

/// Channel carrying progress readings from a runner to the orchestrator
pub type ProgressSender = mpsc::UnboundedSender<JobProgress>;

/// Everything a fetcher needs for one attempt
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub job_id: String,
    pub url: String,
    pub title: String,
    pub format: AvailableFormat,
    pub output_dir: PathBuf,
}

/// Metadata probe plus download capability
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Fail with `ToolNotFound` when the backing binary is missing
    fn ensure_available(&self) -> AppResult<()>;

    async fn probe(&self, url: &str) -> AppResult<VideoInfo>;

    /// Run one fetch attempt and return the artifact path
    async fn fetch(
        &self,
        request: &FetchRequest,
        progress: ProgressSender,
        cancel: CancellationToken,
    ) -> Result<PathBuf, FetchError>;
}

/// Media transformation capability
#[async_trait]
pub trait MediaProcessor: Send + Sync {
    fn ensure_available(&self) -> AppResult<()>;

    /// Execute a plan built by `plan_postprocess`; returns `plan.output` on success
    async fn process(
        &self,
        plan: &MediaPlan,
        progress: ProgressSender,
        cancel: CancellationToken,
    ) -> Result<PathBuf, ProcessError>;
}

/// Operation requested for a job, bundled for the planner
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    pub op: PostprocessOp,
    pub input: PathBuf,
    pub source_duration: Option<f64>,
    pub output_dir: PathBuf,
    pub preview_dir: PathBuf,
}
