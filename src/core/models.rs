//! Core data models for download jobs, probe results and postprocess requests

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Lifecycle state of a download job
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    Fetching,
    Postprocessing,
    Completed,
    Failed,
}

impl JobState {
    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `Fetching -> Fetching` is the retry edge; `Completed -> Postprocessing`
    /// is the only way out of a completed state.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Fetching)
                | (Pending, Failed)
                | (Fetching, Fetching)
                | (Fetching, Completed)
                | (Fetching, Failed)
                | (Completed, Postprocessing)
                | (Postprocessing, Completed)
                | (Postprocessing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

/// Progress triple reported by the external tools
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub percent: f64,
    pub speed_bytes_per_sec: f64,
    pub eta_seconds: f64,
}

impl JobProgress {
    /// Clamp every field into its valid range. Non-finite values become zero.
    pub fn sanitized(self) -> Self {
        fn finite_non_negative(value: f64) -> f64 {
            if value.is_finite() && value > 0.0 {
                value
            } else {
                0.0
            }
        }

        Self {
            percent: finite_non_negative(self.percent).min(100.0),
            speed_bytes_per_sec: finite_non_negative(self.speed_bytes_per_sec),
            eta_seconds: finite_non_negative(self.eta_seconds),
        }
    }

    /// Merge a new reading so that `percent` never goes backwards within an attempt.
    pub fn advance(self, reading: JobProgress) -> Self {
        let reading = reading.sanitized();
        Self {
            percent: reading.percent.max(self.percent),
            ..reading
        }
    }

    pub fn completed() -> Self {
        Self {
            percent: 100.0,
            speed_bytes_per_sec: 0.0,
            eta_seconds: 0.0,
        }
    }
}

/// Classification of a job failure
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobErrorKind {
    FatalFetch,
    ToolNotFound,
    Postprocess,
    Cancelled,
}

/// Failure details recorded on a job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
    pub retry_count: u32,
    /// `true` when the job failed only because the retry budget ran out
    pub retries_exhausted: bool,
}

impl JobError {
    pub fn new(kind: JobErrorKind, message: impl Into<String>, retry_count: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_count,
            retries_exhausted: false,
        }
    }

    pub fn cancelled(retry_count: u32) -> Self {
        Self::new(JobErrorKind::Cancelled, "Cancelled by user request", retry_count)
    }

    pub fn exhausted(message: impl Into<String>, retry_count: u32) -> Self {
        Self {
            retries_exhausted: true,
            ..Self::new(JobErrorKind::FatalFetch, message, retry_count)
        }
    }
}

/// Snapshot of one download job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadJob {
    pub id: String,
    pub source_url: String,
    pub selected_format: String,
    pub resolved_format: String,
    pub title: String,
    pub state: JobState,
    pub progress: JobProgress,
    pub output_path: Option<PathBuf>,
    pub error: Option<JobError>,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DownloadJob {
    pub fn new(
        source_url: impl Into<String>,
        selected_format: impl Into<String>,
        resolved_format: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            source_url: source_url.into(),
            selected_format: selected_format.into(),
            resolved_format: resolved_format.into(),
            title: title.into(),
            state: JobState::Pending,
            progress: JobProgress::default(),
            output_path: None,
            error: None,
            attempt: 0,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.attempt.saturating_sub(1)
    }
}

/// One downloadable format offered by a probe
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AvailableFormat {
    pub format_id: String,
    pub ext: String,
    pub height: Option<u32>,
    pub has_video: bool,
    pub has_audio: bool,
    /// Total bitrate in kbps
    pub bitrate_kbps: Option<f64>,
    pub filesize: Option<u64>,
    pub note: Option<String>,
    pub label: String,
}

impl AvailableFormat {
    pub fn resolution_tag(&self) -> String {
        match self.height {
            Some(height) if self.has_video => format!("{height}p"),
            _ if !self.has_video => "audio".to_string(),
            _ => self.format_id.clone(),
        }
    }

    /// Selector passed to yt-dlp; video-only streams get the best audio merged in.
    pub fn fetch_selector(&self) -> String {
        if self.has_video && !self.has_audio {
            format!("{id}+bestaudio/{id}", id = self.format_id)
        } else {
            self.format_id.clone()
        }
    }
}

/// Result of a metadata probe
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfo {
    pub id: String,
    pub title: String,
    pub duration: Option<f64>,
    pub thumbnail: Option<String>,
    pub webpage_url: Option<String>,
    pub available_formats: Vec<AvailableFormat>,
}

impl VideoInfo {
    /// Resolve a user selector to one of the offered formats.
    ///
    /// An exact format id wins, then a `<height>p` alias, then `audio` for the
    /// best audio-only stream. Formats are already sorted best-first.
    pub fn resolve_format(&self, selector: &str) -> Option<&AvailableFormat> {
        let selector = selector.trim();
        if let Some(format) = self
            .available_formats
            .iter()
            .find(|f| f.format_id == selector)
        {
            return Some(format);
        }

        let lowered = selector.to_ascii_lowercase();
        if lowered == "audio" {
            return self.available_formats.iter().find(|f| !f.has_video);
        }

        let height: u32 = lowered.strip_suffix('p')?.parse().ok()?;
        self.available_formats
            .iter()
            .find(|f| f.has_video && f.height == Some(height))
    }

    /// Selector for the 720p stream or the nearest one below it.
    pub fn preferred_720p_or_nearest(&self) -> Option<&AvailableFormat> {
        let video: Vec<&AvailableFormat> = self
            .available_formats
            .iter()
            .filter(|f| f.has_video && f.height.is_some())
            .collect();

        video
            .iter()
            .find(|f| f.height == Some(720))
            .or_else(|| {
                video
                    .iter()
                    .filter(|f| f.height.unwrap_or(0) <= 720)
                    .max_by_key(|f| f.height)
            })
            .or_else(|| video.iter().max_by_key(|f| f.height))
            .copied()
            .or_else(|| self.available_formats.last())
    }
}

/// Audio container produced by audio extraction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Mp3,
    M4a,
    Opus,
    Wav,
}

impl AudioFormat {
    pub fn extension(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::M4a => "m4a",
            AudioFormat::Opus => "opus",
            AudioFormat::Wav => "wav",
        }
    }

    pub fn codec(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "libmp3lame",
            AudioFormat::M4a => "aac",
            AudioFormat::Opus => "libopus",
            AudioFormat::Wav => "pcm_s16le",
        }
    }
}

/// Time range with optional bounds, given as `SS`, `MM:SS` or `HH:MM:SS`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeRange {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

/// Media transformation applied to a completed download
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PostprocessOp {
    Trim(TimeRange),
    ExtractAudio(AudioFormat),
    GeneratePreview(TimeRange),
}

impl PostprocessOp {
    pub fn name(&self) -> &'static str {
        match self {
            PostprocessOp::Trim(_) => "trim",
            PostprocessOp::ExtractAudio(_) => "extract_audio",
            PostprocessOp::GeneratePreview(_) => "generate_preview",
        }
    }
}

/// Application error types
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Probe failed: {0}")]
    Probe(String),

    #[error("Format '{0}' is not offered for this video")]
    InvalidFormat(String),

    #[error("Required tool not found: {0}")]
    ToolNotFound(String),

    #[error("Fetch failed: {0}")]
    FatalFetch(String),

    #[error("Postprocess failed: {0}")]
    Postprocess(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid job state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    /// Stable machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Probe(_) => "ProbeError",
            AppError::InvalidFormat(_) => "InvalidFormatError",
            AppError::ToolNotFound(_) => "ToolNotFoundError",
            AppError::FatalFetch(_) => "FatalFetchError",
            AppError::Postprocess(_) => "PostprocessError",
            AppError::NotFound(_) => "NotFoundError",
            AppError::Cancelled(_) => "CancelledError",
            AppError::InvalidRequest(_) => "InvalidRequestError",
            AppError::InvalidState(_) => "InvalidStateError",
            AppError::Io(_) => "IoError",
            AppError::Config(_) => "ConfigError",
        }
    }
}

/// Surfaces a job's recorded failure to a synchronous caller
impl From<JobError> for AppError {
    fn from(error: JobError) -> Self {
        match error.kind {
            JobErrorKind::FatalFetch => AppError::FatalFetch(error.message),
            JobErrorKind::ToolNotFound => AppError::ToolNotFound(error.message),
            JobErrorKind::Postprocess => AppError::Postprocess(error.message),
            JobErrorKind::Cancelled => AppError::Cancelled(error.message),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn format(id: &str, height: Option<u32>, has_video: bool, has_audio: bool) -> AvailableFormat {
        AvailableFormat {
            format_id: id.to_string(),
            ext: "mp4".to_string(),
            height,
            has_video,
            has_audio,
            bitrate_kbps: None,
            filesize: None,
            note: None,
            label: id.to_string(),
        }
    }

    fn info(formats: Vec<AvailableFormat>) -> VideoInfo {
        VideoInfo {
            id: "abc".to_string(),
            title: "Clip".to_string(),
            duration: Some(12.0),
            thumbnail: None,
            webpage_url: None,
            available_formats: formats,
        }
    }

    #[test]
    fn test_job_error_converts_to_app_error() {
        let error = AppError::from(JobError::exhausted("Gave up after 3 attempts", 2));
        assert_eq!(error.kind(), "FatalFetchError");
        assert_eq!(error.to_string(), "Fetch failed: Gave up after 3 attempts");

        let error = AppError::from(JobError::cancelled(0));
        assert_eq!(error.kind(), "CancelledError");

        let error = AppError::from(JobError::new(JobErrorKind::Postprocess, "bad input", 0));
        assert!(matches!(error, AppError::Postprocess(message) if message == "bad input"));
    }

    #[test]
    fn test_state_machine_only_moves_forward() {
        assert!(JobState::Pending.can_transition_to(JobState::Fetching));
        assert!(JobState::Fetching.can_transition_to(JobState::Fetching));
        assert!(JobState::Completed.can_transition_to(JobState::Postprocessing));
        assert!(JobState::Postprocessing.can_transition_to(JobState::Completed));

        assert!(!JobState::Fetching.can_transition_to(JobState::Pending));
        assert!(!JobState::Failed.can_transition_to(JobState::Fetching));
        assert!(!JobState::Completed.can_transition_to(JobState::Fetching));
        assert!(!JobState::Completed.can_transition_to(JobState::Failed));
    }

    #[test]
    fn test_progress_percent_never_decreases() {
        let progress = JobProgress::default().advance(JobProgress {
            percent: 40.0,
            speed_bytes_per_sec: 1000.0,
            eta_seconds: 5.0,
        });
        let progress = progress.advance(JobProgress {
            percent: 10.0,
            speed_bytes_per_sec: 2000.0,
            eta_seconds: 3.0,
        });

        assert_eq!(progress.percent, 40.0);
        assert_eq!(progress.speed_bytes_per_sec, 2000.0);
        assert_eq!(progress.eta_seconds, 3.0);
    }

    #[test]
    fn test_progress_sanitized_clamps_values() {
        let progress = JobProgress {
            percent: 180.0,
            speed_bytes_per_sec: f64::NAN,
            eta_seconds: -4.0,
        }
        .sanitized();

        assert_eq!(progress.percent, 100.0);
        assert_eq!(progress.speed_bytes_per_sec, 0.0);
        assert_eq!(progress.eta_seconds, 0.0);
    }

    #[test]
    fn test_resolve_format_by_id_and_alias() {
        let video = info(vec![
            format("137", Some(1080), true, false),
            format("22", Some(720), true, true),
            format("140", None, false, true),
        ]);

        assert_eq!(video.resolve_format("22").unwrap().format_id, "22");
        assert_eq!(video.resolve_format("720p").unwrap().format_id, "22");
        assert_eq!(video.resolve_format("1080P").unwrap().format_id, "137");
        assert_eq!(video.resolve_format("audio").unwrap().format_id, "140");
        assert!(video.resolve_format("480p").is_none());
        assert!(video.resolve_format("999").is_none());
    }

    #[test]
    fn test_fetch_selector_merges_audio_for_video_only() {
        assert_eq!(
            format("137", Some(1080), true, false).fetch_selector(),
            "137+bestaudio/137"
        );
        assert_eq!(format("22", Some(720), true, true).fetch_selector(), "22");
    }

    #[test]
    fn test_preferred_720p_or_nearest() {
        let exact = info(vec![
            format("a", Some(1080), true, true),
            format("b", Some(720), true, true),
        ]);
        assert_eq!(exact.preferred_720p_or_nearest().unwrap().format_id, "b");

        let below = info(vec![
            format("a", Some(1080), true, true),
            format("b", Some(480), true, true),
            format("c", Some(360), true, true),
        ]);
        assert_eq!(below.preferred_720p_or_nearest().unwrap().format_id, "b");

        let above = info(vec![
            format("a", Some(2160), true, true),
            format("b", Some(1080), true, true),
        ]);
        assert_eq!(above.preferred_720p_or_nearest().unwrap().format_id, "a");

        let audio_only = info(vec![format("140", None, false, true)]);
        assert_eq!(audio_only.preferred_720p_or_nearest().unwrap().format_id, "140");
    }

    #[test]
    fn test_postprocess_op_wire_shape() {
        let op: PostprocessOp = serde_json::from_str(r#"{"extractAudio":"mp3"}"#).unwrap();
        assert_eq!(op, PostprocessOp::ExtractAudio(AudioFormat::Mp3));

        let op: PostprocessOp =
            serde_json::from_str(r#"{"trim":{"start":"0:10","end":"0:20"}}"#).unwrap();
        assert_eq!(
            op,
            PostprocessOp::Trim(TimeRange {
                start: Some("0:10".to_string()),
                end: Some("0:20".to_string()),
            })
        );
    }

    #[test]
    fn test_new_job_is_pending_without_output() {
        let job = DownloadJob::new("https://example.com/v", "720p", "22", "Clip");
        assert_eq!(job.state, JobState::Pending);
        assert!(job.output_path.is_none());
        assert!(job.error.is_none());
        assert_eq!(job.retry_count(), 0);
    }
}
