//! ffmpeg backed postprocessing: trim, audio extraction and previews

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::process::{run_streaming, OutputLine, OutputStream, RunError};
use super::{MediaProcessor, ProcessRequest, ProgressSender};
use crate::core::error_handling::{last_error_line, ProcessError};
use crate::core::models::{AppError, AppResult, PostprocessOp, TimeRange};
use crate::core::progress_tracker::FfmpegProgressParser;
use crate::core::tools::{Tool, ToolPaths};
use crate::utils::validation::parse_timestamp;

/// Length of a preview clip when no range is given
pub const DEFAULT_PREVIEW_SECS: f64 = 10.0;

const AUDIO_BITRATE: &str = "192k";
const FFPROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// A fully validated ffmpeg invocation
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPlan {
    pub op: PostprocessOp,
    pub input: PathBuf,
    pub output: PathBuf,
    /// Operation arguments; the runner adds its own global flags
    pub args: Vec<String>,
    /// Duration of the output, used to turn ffmpeg timestamps into percent
    pub expected_duration: Option<f64>,
}

fn parse_bound(value: &Option<String>, name: &str) -> AppResult<Option<f64>> {
    match value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => parse_timestamp(raw).map(Some).ok_or_else(|| {
            AppError::InvalidRequest(format!(
                "Invalid {name} time '{raw}', expected SS, MM:SS or HH:MM:SS"
            ))
        }),
    }
}

fn parse_range(
    range: &TimeRange,
    source_duration: Option<f64>,
) -> AppResult<(Option<f64>, Option<f64>)> {
    let start = parse_bound(&range.start, "start")?;
    let end = parse_bound(&range.end, "end")?;

    if let (Some(s), Some(e)) = (start, end) {
        if s >= e {
            return Err(AppError::InvalidRequest(format!(
                "Start ({s}s) must be before end ({e}s)"
            )));
        }
    }
    if let (Some(s), Some(total)) = (start, source_duration) {
        if s >= total {
            return Err(AppError::InvalidRequest(format!(
                "Start ({s}s) is past the end of the media ({total:.1}s)"
            )));
        }
    }
    Ok((start, end))
}

fn seconds_arg(value: f64) -> String {
    let rendered = format!("{value:.3}");
    rendered
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

fn stem_of(input: &Path) -> String {
    input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "media".to_string())
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Validate an operation and turn it into an ffmpeg plan
pub fn plan_postprocess(request: &ProcessRequest) -> AppResult<MediaPlan> {
    let input = &request.input;
    let stem = stem_of(input);
    let input_ext = input
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mp4".to_string());

    let (output, args, expected_duration) = match &request.op {
        PostprocessOp::Trim(range) => {
            let (start, end) = parse_range(range, request.source_duration)?;
            if start.is_none() && end.is_none() {
                return Err(AppError::InvalidRequest(
                    "Trim needs a start time, an end time or both".to_string(),
                ));
            }

            let output = request
                .output_dir
                .join(format!("{stem}_trim.{input_ext}"));
            let mut args = vec!["-i".to_string(), path_arg(input)];
            if let Some(s) = start {
                args.extend(["-ss".to_string(), seconds_arg(s)]);
            }
            if let Some(e) = end {
                args.extend(["-to".to_string(), seconds_arg(e)]);
            }
            args.push(path_arg(&output));

            let expected = match (start, end) {
                (Some(s), Some(e)) => Some(e - s),
                (None, Some(e)) => Some(e),
                (Some(s), None) => request.source_duration.map(|total| total - s),
                (None, None) => None,
            };
            (output, args, expected)
        }
        PostprocessOp::ExtractAudio(format) => {
            let mut output = request
                .output_dir
                .join(format!("{stem}.{}", format.extension()));
            if output == *input {
                output = request
                    .output_dir
                    .join(format!("{stem}_audio.{}", format.extension()));
            }

            let mut args = vec![
                "-i".to_string(),
                path_arg(input),
                "-vn".to_string(),
                "-c:a".to_string(),
                format.codec().to_string(),
            ];
            if format.extension() != "wav" {
                args.extend(["-b:a".to_string(), AUDIO_BITRATE.to_string()]);
            }
            args.push(path_arg(&output));
            (output, args, request.source_duration)
        }
        PostprocessOp::GeneratePreview(range) => {
            let (start, end) = parse_range(range, request.source_duration)?;
            match (start, end) {
                (Some(at), None) => {
                    let output = request
                        .preview_dir
                        .join(format!("{stem}_preview_{}.jpg", seconds_arg(at)));
                    let args = vec![
                        "-ss".to_string(),
                        seconds_arg(at),
                        "-i".to_string(),
                        path_arg(input),
                        "-frames:v".to_string(),
                        "1".to_string(),
                        "-q:v".to_string(),
                        "2".to_string(),
                        path_arg(&output),
                    ];
                    (output, args, None)
                }
                (start, end) => {
                    let start = start.unwrap_or(0.0);
                    let mut length = end.map(|e| e - start).unwrap_or(DEFAULT_PREVIEW_SECS);
                    if let Some(total) = request.source_duration {
                        length = length.min((total - start).max(0.0));
                    }
                    let output = request.preview_dir.join(format!("{stem}_preview.mp4"));
                    let args = vec![
                        "-ss".to_string(),
                        seconds_arg(start),
                        "-i".to_string(),
                        path_arg(input),
                        "-t".to_string(),
                        seconds_arg(length),
                        "-c:v".to_string(),
                        "libx264".to_string(),
                        "-preset".to_string(),
                        "veryfast".to_string(),
                        "-c:a".to_string(),
                        "aac".to_string(),
                        "-b:a".to_string(),
                        "128k".to_string(),
                        path_arg(&output),
                    ];
                    (output, args, Some(length))
                }
            }
        }
    };

    Ok(MediaPlan {
        op: request.op.clone(),
        input: input.clone(),
        output,
        args,
        expected_duration,
    })
}

/// ffmpeg/ffprobe subprocess runner
#[derive(Debug, Clone)]
pub struct FfmpegProcessor {
    tools: ToolPaths,
}

impl FfmpegProcessor {
    pub fn new(tools: &ToolPaths) -> Self {
        Self {
            tools: tools.clone(),
        }
    }

    fn ffmpeg(&self) -> AppResult<&Path> {
        self.tools.require(Tool::Ffmpeg)
    }

    /// Media duration in seconds as reported by ffprobe
    pub async fn probe_duration(&self, input: &Path) -> Option<f64> {
        let ffprobe = self.tools.get(Tool::Ffprobe)?;
        let mut command = Command::new(ffprobe);
        command
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(input)
            .kill_on_drop(true);

        let output = match tokio::time::timeout(FFPROBE_TIMEOUT, command.output()).await {
            Ok(Ok(output)) if output.status.success() => output,
            Ok(Ok(output)) => {
                debug!("ffprobe exited with {}", output.status);
                return None;
            }
            Ok(Err(e)) => {
                warn!("ffprobe could not be started: {}", e);
                return None;
            }
            Err(_) => {
                warn!("ffprobe timed out on {}", input.display());
                return None;
            }
        };

        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|d| d.is_finite() && *d > 0.0)
    }
}

#[async_trait]
impl MediaProcessor for FfmpegProcessor {
    fn ensure_available(&self) -> AppResult<()> {
        self.ffmpeg().map(|_| ())
    }

    #[instrument(skip(self, plan, progress, cancel), fields(op = plan.op.name()))]
    async fn process(
        &self,
        plan: &MediaPlan,
        progress: ProgressSender,
        cancel: CancellationToken,
    ) -> Result<PathBuf, ProcessError> {
        let ffmpeg = self
            .ffmpeg()
            .map_err(|e| ProcessError::ToolNotFound(e.to_string()))?;

        if let Some(parent) = plan.output.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ProcessError::Failed(format!("Cannot create {}: {e}", parent.display()))
            })?;
        }

        let expected = match plan.expected_duration {
            Some(duration) => Some(duration),
            None if matches!(plan.op, PostprocessOp::ExtractAudio(_)) => {
                self.probe_duration(&plan.input).await
            }
            None => None,
        };

        let mut command = Command::new(ffmpeg);
        command
            .args(["-y", "-hide_banner", "-nostats", "-loglevel", "error"])
            .args(["-progress", "pipe:1"])
            .args(&plan.args);

        let mut parser = FfmpegProgressParser::new(expected);
        let outcome = run_streaming(command, &cancel, None, |line: &OutputLine| {
            if line.stream == OutputStream::Stdout {
                if let Some(reading) = parser.feed(&line.text) {
                    let _ = progress.send(reading);
                }
            }
        })
        .await
        .map_err(|e| match e {
            RunError::Cancelled => ProcessError::Cancelled,
            RunError::Spawn(e) if e.kind() == std::io::ErrorKind::NotFound => {
                ProcessError::ToolNotFound(format!("ffmpeg could not be started: {e}"))
            }
            other => ProcessError::Failed(format!("ffmpeg failed: {other}")),
        })?;

        if !outcome.status.success() {
            let message = last_error_line(&outcome.stderr_tail)
                .unwrap_or_else(|| format!("ffmpeg exited with {}", outcome.status));
            return Err(ProcessError::Failed(message));
        }

        if !plan.output.exists() {
            return Err(ProcessError::Failed(format!(
                "ffmpeg finished but {} was not written",
                plan.output.display()
            )));
        }

        info!("🎞️ {} wrote {}", plan.op.name(), plan.output.display());
        Ok(plan.output.clone())
    }
}
