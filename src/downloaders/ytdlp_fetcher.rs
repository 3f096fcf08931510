//! yt-dlp backed probe and download
//!
//! The binary is driven with `--newline` so every progress update arrives
//! as its own line, and with a `--print after_move:` marker so the final
//! artifact path does not have to be guessed from log text.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::process::{run_streaming, OutputLine, OutputStream, RunError};
use super::{FetchRequest, MediaFetcher, ProgressSender};
use crate::core::config::DownloadConfig;
use crate::core::error_handling::{classify_fetch_failure, last_error_line, FetchError};
use crate::core::formats::parse_probe_output;
use crate::core::models::{AppError, AppResult, VideoInfo};
use crate::core::progress_tracker::parse_download_line;
use crate::core::tools::{Tool, ToolPaths};
use crate::utils::file_utils::sanitize_filename;

/// Prefix of the line yt-dlp prints once the artifact is in place
pub const FILE_MARKER: &str = "VIDGRAB_FILE=";

/// Tracks the artifact path announced in yt-dlp output
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ArtifactTracker {
    announced: Option<PathBuf>,
    merged: Option<PathBuf>,
    destination: Option<PathBuf>,
}

impl ArtifactTracker {
    pub fn observe(&mut self, line: &str) {
        let line = line.trim();
        if let Some(path) = line.strip_prefix(FILE_MARKER) {
            self.announced = Some(PathBuf::from(path.trim()));
        } else if let Some(rest) = line.strip_prefix("[Merger] Merging formats into ") {
            self.merged = Some(PathBuf::from(rest.trim().trim_matches('"')));
        } else if let Some(rest) = line.strip_prefix("[download] Destination: ") {
            self.destination = Some(PathBuf::from(rest.trim()));
        } else if let Some(rest) = line
            .strip_prefix("[download] ")
            .and_then(|rest| rest.strip_suffix(" has already been downloaded"))
        {
            self.destination = Some(PathBuf::from(rest.trim()));
        }
    }

    /// Best known artifact: the marker, then the merge target, then the last destination
    pub fn artifact(&self) -> Option<&Path> {
        self.announced
            .as_deref()
            .or(self.merged.as_deref())
            .or(self.destination.as_deref())
    }
}

/// yt-dlp subprocess runner
#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    tools: ToolPaths,
    ffmpeg_dir: Option<PathBuf>,
    settings: DownloadConfig,
}

impl YtDlpFetcher {
    pub fn new(tools: &ToolPaths, settings: DownloadConfig) -> Self {
        Self {
            tools: tools.clone(),
            ffmpeg_dir: tools
                .ffmpeg
                .as_deref()
                .and_then(Path::parent)
                .map(Path::to_path_buf),
            settings,
        }
    }

    fn binary(&self) -> AppResult<&Path> {
        self.tools.require(Tool::YtDlp)
    }

    pub fn probe_args(&self, url: &str) -> Vec<String> {
        vec![
            "--dump-single-json".to_string(),
            "--no-warnings".to_string(),
            "--no-playlist".to_string(),
            "--skip-download".to_string(),
            "--socket-timeout".to_string(),
            self.settings.socket_timeout_secs.to_string(),
            "--".to_string(),
            url.to_string(),
        ]
    }

    /// Output template `<dir>/<safe title>_<resolution>.%(ext)s`
    pub fn output_template(request: &FetchRequest) -> PathBuf {
        request.output_dir.join(format!(
            "{}_{}.%(ext)s",
            sanitize_filename(&request.title),
            request.format.resolution_tag()
        ))
    }

    pub fn fetch_args(&self, request: &FetchRequest) -> Vec<String> {
        let mut args = vec![
            "--newline".to_string(),
            "--progress".to_string(),
            "--no-warnings".to_string(),
            "--no-playlist".to_string(),
            "--socket-timeout".to_string(),
            self.settings.socket_timeout_secs.to_string(),
            "--retries".to_string(),
            self.settings.tool_retries.to_string(),
            "--fragment-retries".to_string(),
            self.settings.tool_retries.to_string(),
            "--user-agent".to_string(),
            self.settings.user_agent.clone(),
        ];
        if let Some(dir) = &self.ffmpeg_dir {
            args.push("--ffmpeg-location".to_string());
            args.push(dir.to_string_lossy().into_owned());
        }
        args.extend([
            "-f".to_string(),
            request.format.fetch_selector(),
            "-o".to_string(),
            Self::output_template(request).to_string_lossy().into_owned(),
            "--print".to_string(),
            format!("after_move:{FILE_MARKER}%(filepath)s"),
            "--".to_string(),
            request.url.clone(),
        ]);
        args
    }

    fn run_error_to_fetch_error(error: RunError) -> FetchError {
        match error {
            RunError::Cancelled => FetchError::Cancelled,
            RunError::Spawn(e) if e.kind() == std::io::ErrorKind::NotFound => {
                FetchError::ToolNotFound(format!("yt-dlp could not be started: {e}"))
            }
            RunError::Spawn(e) => FetchError::Fatal(format!("yt-dlp could not be started: {e}")),
            RunError::IdleTimeout(limit) => FetchError::Transient(format!(
                "Download timed out: no output from yt-dlp for {}s",
                limit.as_secs()
            )),
            RunError::Wait(e) => FetchError::Transient(format!("Lost track of yt-dlp: {e}")),
        }
    }
}

#[async_trait]
impl MediaFetcher for YtDlpFetcher {
    fn ensure_available(&self) -> AppResult<()> {
        self.binary().map(|_| ())
    }

    #[instrument(skip(self))]
    async fn probe(&self, url: &str) -> AppResult<VideoInfo> {
        let binary = self.binary()?;
        let mut command = Command::new(binary);
        command.args(self.probe_args(url));

        let mut stdout = String::new();
        let never = CancellationToken::new();
        let run = run_streaming(command, &never, None, |line: &OutputLine| {
            if line.stream == OutputStream::Stdout {
                stdout.push_str(&line.text);
                stdout.push('\n');
            }
        });

        let outcome = match tokio::time::timeout(self.settings.probe_timeout(), run).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(RunError::Spawn(e))) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::ToolNotFound(format!(
                    "yt-dlp could not be started: {e}"
                )))
            }
            Ok(Err(e)) => return Err(AppError::Probe(e.to_string())),
            Err(_) => {
                warn!("⏰ Probe timed out for {}", url);
                return Err(AppError::Probe(format!(
                    "Timed out after {}s while reading metadata",
                    self.settings.probe_timeout_secs
                )));
            }
        };

        if !outcome.status.success() {
            let message = last_error_line(&outcome.stderr_tail)
                .unwrap_or_else(|| format!("yt-dlp exited with {}", outcome.status));
            return Err(AppError::Probe(message));
        }

        let info = parse_probe_output(&stdout)?;
        info!(
            "🔍 Probed '{}' ({} formats)",
            info.title,
            info.available_formats.len()
        );
        Ok(info)
    }

    #[instrument(skip(self, request, progress, cancel), fields(job_id = %request.job_id))]
    async fn fetch(
        &self,
        request: &FetchRequest,
        progress: ProgressSender,
        cancel: CancellationToken,
    ) -> Result<PathBuf, FetchError> {
        let binary = self
            .binary()
            .map_err(|e| FetchError::ToolNotFound(e.to_string()))?;

        tokio::fs::create_dir_all(&request.output_dir)
            .await
            .map_err(|e| {
                FetchError::Fatal(format!(
                    "Cannot create output directory {}: {e}",
                    request.output_dir.display()
                ))
            })?;

        let mut command = Command::new(binary);
        command.args(self.fetch_args(request));
        debug!("Running yt-dlp for {}", request.url);

        let mut tracker = ArtifactTracker::default();
        let outcome = run_streaming(
            command,
            &cancel,
            Some(self.settings.idle_timeout()),
            |line: &OutputLine| {
                if let Some(reading) = parse_download_line(&line.text) {
                    // The receiver only goes away when the job is gone.
                    let _ = progress.send(reading);
                } else {
                    tracker.observe(&line.text);
                }
            },
        )
        .await
        .map_err(Self::run_error_to_fetch_error)?;

        if !outcome.status.success() {
            return Err(classify_fetch_failure(
                outcome.status.code(),
                &outcome.stderr_tail,
            ));
        }

        match tracker.artifact() {
            Some(path) if path.exists() => Ok(path.to_path_buf()),
            Some(path) => Err(FetchError::Fatal(format!(
                "yt-dlp reported {} but the file does not exist",
                path.display()
            ))),
            None => Err(FetchError::Fatal(
                "yt-dlp finished without reporting an output file".to_string(),
            )),
        }
    }
}
