//! In-process fakes for the runner traits, shared by unit tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{FetchRequest, MediaFetcher, MediaPlan, MediaProcessor, ProgressSender};
use crate::core::error_handling::{FetchError, ProcessError};
use crate::core::models::{AppError, AppResult, AvailableFormat, JobProgress, VideoInfo};

/// Behaviour of one scripted fetch attempt
#[derive(Debug, Clone)]
pub enum Step {
    /// Report progress and write `<title>_<res>.mp4`
    Succeed,
    /// Report some progress, then fail transiently
    Timeout,
    Fatal(&'static str),
    /// Report progress and block until cancelled
    Hang,
}

pub struct ScriptedFetcher {
    available: bool,
    steps: Mutex<VecDeque<Step>>,
    pub probe_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    pub running: AtomicBool,
}

impl ScriptedFetcher {
    fn build(steps: Vec<Step>, available: bool) -> Arc<Self> {
        Arc::new(Self {
            available,
            steps: Mutex::new(steps.into()),
            probe_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            running: AtomicBool::new(false),
        })
    }

    /// Attempts follow `steps` in order, then succeed
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Self::build(steps, true)
    }

    pub fn unavailable() -> Arc<Self> {
        Self::build(Vec::new(), false)
    }

    pub fn probes(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

fn offered(id: &str, height: u32) -> AvailableFormat {
    AvailableFormat {
        format_id: id.to_string(),
        ext: "mp4".to_string(),
        height: Some(height),
        has_video: true,
        has_audio: true,
        bitrate_kbps: None,
        filesize: None,
        note: None,
        label: format!("{height}p"),
    }
}

fn reading(percent: f64) -> JobProgress {
    JobProgress {
        percent,
        speed_bytes_per_sec: 1024.0,
        eta_seconds: 1.0,
    }
}

#[async_trait]
impl MediaFetcher for ScriptedFetcher {
    fn ensure_available(&self) -> AppResult<()> {
        if self.available {
            Ok(())
        } else {
            Err(AppError::ToolNotFound("yt-dlp".to_string()))
        }
    }

    async fn probe(&self, _url: &str) -> AppResult<VideoInfo> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(VideoInfo {
            id: "video1".to_string(),
            title: "Sample Clip".to_string(),
            duration: Some(30.0),
            thumbnail: None,
            webpage_url: None,
            available_formats: vec![offered("137", 1080), offered("22", 720)],
        })
    }

    async fn fetch(
        &self,
        request: &FetchRequest,
        progress: ProgressSender,
        cancel: CancellationToken,
    ) -> Result<PathBuf, FetchError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().pop_front().unwrap_or(Step::Succeed);

        match step {
            Step::Succeed => {
                for percent in [25.0, 75.0, 100.0] {
                    let _ = progress.send(reading(percent));
                }
                std::fs::create_dir_all(&request.output_dir).unwrap();
                let path = request.output_dir.join(format!(
                    "{}_{}.mp4",
                    request.title,
                    request.format.resolution_tag()
                ));
                std::fs::write(&path, b"video").unwrap();
                Ok(path)
            }
            Step::Timeout => {
                let _ = progress.send(reading(40.0));
                Err(FetchError::Transient("Read timed out".to_string()))
            }
            Step::Fatal(message) => Err(FetchError::Fatal(message.to_string())),
            Step::Hang => {
                self.running.store(true, Ordering::SeqCst);
                let _ = progress.send(reading(10.0));
                cancel.cancelled().await;
                self.running.store(false, Ordering::SeqCst);
                Err(FetchError::Cancelled)
            }
        }
    }
}

/// Writes `plan.output`, optionally waiting on `gate` first
#[derive(Default)]
pub struct ScriptedProcessor {
    pub gate: Option<Arc<Notify>>,
    pub fail: bool,
}

#[async_trait]
impl MediaProcessor for ScriptedProcessor {
    fn ensure_available(&self) -> AppResult<()> {
        Ok(())
    }

    async fn process(
        &self,
        plan: &MediaPlan,
        progress: ProgressSender,
        cancel: CancellationToken,
    ) -> Result<PathBuf, ProcessError> {
        let _ = progress.send(JobProgress {
            percent: 50.0,
            ..JobProgress::default()
        });
        if let Some(gate) = &self.gate {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProcessError::Cancelled),
                _ = gate.notified() => {}
            }
        }
        if self.fail {
            return Err(ProcessError::Failed(
                "Invalid data found when processing input".to_string(),
            ));
        }
        if let Some(parent) = plan.output.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&plan.output, b"processed").unwrap();
        Ok(plan.output.clone())
    }
}
