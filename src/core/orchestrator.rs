//! Download orchestration
//!
//! The orchestrator owns every job for its whole lifetime. Callers get
//! snapshots; only the background workers spawned here mutate job records.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::core::config::AppConfig;
use crate::core::error_handling::RetryPolicy;
use crate::core::models::{
    AppError, AppResult, DownloadJob, JobError, JobProgress, JobState, PostprocessOp, VideoInfo,
};
use crate::core::registry::{spawn_eviction_loop, JobRegistry, ProbeCache};
use crate::downloaders::{
    plan_postprocess, FetchRequest, MediaFetcher, MediaPlan, MediaProcessor, ProcessRequest,
};
use crate::utils::validation::validate_source_url;

/// Orchestrator tuning derived from `AppConfig`
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub output_dir: PathBuf,
    pub preview_dir: PathBuf,
    pub max_concurrent_jobs: usize,
    pub probe_ttl: Duration,
    pub retry: RetryPolicy,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            output_dir: config.download.output_directory.clone(),
            preview_dir: config.download.preview_directory.clone(),
            max_concurrent_jobs: config.download.max_concurrent_jobs.max(1),
            probe_ttl: config.registry.probe_ttl(),
            retry: config.retry.policy(),
        }
    }
}

struct Inner {
    registry: JobRegistry,
    probes: ProbeCache,
    fetcher: Arc<dyn MediaFetcher>,
    processor: Arc<dyn MediaProcessor>,
    settings: OrchestratorSettings,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
}

/// Runs downloads and postprocess steps in the background
#[derive(Clone)]
pub struct DownloadOrchestrator {
    inner: Arc<Inner>,
}

impl DownloadOrchestrator {
    pub fn new(
        fetcher: Arc<dyn MediaFetcher>,
        processor: Arc<dyn MediaProcessor>,
        settings: OrchestratorSettings,
    ) -> Self {
        info!(
            "🔧 Download orchestrator ready (max {} concurrent jobs, {} attempts)",
            settings.max_concurrent_jobs, settings.retry.max_attempts
        );
        Self {
            inner: Arc::new(Inner {
                registry: JobRegistry::new(),
                probes: ProbeCache::new(),
                fetcher,
                processor,
                slots: Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1))),
                settings,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Read metadata and offered formats for `source_url`.
    ///
    /// Blocks the caller for at most the configured probe timeout.
    #[instrument(skip(self))]
    pub async fn probe(&self, source_url: &str) -> AppResult<VideoInfo> {
        let url = source_url.trim();
        validate_source_url(url)?;
        self.inner.fetcher.ensure_available()?;

        let info = self.inner.fetcher.probe(url).await?;
        if info.available_formats.is_empty() {
            return Err(AppError::Probe(
                "No downloadable formats were offered for this URL".to_string(),
            ));
        }
        self.inner.probes.store(url, info.clone());
        Ok(info)
    }

    /// Create a job and schedule it; returns the job id immediately.
    ///
    /// Uses a cached probe when one is fresh, probing first otherwise.
    #[instrument(skip(self))]
    pub async fn start(&self, source_url: &str, selected_format: &str) -> AppResult<String> {
        let url = source_url.trim();
        validate_source_url(url)?;
        self.inner.fetcher.ensure_available()?;

        let info = match self.inner.probes.get(url, self.inner.settings.probe_ttl) {
            Some(info) => info,
            None => self.probe(url).await?,
        };

        let format = info
            .resolve_format(selected_format)
            .cloned()
            .ok_or_else(|| AppError::InvalidFormat(selected_format.trim().to_string()))?;

        let job = DownloadJob::new(url, selected_format.trim(), &format.format_id, &info.title);
        let job_id = job.id.clone();
        let cancel = self.inner.registry.insert(job, info.duration);

        let request = FetchRequest {
            job_id: job_id.clone(),
            url: url.to_string(),
            title: info.title.clone(),
            format,
            output_dir: self.inner.settings.output_dir.clone(),
        };
        tokio::spawn(run_fetch(Arc::clone(&self.inner), request, cancel));

        info!("🚀 Queued job {} for '{}' ({})", job_id, info.title, selected_format);
        Ok(job_id)
    }

    /// Non-blocking snapshot of a job
    pub fn get_status(&self, job_id: &str) -> AppResult<DownloadJob> {
        self.inner.registry.snapshot(job_id)
    }

    pub fn list_jobs(&self) -> Vec<DownloadJob> {
        self.inner.registry.list()
    }

    /// Request cancellation; a no-op for finished jobs.
    ///
    /// The worker kills its subprocess and records `Failed` with a
    /// cancellation reason once it observes the request.
    pub fn cancel(&self, job_id: &str) -> AppResult<DownloadJob> {
        let job = self.inner.registry.snapshot(job_id)?;
        if job.state.is_terminal() {
            debug!("Job {} already finished, nothing to cancel", job_id);
            return Ok(job);
        }

        self.inner.registry.cancel_token(job_id)?.cancel();
        info!("🛑 Cancellation requested for job {}", job_id);
        Ok(job)
    }

    /// Start a postprocess step on a completed job.
    ///
    /// The job moves to `Postprocessing` before this returns, so a second
    /// request is rejected until the step finishes.
    #[instrument(skip(self, op), fields(op = op.name()))]
    pub fn postprocess(&self, job_id: &str, op: PostprocessOp) -> AppResult<DownloadJob> {
        let job = self.inner.registry.snapshot(job_id)?;
        if job.state != JobState::Completed {
            return Err(AppError::InvalidState(format!(
                "job {job_id} is {:?}; postprocessing needs a completed download",
                job.state
            )));
        }
        self.inner.processor.ensure_available()?;

        let (artifact, duration) = self.inner.registry.artifact(job_id)?;
        let input = artifact.ok_or_else(|| {
            AppError::InvalidState(format!("job {job_id} has no downloaded file"))
        })?;

        let plan = plan_postprocess(&ProcessRequest {
            op,
            input,
            source_duration: duration,
            output_dir: self.inner.settings.output_dir.clone(),
            preview_dir: self.inner.settings.preview_dir.clone(),
        })?;

        let (job, cancel) = self.inner.registry.begin_postprocess(job_id)?;
        tokio::spawn(run_postprocess(
            Arc::clone(&self.inner),
            job_id.to_string(),
            plan,
            cancel,
            job.retry_count(),
        ));
        Ok(job)
    }

    /// Path of a completed job's artifact
    pub fn artifact_path(&self, job_id: &str) -> AppResult<PathBuf> {
        let job = self.inner.registry.snapshot(job_id)?;
        match (job.state, job.output_path, job.error) {
            (JobState::Completed, Some(path), _) => Ok(path),
            (JobState::Failed, _, Some(error)) => Err(error.into()),
            (state, _, _) => Err(AppError::InvalidState(format!(
                "job {job_id} is {state:?}; no file is available"
            ))),
        }
    }

    pub fn remove(&self, job_id: &str) -> AppResult<DownloadJob> {
        let job = self.inner.registry.remove(job_id)?;
        info!("🗑️ Removed job {}", job_id);
        Ok(job)
    }

    pub fn clear_finished(&self) -> usize {
        let removed = self.inner.registry.clear_finished();
        info!("🧹 Cleared {} finished jobs", removed);
        removed
    }

    /// Poll until the job reaches `Completed` or `Failed`
    pub async fn wait_until_settled(
        &self,
        job_id: &str,
        poll_interval: Duration,
    ) -> AppResult<DownloadJob> {
        loop {
            let job = self.get_status(job_id)?;
            if job.state.is_terminal() {
                return Ok(job);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Start the background sweeper that evicts finished jobs and stale probes
    pub fn spawn_sweeper(&self, job_ttl: Duration, interval: Duration) -> JoinHandle<()> {
        spawn_eviction_loop(
            self.inner.registry.clone(),
            self.inner.probes.clone(),
            job_ttl,
            self.inner.settings.probe_ttl,
            interval,
            self.inner.shutdown.child_token(),
        )
    }

    /// Cancel all active jobs and stop the sweeper
    pub fn shutdown(&self) {
        let cancelled = self.inner.registry.cancel_all();
        self.inner.shutdown.cancel();
        info!("👋 Orchestrator shutting down, cancelled {} active jobs", cancelled);
    }
}

/// Drive `work` to completion while applying its progress readings in order
async fn drive_with_progress<T>(
    registry: &JobRegistry,
    job_id: &str,
    mut progress: mpsc::UnboundedReceiver<JobProgress>,
    work: impl Future<Output = T>,
) -> T {
    tokio::pin!(work);
    let result = loop {
        tokio::select! {
            biased;
            Some(reading) = progress.recv() => registry.record_progress(job_id, reading),
            result = &mut work => break result,
        }
    };
    while let Ok(reading) = progress.try_recv() {
        registry.record_progress(job_id, reading);
    }
    result
}

fn record_failure(registry: &JobRegistry, job_id: &str, error: JobError) {
    let kind = error.kind;
    match registry.fail(job_id, error) {
        Ok(job) => warn!(
            "❌ Job {} failed ({:?}): {}",
            job_id,
            kind,
            job.error.map(|e| e.message).unwrap_or_default()
        ),
        Err(e) => debug!("Could not record failure for job {}: {}", job_id, e),
    }
}

async fn run_fetch(inner: Arc<Inner>, request: FetchRequest, cancel: CancellationToken) {
    let job_id = request.job_id.clone();
    let registry = &inner.registry;
    let policy = &inner.settings.retry;

    // Wait for a slot; the job stays Pending and cancellable meanwhile.
    let _permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            record_failure(registry, &job_id, JobError::cancelled(0));
            return;
        }
        permit = Arc::clone(&inner.slots).acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                error!("Job slots closed before job {} could start", job_id);
                return;
            }
        },
    };

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            record_failure(registry, &job_id, JobError::cancelled(attempt - 1));
            return;
        }
        if let Err(e) = registry.begin_attempt(&job_id, attempt) {
            debug!("Job {} no longer runnable: {}", job_id, e);
            return;
        }
        info!(
            "⬇️ Job {} attempt {}/{}",
            job_id, attempt, policy.max_attempts
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let outcome = drive_with_progress(
            registry,
            &job_id,
            rx,
            inner.fetcher.fetch(&request, tx, cancel.clone()),
        )
        .await;

        let error = match outcome {
            Ok(path) => {
                match registry.complete(&job_id, path, None) {
                    Ok(job) => info!(
                        "✅ Job {} completed after {} attempt(s): {:?}",
                        job_id, attempt, job.output_path
                    ),
                    Err(e) => debug!("Could not record completion for job {}: {}", job_id, e),
                }
                return;
            }
            Err(error) => error,
        };

        if !(error.is_retryable() && policy.has_attempts_left(attempt)) {
            let exhausted = error.is_retryable();
            record_failure(registry, &job_id, error.into_job_error(attempt - 1, exhausted));
            return;
        }

        let delay = policy.delay_for(attempt);
        warn!(
            "🔄 Job {} attempt {} failed ({}), retrying in {:?}",
            job_id, attempt, error, delay
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                record_failure(registry, &job_id, JobError::cancelled(attempt - 1));
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn run_postprocess(
    inner: Arc<Inner>,
    job_id: String,
    plan: MediaPlan,
    cancel: CancellationToken,
    retry_count: u32,
) {
    let registry = &inner.registry;
    info!("🎬 Job {} postprocess {} started", job_id, plan.op.name());

    let (tx, rx) = mpsc::unbounded_channel();
    let outcome = drive_with_progress(
        registry,
        &job_id,
        rx,
        inner.processor.process(&plan, tx, cancel.clone()),
    )
    .await;

    match outcome {
        Ok(path) => match registry.complete(&job_id, path, plan.expected_duration) {
            Ok(job) => info!(
                "✅ Job {} postprocess {} finished: {:?}",
                job_id,
                plan.op.name(),
                job.output_path
            ),
            Err(e) => debug!("Could not record postprocess result for {}: {}", job_id, e),
        },
        Err(error) => record_failure(registry, &job_id, error.into_job_error(retry_count)),
    }
}
