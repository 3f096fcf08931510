//! In-memory job registry and probe cache
//!
//! The registry is the only shared mutable state between the HTTP surface
//! and the background workers. Every mutation happens under the entry's
//! shard lock, so a reader always sees a whole job record.

use chrono::Utc;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::models::{
    AppError, AppResult, DownloadJob, JobError, JobProgress, JobState, VideoInfo,
};

/// Registry entry: the public record plus worker-side bookkeeping
#[derive(Debug)]
struct JobEntry {
    job: DownloadJob,
    cancel: CancellationToken,
    /// Last good artifact; survives while the public `output_path` is cleared
    artifact: Option<PathBuf>,
    duration: Option<f64>,
    finished: Option<Instant>,
}

/// Shared registry of download jobs
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<DashMap<String, JobEntry>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new job and return its cancellation token
    pub fn insert(&self, job: DownloadJob, duration: Option<f64>) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.jobs.insert(
            job.id.clone(),
            JobEntry {
                job,
                cancel: cancel.clone(),
                artifact: None,
                duration,
                finished: None,
            },
        );
        cancel
    }

    pub fn snapshot(&self, job_id: &str) -> AppResult<DownloadJob> {
        self.jobs
            .get(job_id)
            .map(|entry| entry.job.clone())
            .ok_or_else(|| AppError::NotFound(job_id.to_string()))
    }

    /// All jobs, newest first
    pub fn list(&self) -> Vec<DownloadJob> {
        let mut jobs: Vec<DownloadJob> = self.jobs.iter().map(|e| e.job.clone()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn artifact(&self, job_id: &str) -> AppResult<(Option<PathBuf>, Option<f64>)> {
        self.jobs
            .get(job_id)
            .map(|entry| (entry.artifact.clone(), entry.duration))
            .ok_or_else(|| AppError::NotFound(job_id.to_string()))
    }

    pub fn cancel_token(&self, job_id: &str) -> AppResult<CancellationToken> {
        self.jobs
            .get(job_id)
            .map(|entry| entry.cancel.clone())
            .ok_or_else(|| AppError::NotFound(job_id.to_string()))
    }

    /// Apply a state change under the entry lock.
    ///
    /// Returns `InvalidState` when the transition is not allowed. Keeps
    /// `output_path` set exactly while the job is `Completed`.
    fn transition(
        &self,
        job_id: &str,
        next: JobState,
        update: impl FnOnce(&mut JobEntry),
    ) -> AppResult<DownloadJob> {
        let mut entry = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| AppError::NotFound(job_id.to_string()))?;

        let current = entry.job.state;
        if !current.can_transition_to(next) {
            return Err(AppError::InvalidState(format!(
                "job {job_id} cannot move from {current:?} to {next:?}"
            )));
        }

        update(&mut entry);
        let now = Utc::now();
        entry.job.state = next;
        entry.job.updated_at = now;
        if next == JobState::Completed {
            entry.job.output_path = entry.artifact.clone();
        } else {
            entry.job.output_path = None;
        }
        if next != JobState::Failed {
            entry.job.error = None;
        }
        if next.is_terminal() {
            entry.job.finished_at = Some(now);
            entry.finished = Some(Instant::now());
        } else {
            entry.job.finished_at = None;
            entry.finished = None;
        }

        Ok(entry.job.clone())
    }

    /// Enter `Fetching` for attempt number `attempt`, resetting progress
    pub fn begin_attempt(&self, job_id: &str, attempt: u32) -> AppResult<DownloadJob> {
        self.transition(job_id, JobState::Fetching, |entry| {
            entry.job.attempt = attempt;
            entry.job.progress = JobProgress::default();
        })
    }

    /// Enter `Postprocessing` with a fresh cancellation token.
    ///
    /// Fails with `InvalidState` unless the job is `Completed`.
    pub fn begin_postprocess(&self, job_id: &str) -> AppResult<(DownloadJob, CancellationToken)> {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let job = self.transition(job_id, JobState::Postprocessing, move |entry| {
            entry.cancel = token;
            entry.job.progress = JobProgress::default();
        })?;
        Ok((job, cancel))
    }

    /// Enter `Completed` with a new artifact.
    ///
    /// `duration` replaces the known media duration when the artifact's
    /// length differs from the source (a trimmed clip, for instance).
    pub fn complete(
        &self,
        job_id: &str,
        artifact: PathBuf,
        duration: Option<f64>,
    ) -> AppResult<DownloadJob> {
        self.transition(job_id, JobState::Completed, |entry| {
            entry.artifact = Some(artifact);
            if duration.is_some() {
                entry.duration = duration;
            }
            entry.job.progress = JobProgress::completed();
        })
    }

    pub fn fail(&self, job_id: &str, error: JobError) -> AppResult<DownloadJob> {
        self.transition(job_id, JobState::Failed, |entry| {
            entry.job.error = Some(error);
            entry.job.progress.speed_bytes_per_sec = 0.0;
            entry.job.progress.eta_seconds = 0.0;
        })
    }

    /// Record a progress reading; ignored unless the job is actively running
    pub fn record_progress(&self, job_id: &str, reading: JobProgress) {
        if let Some(mut entry) = self.jobs.get_mut(job_id) {
            if matches!(
                entry.job.state,
                JobState::Fetching | JobState::Postprocessing
            ) {
                entry.job.progress = entry.job.progress.advance(reading);
                entry.job.updated_at = Utc::now();
            }
        }
    }

    /// Remove a job, cancelling it first if it is still running
    pub fn remove(&self, job_id: &str) -> AppResult<DownloadJob> {
        let (_, entry) = self
            .jobs
            .remove(job_id)
            .ok_or_else(|| AppError::NotFound(job_id.to_string()))?;
        if entry.job.state.is_active() {
            entry.cancel.cancel();
        }
        Ok(entry.job)
    }

    /// Drop every finished job; returns how many were removed
    pub fn clear_finished(&self) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, entry| entry.job.state.is_active());
        before.saturating_sub(self.jobs.len())
    }

    /// Drop finished jobs older than `ttl`; active jobs are never evicted
    pub fn evict_expired(&self, ttl: Duration) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, entry| match entry.finished {
            Some(finished) if entry.job.state.is_terminal() => finished.elapsed() < ttl,
            _ => true,
        });
        let evicted = before.saturating_sub(self.jobs.len());
        if evicted > 0 {
            debug!("🧹 Evicted {} expired jobs", evicted);
        }
        evicted
    }

    /// Signal cancellation to every active job
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for entry in self.jobs.iter() {
            if entry.job.state.is_active() {
                entry.cancel.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }
}

#[derive(Debug, Clone)]
struct CachedProbe {
    info: VideoInfo,
    stored: Instant,
}

/// Recent probe results keyed by source URL
#[derive(Debug, Clone, Default)]
pub struct ProbeCache {
    entries: Arc<DashMap<String, CachedProbe>>,
}

impl ProbeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, url: &str, info: VideoInfo) {
        self.entries.insert(
            url.to_string(),
            CachedProbe {
                info,
                stored: Instant::now(),
            },
        );
    }

    pub fn get(&self, url: &str, ttl: Duration) -> Option<VideoInfo> {
        self.entries
            .get(url)
            .filter(|cached| cached.stored.elapsed() < ttl)
            .map(|cached| cached.info.clone())
    }

    pub fn evict_expired(&self, ttl: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, cached| cached.stored.elapsed() < ttl);
        before.saturating_sub(self.entries.len())
    }
}

/// Periodically evict finished jobs and stale probes until `shutdown` fires
pub fn spawn_eviction_loop(
    jobs: JobRegistry,
    probes: ProbeCache,
    job_ttl: Duration,
    probe_ttl: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "🧹 Registry sweeper started (job ttl {:?}, probe ttl {:?})",
            job_ttl, probe_ttl
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let jobs_evicted = jobs.evict_expired(job_ttl);
                    let probes_evicted = probes.evict_expired(probe_ttl);
                    if jobs_evicted + probes_evicted > 0 {
                        debug!(
                            "Sweep removed {} jobs and {} probes",
                            jobs_evicted, probes_evicted
                        );
                    }
                }
            }
        }
        warn!("Registry sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::JobErrorKind;

    fn new_job(registry: &JobRegistry) -> String {
        let job = DownloadJob::new("https://example.com/v", "720p", "22", "Clip");
        let id = job.id.clone();
        registry.insert(job, Some(10.0));
        id
    }

    fn finish(registry: &JobRegistry, id: &str) {
        registry.begin_attempt(id, 1).unwrap();
        registry.complete(id, PathBuf::from("/tmp/out.mp4"), None).unwrap();
    }

    #[test]
    fn test_output_path_only_when_completed() {
        let registry = JobRegistry::new();
        let id = new_job(&registry);

        let job = registry.begin_attempt(&id, 1).unwrap();
        assert_eq!(job.state, JobState::Fetching);
        assert!(job.output_path.is_none());

        let job = registry.complete(&id, PathBuf::from("/tmp/out.mp4"), None).unwrap();
        assert_eq!(job.output_path, Some(PathBuf::from("/tmp/out.mp4")));
        assert_eq!(job.progress.percent, 100.0);
        assert!(job.finished_at.is_some());

        let (job, _) = registry.begin_postprocess(&id).unwrap();
        assert_eq!(job.state, JobState::Postprocessing);
        assert!(job.output_path.is_none());
        assert_eq!(job.progress.percent, 0.0);

        let job = registry
            .fail(&id, JobError::new(JobErrorKind::Postprocess, "boom", 0))
            .unwrap();
        assert!(job.output_path.is_none());
        assert_eq!(job.error.unwrap().message, "boom");
    }

    #[test]
    fn test_backwards_transition_rejected() {
        let registry = JobRegistry::new();
        let id = new_job(&registry);
        finish(&registry, &id);

        assert!(matches!(
            registry.begin_attempt(&id, 2),
            Err(AppError::InvalidState(_))
        ));
        assert!(matches!(
            registry.fail(&id, JobError::cancelled(0)),
            Err(AppError::InvalidState(_))
        ));
        assert_eq!(registry.snapshot(&id).unwrap().state, JobState::Completed);
    }

    #[test]
    fn test_progress_monotonic_and_reset_per_attempt() {
        let registry = JobRegistry::new();
        let id = new_job(&registry);

        registry.record_progress(
            &id,
            JobProgress {
                percent: 30.0,
                ..JobProgress::default()
            },
        );
        assert_eq!(registry.snapshot(&id).unwrap().progress.percent, 0.0);

        registry.begin_attempt(&id, 1).unwrap();
        registry.record_progress(
            &id,
            JobProgress {
                percent: 30.0,
                ..JobProgress::default()
            },
        );
        registry.record_progress(
            &id,
            JobProgress {
                percent: 20.0,
                ..JobProgress::default()
            },
        );
        assert_eq!(registry.snapshot(&id).unwrap().progress.percent, 30.0);

        let job = registry.begin_attempt(&id, 2).unwrap();
        assert_eq!(job.progress.percent, 0.0);
        assert_eq!(job.attempt, 2);
    }

    #[test]
    fn test_unknown_job_is_not_found() {
        let registry = JobRegistry::new();
        assert!(matches!(
            registry.snapshot("missing"),
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            registry.remove("missing"),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn test_eviction_keeps_active_jobs() {
        let registry = JobRegistry::new();
        let active = new_job(&registry);
        let finished = new_job(&registry);
        finish(&registry, &finished);

        assert_eq!(registry.evict_expired(Duration::from_secs(3600)), 0);
        assert_eq!(registry.evict_expired(Duration::ZERO), 1);
        assert!(registry.snapshot(&active).is_ok());
        assert!(registry.snapshot(&finished).is_err());
    }

    #[test]
    fn test_clear_finished_and_remove() {
        let registry = JobRegistry::new();
        let active = new_job(&registry);
        let finished = new_job(&registry);
        finish(&registry, &finished);

        assert_eq!(registry.clear_finished(), 1);
        assert_eq!(registry.len(), 1);

        let token = registry.cancel_token(&active).unwrap();
        registry.remove(&active).unwrap();
        assert!(token.is_cancelled());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_postprocess_gets_fresh_token() {
        let registry = JobRegistry::new();
        let id = new_job(&registry);
        let fetch_token = registry.cancel_token(&id).unwrap();
        finish(&registry, &id);
        fetch_token.cancel();

        let (_, token) = registry.begin_postprocess(&id).unwrap();
        assert!(!token.is_cancelled());
        assert!(!registry.cancel_token(&id).unwrap().is_cancelled());
    }

    #[test]
    fn test_probe_cache_ttl() {
        let cache = ProbeCache::new();
        let info = VideoInfo {
            id: "abc".to_string(),
            title: "Clip".to_string(),
            duration: None,
            thumbnail: None,
            webpage_url: None,
            available_formats: Vec::new(),
        };
        cache.store("https://example.com/v", info.clone());

        assert_eq!(
            cache.get("https://example.com/v", Duration::from_secs(60)),
            Some(info)
        );
        assert!(cache.get("https://example.com/v", Duration::ZERO).is_none());
        assert_eq!(cache.evict_expired(Duration::ZERO), 1);
    }

    #[tokio::test]
    async fn test_eviction_loop_stops_on_shutdown() {
        let registry = JobRegistry::new();
        let finished = new_job(&registry);
        finish(&registry, &finished);

        let shutdown = CancellationToken::new();
        let handle = spawn_eviction_loop(
            registry.clone(),
            ProbeCache::new(),
            Duration::ZERO,
            Duration::ZERO,
            Duration::from_millis(10),
            shutdown.clone(),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.is_empty());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
