//! Fetch failure classification and retry backoff
//!
//! yt-dlp and ffmpeg only report failures through exit codes and free-form
//! stderr text. This module turns that text into typed errors and decides how
//! long to wait before the next attempt.
//!
//! Key features:
//! - Exponential backoff with a delay cap and optional jitter
//! - Transient / fatal classification of yt-dlp stderr output

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::core::models::{JobError, JobErrorKind};

/// Default number of fetch attempts, including the first one
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay for exponential backoff (1 second)
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Maximum delay cap for exponential backoff (30 seconds)
pub const MAX_DELAY_CAP: Duration = Duration::from_secs(30);

/// Failure of a single fetch attempt
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),

    #[error("{0}")]
    ToolNotFound(String),

    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }

    /// Job error recorded after this failure ended the job
    pub fn into_job_error(self, retry_count: u32, retries_exhausted: bool) -> JobError {
        match self {
            FetchError::Cancelled => JobError::cancelled(retry_count),
            FetchError::ToolNotFound(message) => {
                JobError::new(JobErrorKind::ToolNotFound, message, retry_count)
            }
            FetchError::Transient(message) if retries_exhausted => JobError::exhausted(
                format!("Gave up after {} attempts: {}", retry_count + 1, message),
                retry_count,
            ),
            FetchError::Transient(message) | FetchError::Fatal(message) => {
                JobError::new(JobErrorKind::FatalFetch, message, retry_count)
            }
        }
    }
}

/// Failure of a postprocess step
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProcessError {
    #[error("{0}")]
    Failed(String),

    #[error("{0}")]
    ToolNotFound(String),

    #[error("cancelled")]
    Cancelled,
}

impl ProcessError {
    pub fn into_job_error(self, retry_count: u32) -> JobError {
        match self {
            ProcessError::Cancelled => JobError::cancelled(retry_count),
            ProcessError::ToolNotFound(message) => {
                JobError::new(JobErrorKind::ToolNotFound, message, retry_count)
            }
            ProcessError::Failed(message) => {
                JobError::new(JobErrorKind::Postprocess, message, retry_count)
            }
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Fraction of the delay used as +/- jitter; zero disables it
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: MAX_DELAY_CAP,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay_ms = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let mut delay = Duration::from_millis(delay_ms.min(u64::MAX as f64) as u64);

        // Apply maximum delay cap
        if delay > self.max_delay {
            delay = self.max_delay;
        }

        if self.jitter_factor > 0.0 {
            let jitter =
                delay.as_millis() as f64 * self.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
            let jittered = delay.as_millis() as i64 + jitter as i64;
            delay = Duration::from_millis(jittered.max(0) as u64).min(self.max_delay);
        }

        delay
    }

    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

const FATAL_MARKERS: &[&str] = &[
    "unsupported url",
    "requested format",
    "not available",
    "video unavailable",
    "private video",
    "is not a valid url",
    "http error 403",
    "http error 404",
    "sign in to confirm",
    "members-only",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "timed out",
    "timeout",
    "connection reset",
    "connection refused",
    "connection aborted",
    "temporary failure",
    "network is unreachable",
    "http error 429",
    "http error 5",
    "incomplete read",
    "unable to download webpage",
    "remote end closed",
];

/// Classify a failed yt-dlp run from its exit code and stderr tail.
///
/// Fatal markers win over transient ones. Unrecognised failures count as
/// transient; the retry budget bounds them.
pub fn classify_fetch_failure(exit_code: Option<i32>, stderr: &str) -> FetchError {
    let message = last_error_line(stderr).unwrap_or_else(|| match exit_code {
        Some(code) => format!("yt-dlp exited with status {code}"),
        None => "yt-dlp terminated by signal".to_string(),
    });

    let lowered = stderr.to_lowercase();
    if FATAL_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        return FetchError::Fatal(message);
    }
    if TRANSIENT_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        return FetchError::Transient(message);
    }
    FetchError::Transient(message)
}

/// Most relevant line of tool output, preferring `ERROR:` lines
pub fn last_error_line(output: &str) -> Option<String> {
    let lines: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    lines
        .iter()
        .rev()
        .find(|line| line.starts_with("ERROR:"))
        .or_else(|| lines.last())
        .map(|line| line.trim_start_matches("ERROR:").trim().to_string())
}
