//! Core business logic module
//!
//! This module contains the domain models, the job registry and the
//! download orchestrator that drives yt-dlp and ffmpeg.

pub mod config;
pub mod error_handling;
pub mod formats;
pub mod models;
pub mod orchestrator;
pub mod progress_tracker;
pub mod registry;
pub mod tools;

// Re-export commonly used types
pub use config::AppConfig;
pub use models::{AppError, AppResult, DownloadJob, JobState, PostprocessOp, VideoInfo};
pub use orchestrator::{DownloadOrchestrator, OrchestratorSettings};
pub use registry::{JobRegistry, ProbeCache};
pub use tools::{Tool, ToolLocator, ToolPaths};
