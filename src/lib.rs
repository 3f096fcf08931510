//! vidgrab - media download orchestrator
//!
//! This library probes media URLs with yt-dlp, downloads them in the
//! background with retries, post-processes artifacts with ffmpeg and exposes
//! job status over a small HTTP API.

pub mod commands;
pub mod core;
pub mod downloaders;
pub mod utils;

// Re-export commonly used types
pub use core::{
    config::AppConfig,
    models::{AppError, AppResult, DownloadJob, JobState, PostprocessOp, VideoInfo},
    orchestrator::{DownloadOrchestrator, OrchestratorSettings},
    tools::{Tool, ToolLocator, ToolPaths},
};
pub use downloaders::{FfmpegProcessor, YtDlpFetcher};

use std::sync::Arc;
use tracing::{info, warn};

use crate::utils::file_utils::ensure_dir_exists;

/// Application state shared between HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: DownloadOrchestrator,
    pub config: Arc<AppConfig>,
    pub tools: Arc<ToolPaths>,
}

impl AppState {
    /// Locate tools, create output directories and build the orchestrator
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        ensure_dir_exists(&config.download.output_directory)?;
        ensure_dir_exists(&config.download.preview_directory)?;

        let tools = ToolLocator::new(config.tools.clone()).locate_all();
        for tool in [Tool::YtDlp, Tool::Ffmpeg, Tool::Ffprobe] {
            match tools.get(tool) {
                Some(path) => info!("🔍 Found {} at {}", tool.default_name(), path.display()),
                None => warn!(
                    "⚠️ {} not found; operations that need it will fail",
                    tool.default_name()
                ),
            }
        }

        let fetcher = Arc::new(YtDlpFetcher::new(&tools, config.download.clone()));
        let processor = Arc::new(FfmpegProcessor::new(&tools));
        let orchestrator = DownloadOrchestrator::new(
            fetcher,
            processor,
            OrchestratorSettings::from_config(&config),
        );

        Ok(Self::with_orchestrator(config, tools, orchestrator))
    }

    /// Assemble state around an existing orchestrator
    pub fn with_orchestrator(
        config: AppConfig,
        tools: ToolPaths,
        orchestrator: DownloadOrchestrator,
    ) -> Self {
        Self {
            orchestrator,
            config: Arc::new(config),
            tools: Arc::new(tools),
        }
    }
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initialize the library with default settings
pub fn init() -> anyhow::Result<()> {
    utils::logging::init_tracing(utils::logging::DEFAULT_LOG_FILTER);
    info!("📚 {} v{} initialized", NAME, VERSION);
    Ok(())
}
