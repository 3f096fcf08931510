//! Application configuration
//!
//! Settings are layered: built-in defaults, then the per-user config file,
//! then an explicit file given on the command line, then `VIDGRAB_*`
//! environment variables (`VIDGRAB_SERVER__PORT=8080`).

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error_handling::RetryPolicy;

/// Main application configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub tools: ToolsConfig,
    pub download: DownloadConfig,
    pub retry: RetryConfig,
    pub registry: RegistryConfig,
    pub logging: LoggingConfig,
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
        }
    }
}

/// Where to look for external binaries before falling back to PATH
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolsConfig {
    /// Shared directory hint for all tools
    pub bin_dir: Option<PathBuf>,
    pub ytdlp_dir: Option<PathBuf>,
    /// Directory holding ffmpeg and ffprobe
    pub ffmpeg_dir: Option<PathBuf>,
    pub ytdlp_name: Option<String>,
    pub ffmpeg_name: Option<String>,
    pub ffprobe_name: Option<String>,
}

/// Download and postprocess behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DownloadConfig {
    pub output_directory: PathBuf,
    pub preview_directory: PathBuf,
    pub max_concurrent_jobs: usize,
    pub probe_timeout_secs: u64,
    /// Kill a fetch attempt that prints nothing for this long
    pub idle_timeout_secs: u64,
    pub socket_timeout_secs: u64,
    /// Retries yt-dlp performs internally within one attempt
    pub tool_retries: u32,
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            output_directory: PathBuf::from("downloads"),
            preview_directory: PathBuf::from("downloads").join("previews"),
            max_concurrent_jobs: 3,
            probe_timeout_secs: 60,
            idle_timeout_secs: 120,
            socket_timeout_secs: 15,
            tool_retries: 10,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36".to_string(),
        }
    }
}

impl DownloadConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Fetch retry settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            backoff_multiplier: policy.backoff_multiplier,
            jitter_factor: policy.jitter_factor,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            jitter_factor: self.jitter_factor,
        }
    }
}

/// Job registry retention
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Finished jobs are evicted this long after they finish
    pub job_ttl_secs: u64,
    pub probe_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            job_ttl_secs: 3600,
            probe_ttl_secs: 1800,
            sweep_interval_secs: 60,
        }
    }
}

impl RegistryConfig {
    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.job_ttl_secs)
    }

    pub fn probe_ttl(&self) -> Duration {
        Duration::from_secs(self.probe_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "vidgrab=info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load layered configuration; `explicit` must exist when given
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let user_file = Self::get_config_path().ok();
        let mut config = Self::load_layers(user_file.as_deref(), explicit, Self::environment())?;

        config.apply_tool_env_hints(
            std::env::var_os("FFMPEG_DIR").map(PathBuf::from),
            std::env::var_os("YTDLP_DIR").map(PathBuf::from),
        );
        config.validate()?;

        tracing::info!("Loaded configuration (explicit file: {:?})", explicit);
        Ok(config)
    }

    /// `VIDGRAB_` prefix, `__` between nested keys
    fn environment() -> Environment {
        Environment::with_prefix("VIDGRAB")
            .prefix_separator("_")
            .separator("__")
    }

    fn load_layers(
        user_file: Option<&Path>,
        explicit: Option<&Path>,
        environment: Environment,
    ) -> Result<Self> {
        let mut builder = Config::builder().add_source(
            Config::try_from(&AppConfig::default())
                .with_context(|| "Failed to build default configuration")?,
        );

        if let Some(path) = user_file {
            builder = builder.add_source(File::from(path.to_path_buf()).required(false));
        }
        if let Some(path) = explicit {
            builder = builder.add_source(File::from(path.to_path_buf()).required(true));
        }

        builder
            .add_source(environment)
            .build()
            .with_context(|| "Failed to read configuration sources")?
            .try_deserialize()
            .with_context(|| "Failed to parse configuration")
    }

    /// Fill unset tool directories from `FFMPEG_DIR` / `YTDLP_DIR`
    pub fn apply_tool_env_hints(&mut self, ffmpeg_dir: Option<PathBuf>, ytdlp_dir: Option<PathBuf>) {
        if self.tools.ffmpeg_dir.is_none() {
            self.tools.ffmpeg_dir = ffmpeg_dir.filter(|p| !p.as_os_str().is_empty());
        }
        if self.tools.ytdlp_dir.is_none() {
            self.tools.ytdlp_dir = ytdlp_dir.filter(|p| !p.as_os_str().is_empty());
        }
    }

    /// Save configuration as JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content =
            serde_json::to_string_pretty(self).with_context(|| "Failed to serialize config")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        tracing::info!("Saved configuration to: {:?}", path);
        Ok(())
    }

    /// Get the path to the per-user configuration file
    pub fn get_config_path() -> Result<PathBuf> {
        let project_dirs = ProjectDirs::from("com", "vidgrab", "vidgrab")
            .with_context(|| "Failed to get project directories")?;

        Ok(project_dirs.config_dir().join("config.json"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            anyhow::bail!("Server host must not be empty");
        }

        if self.download.max_concurrent_jobs == 0 {
            anyhow::bail!("Concurrent jobs must be greater than 0");
        }

        if self.download.max_concurrent_jobs > 20 {
            anyhow::bail!("Concurrent jobs should not exceed 20");
        }

        if self.download.probe_timeout_secs == 0 || self.download.probe_timeout_secs > 600 {
            anyhow::bail!("Probe timeout must be between 1 and 600 seconds");
        }

        if self.download.idle_timeout_secs == 0 {
            anyhow::bail!("Idle timeout must be greater than 0");
        }

        if self.retry.max_attempts == 0 {
            anyhow::bail!("Retry attempts must be at least 1");
        }

        if self.retry.max_attempts > 10 {
            anyhow::bail!("Retry attempts should not exceed 10");
        }

        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            anyhow::bail!("Retry base delay must not exceed the maximum delay");
        }

        if !(1.0..=10.0).contains(&self.retry.backoff_multiplier) {
            anyhow::bail!("Backoff multiplier must be between 1 and 10");
        }

        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            anyhow::bail!("Jitter factor must be between 0 and 1");
        }

        Ok(())
    }
}
