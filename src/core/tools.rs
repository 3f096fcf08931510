//! Locating the external binaries (yt-dlp, ffmpeg, ffprobe)

use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::core::config::ToolsConfig;
use crate::core::models::{AppError, AppResult};

/// External programs the orchestrator shells out to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    YtDlp,
    Ffmpeg,
    Ffprobe,
}

impl Tool {
    pub fn default_name(self) -> &'static str {
        match self {
            Tool::YtDlp => "yt-dlp",
            Tool::Ffmpeg => "ffmpeg",
            Tool::Ffprobe => "ffprobe",
        }
    }
}

/// Resolved tool locations; `None` means the tool was not found
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolPaths {
    pub ytdlp: Option<PathBuf>,
    pub ffmpeg: Option<PathBuf>,
    pub ffprobe: Option<PathBuf>,
}

impl ToolPaths {
    pub fn get(&self, tool: Tool) -> Option<&Path> {
        match tool {
            Tool::YtDlp => self.ytdlp.as_deref(),
            Tool::Ffmpeg => self.ffmpeg.as_deref(),
            Tool::Ffprobe => self.ffprobe.as_deref(),
        }
    }

    /// Path of `tool`, or `ToolNotFound` naming where we looked
    pub fn require(&self, tool: Tool) -> AppResult<&Path> {
        self.get(tool).ok_or_else(|| {
            AppError::ToolNotFound(format!(
                "{} was not found in the configured tool directory or on PATH",
                tool.default_name()
            ))
        })
    }
}

/// Finds binaries in a directory hint first and then on the search path
#[derive(Debug, Clone)]
pub struct ToolLocator {
    config: ToolsConfig,
    search_path: Option<OsString>,
}

impl ToolLocator {
    pub fn new(config: ToolsConfig) -> Self {
        Self {
            config,
            search_path: std::env::var_os("PATH"),
        }
    }

    /// Override the search path, mainly for tests
    pub fn with_search_path(mut self, search_path: Option<OsString>) -> Self {
        self.search_path = search_path;
        self
    }

    fn binary_name(&self, tool: Tool) -> &str {
        let configured = match tool {
            Tool::YtDlp => self.config.ytdlp_name.as_deref(),
            Tool::Ffmpeg => self.config.ffmpeg_name.as_deref(),
            Tool::Ffprobe => self.config.ffprobe_name.as_deref(),
        };
        configured.unwrap_or(tool.default_name())
    }

    fn hint_dir(&self, tool: Tool) -> Option<&Path> {
        let specific = match tool {
            Tool::YtDlp => self.config.ytdlp_dir.as_deref(),
            Tool::Ffmpeg | Tool::Ffprobe => self.config.ffmpeg_dir.as_deref(),
        };
        specific.or(self.config.bin_dir.as_deref())
    }

    pub fn locate(&self, tool: Tool) -> Option<PathBuf> {
        let name = self.binary_name(tool);

        if let Some(dir) = self.hint_dir(tool) {
            if let Some(found) = find_in_dir(dir, name) {
                debug!("🔎 {} found via directory hint: {}", name, found.display());
                return Some(found);
            }
            debug!("{} not present in hint directory {}", name, dir.display());
        }

        let found = self
            .search_path
            .as_ref()
            .and_then(|paths| std::env::split_paths(paths).find_map(|dir| find_in_dir(&dir, name)));
        if let Some(path) = &found {
            debug!("🔎 {} found on PATH: {}", name, path.display());
        }
        found
    }

    pub fn locate_all(&self) -> ToolPaths {
        ToolPaths {
            ytdlp: self.locate(Tool::YtDlp),
            ffmpeg: self.locate(Tool::Ffmpeg),
            ffprobe: self.locate(Tool::Ffprobe),
        }
    }
}

fn find_in_dir(dir: &Path, name: &str) -> Option<PathBuf> {
    candidate_names(name)
        .into_iter()
        .map(|candidate| dir.join(candidate))
        .find(|path| is_executable(path))
}

fn candidate_names(name: &str) -> Vec<String> {
    if cfg!(windows) && Path::new(name).extension().is_none() {
        vec![format!("{name}.exe"), format!("{name}.cmd"), name.to_string()]
    } else {
        vec![name.to_string()]
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
