//! Progress parsing for yt-dlp and ffmpeg output
//!
//! Both tools report progress as text. The parsers here only accept lines
//! that match the expected shape exactly and return `None` for everything
//! else, so noise on the output streams never affects a job.

use regex::Regex;
use std::sync::OnceLock;

use crate::core::models::JobProgress;

fn download_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            r"^\[download\]\s+(?P<pct>\d{1,3}(?:\.\d+)?)%",
            r"\s+of\s+~?\s*(?P<size>\d+(?:\.\d+)?)(?P<size_unit>[KMGT]?i?B)",
            r"(?:\s+at\s+(?:(?P<speed>\d+(?:\.\d+)?)(?P<speed_unit>[KMGT]?i?B)/s|Unknown B/s|Unknown speed))?",
            r"(?:\s+ETA\s+(?:(?P<eta>\d{1,2}(?::\d{2}){1,2})|Unknown))?",
        ))
        .expect("download progress regex is valid")
    })
}

/// Multiplier for a yt-dlp size unit such as `MiB` or `kB`
fn unit_multiplier(unit: &str) -> Option<f64> {
    let multiplier = match unit {
        "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "KB" | "kB" => 1_000.0,
        "MB" => 1_000_000.0,
        "GB" => 1_000_000_000.0,
        "TB" => 1_000_000_000_000.0,
        _ => return None,
    };
    Some(multiplier)
}

/// Parse `HH:MM:SS`, `MM:SS` or plain seconds into seconds
pub fn parse_clock(value: &str) -> Option<f64> {
    let mut total = 0.0;
    for part in value.trim().split(':') {
        if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        total = total * 60.0 + part.parse::<f64>().ok()?;
    }
    Some(total)
}

/// Parse one yt-dlp `--newline` progress line.
///
/// Accepted shape:
/// `[download]  45.2% of ~10.00MiB at  1.00MiB/s ETA 00:05`
/// Speed and ETA may be missing or `Unknown`; they are reported as zero.
pub fn parse_download_line(line: &str) -> Option<JobProgress> {
    let caps = download_line_regex().captures(line.trim())?;

    let percent: f64 = caps.name("pct")?.as_str().parse().ok()?;
    if percent > 100.0 {
        return None;
    }
    // The size only validates the line; the unit must be one we know.
    unit_multiplier(caps.name("size_unit")?.as_str())?;

    let speed = match (caps.name("speed"), caps.name("speed_unit")) {
        (Some(value), Some(unit)) => {
            value.as_str().parse::<f64>().ok()? * unit_multiplier(unit.as_str())?
        }
        _ => 0.0,
    };
    let eta = match caps.name("eta") {
        Some(value) => parse_clock(value.as_str())?,
        None => 0.0,
    };

    Some(JobProgress {
        percent,
        speed_bytes_per_sec: speed,
        eta_seconds: eta,
    })
}

/// Accumulates ffmpeg `-progress` key/value blocks.
///
/// ffmpeg writes `key=value` lines and closes each block with
/// `progress=continue` or `progress=end`. A reading is produced per block.
#[derive(Debug, Clone, Default)]
pub struct FfmpegProgressParser {
    expected_duration: Option<f64>,
    out_time_secs: Option<f64>,
    total_size: Option<u64>,
    speed_factor: Option<f64>,
    started: Option<std::time::Instant>,
}

impl FfmpegProgressParser {
    pub fn new(expected_duration: Option<f64>) -> Self {
        Self {
            expected_duration: expected_duration.filter(|d| d.is_finite() && *d > 0.0),
            ..Self::default()
        }
    }

    /// Feed one line; returns a reading when the line closes a block.
    pub fn feed(&mut self, line: &str) -> Option<JobProgress> {
        let (key, value) = line.trim().split_once('=')?;
        let value = value.trim();
        self.started.get_or_insert_with(std::time::Instant::now);

        match key {
            "out_time_us" | "out_time_ms" => {
                // Both keys carry microseconds.
                if let Ok(micros) = value.parse::<i64>() {
                    self.out_time_secs = Some(micros.max(0) as f64 / 1_000_000.0);
                }
                None
            }
            "total_size" => {
                self.total_size = value.parse().ok();
                None
            }
            "speed" => {
                self.speed_factor = value.trim_end_matches('x').trim().parse().ok();
                None
            }
            "progress" => Some(self.reading(value == "end")),
            _ => None,
        }
    }

    fn reading(&self, finished: bool) -> JobProgress {
        if finished {
            return JobProgress::completed();
        }

        let elapsed = self
            .started
            .map(|start| start.elapsed().as_secs_f64())
            .unwrap_or_default();
        let speed_bytes_per_sec = match self.total_size {
            Some(size) if elapsed > 0.0 => size as f64 / elapsed,
            _ => 0.0,
        };

        let (percent, eta_seconds) = match (self.expected_duration, self.out_time_secs) {
            (Some(total), Some(done)) => {
                let percent = (done / total * 100.0).clamp(0.0, 100.0);
                let remaining = (total - done).max(0.0);
                let eta = match self.speed_factor {
                    Some(factor) if factor > 0.0 => remaining / factor,
                    _ => 0.0,
                };
                (percent, eta)
            }
            _ => (0.0, 0.0),
        };

        JobProgress {
            percent,
            speed_bytes_per_sec,
            eta_seconds,
        }
        .sanitized()
    }
}

/// Format a byte count like `12.34 MB`
pub fn human_size(bytes: f64) -> String {
    if !bytes.is_finite() || bytes <= 0.0 {
        return "0 B".to_string();
    }
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0} {}", UNITS[unit])
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

/// Format seconds like `1h 02m 03s`, `2m 05s` or `42s`
pub fn human_duration(seconds: f64) -> String {
    if !seconds.is_finite() || seconds <= 0.0 {
        return "0s".to_string();
    }
    let total = seconds.round() as u64;
    let (hours, minutes, secs) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h {minutes:02}m {secs:02}s")
    } else if minutes > 0 {
        format!("{minutes}m {secs:02}s")
    } else {
        format!("{secs}s")
    }
}
