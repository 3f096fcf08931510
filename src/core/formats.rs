//! yt-dlp metadata parsing and format normalisation

use serde::Deserialize;
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::core::models::{AppError, AppResult, AvailableFormat, VideoInfo};
use crate::core::progress_tracker::human_size;

/// Containers offered to the user
pub const ALLOWED_EXTENSIONS: &[&str] = &["mp4", "m4a", "webm", "mkv", "mp3"];

/// Subset of `yt-dlp --dump-single-json` output we rely on
#[derive(Debug, Clone, Deserialize)]
pub struct RawVideoInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub webpage_url: Option<String>,
    #[serde(default)]
    pub formats: Vec<RawFormat>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawFormat {
    pub format_id: String,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub tbr: Option<f64>,
    #[serde(default)]
    pub abr: Option<f64>,
    #[serde(default)]
    pub filesize: Option<u64>,
    #[serde(default)]
    pub filesize_approx: Option<u64>,
    #[serde(default)]
    pub format_note: Option<String>,
}

fn codec_present(codec: &Option<String>) -> bool {
    matches!(codec.as_deref(), Some(c) if !c.is_empty() && c != "none")
}

impl RawFormat {
    fn to_available(&self) -> Option<AvailableFormat> {
        let ext = self.ext.as_deref()?.to_ascii_lowercase();
        if !ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
            return None;
        }

        // yt-dlp leaves codecs unset for some single-file sites; a height
        // still means there is a picture.
        let has_video = codec_present(&self.vcodec)
            || (self.vcodec.is_none() && self.height.is_some());
        let has_audio = codec_present(&self.acodec) || (self.acodec.is_none() && !has_video);
        if !has_video && !has_audio {
            return None;
        }

        let mut format = AvailableFormat {
            format_id: self.format_id.clone(),
            ext,
            height: if has_video { self.height } else { None },
            has_video,
            has_audio,
            bitrate_kbps: self.tbr.or(self.abr).filter(|b| *b > 0.0),
            filesize: self.filesize.or(self.filesize_approx),
            note: self.format_note.clone(),
            label: String::new(),
        };
        format.label = format_label(&format);
        Some(format)
    }
}

/// Human label like `720p • mp4 • ~1200 kbps • 12.34 MB`
pub fn format_label(format: &AvailableFormat) -> String {
    let mut parts = vec![format.resolution_tag(), format.ext.clone()];
    if let Some(bitrate) = format.bitrate_kbps {
        parts.push(format!("~{} kbps", bitrate.round() as u64));
    }
    if let Some(size) = format.filesize {
        parts.push(human_size(size as f64));
    }
    if !format.has_audio {
        parts.push("video only".to_string());
    }
    parts.join(" • ")
}

/// Keep allowed containers, dedupe by `(height, ext)` and sort best-first.
///
/// Among duplicates the larger file wins, then the higher bitrate. Video
/// formats come first by descending height, then audio-only formats by
/// descending bitrate.
pub fn normalize_formats(raw: &[RawFormat]) -> Vec<AvailableFormat> {
    let mut best: HashMap<(Option<u32>, String, bool), AvailableFormat> = HashMap::new();

    for format in raw.iter().filter_map(RawFormat::to_available) {
        let key = (format.height, format.ext.clone(), format.has_video);
        match best.get(&key) {
            Some(existing) if !is_better(&format, existing) => {}
            _ => {
                best.insert(key, format);
            }
        }
    }

    let mut formats: Vec<AvailableFormat> = best.into_values().collect();
    formats.sort_by(compare_formats);
    formats
}

fn is_better(candidate: &AvailableFormat, existing: &AvailableFormat) -> bool {
    let size = |f: &AvailableFormat| f.filesize.unwrap_or(0);
    let bitrate = |f: &AvailableFormat| f.bitrate_kbps.unwrap_or(0.0);

    match size(candidate).cmp(&size(existing)) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => bitrate(candidate) > bitrate(existing),
    }
}

fn compare_formats(a: &AvailableFormat, b: &AvailableFormat) -> Ordering {
    let bitrate = |f: &AvailableFormat| f.bitrate_kbps.unwrap_or(0.0);

    b.has_video
        .cmp(&a.has_video)
        .then_with(|| b.height.cmp(&a.height))
        .then_with(|| b.has_audio.cmp(&a.has_audio))
        .then_with(|| bitrate(b).partial_cmp(&bitrate(a)).unwrap_or(Ordering::Equal))
        .then_with(|| a.format_id.cmp(&b.format_id))
}

/// Parse probe JSON into a `VideoInfo`, failing if nothing is downloadable
pub fn parse_probe_output(json: &str) -> AppResult<VideoInfo> {
    let raw: RawVideoInfo = serde_json::from_str(json)
        .map_err(|e| AppError::Probe(format!("Unreadable metadata: {e}")))?;

    let available_formats = normalize_formats(&raw.formats);
    if available_formats.is_empty() {
        return Err(AppError::Probe(
            "No downloadable formats were offered for this URL".to_string(),
        ));
    }

    Ok(VideoInfo {
        id: raw.id,
        title: raw
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| "video".to_string()),
        duration: raw.duration.filter(|d| d.is_finite() && *d >= 0.0),
        thumbnail: raw.thumbnail,
        webpage_url: raw.webpage_url,
        available_formats,
    })
}
