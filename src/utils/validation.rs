//! URL and input validation utilities

use regex::Regex;
use std::sync::OnceLock;
use url::Url;

use crate::core::models::{AppError, AppResult};

/// Validate a user-supplied source URL; only http(s) is accepted
pub fn validate_source_url(url: &str) -> AppResult<Url> {
    let parsed = Url::parse(url.trim())
        .map_err(|e| AppError::Probe(format!("Invalid URL format: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(parsed),
        scheme => Err(AppError::Probe(format!(
            "Unsupported URL scheme '{}', expected http or https",
            scheme
        ))),
    }
}

fn timestamp_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:\d+|\d{1,2}(?::\d{2}){1,2})$").expect("timestamp regex is valid")
    })
}

/// Parse `SS`, `M:SS`, `MM:SS` or `H:MM:SS` into seconds.
///
/// Minute and second fields must be below 60 once a colon is used.
pub fn parse_timestamp(value: &str) -> Option<f64> {
    let value = value.trim();
    if !timestamp_regex().is_match(value) {
        return None;
    }

    let parts: Vec<u64> = value
        .split(':')
        .map(|p| p.parse::<u64>())
        .collect::<Result<_, _>>()
        .ok()?;
    if parts.len() > 1 && parts[1..].iter().any(|p| *p >= 60) {
        return None;
    }

    Some(parts.iter().fold(0u64, |acc, p| acc * 60 + p) as f64)
}
