//! File system utilities

use anyhow::{anyhow, Result};
use regex::Regex;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

/// Longest file stem we produce from a video title
pub const MAX_FILENAME_LEN: usize = 200;

/// Ensure directory exists
pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .map_err(|e| anyhow!("Failed to create directory {}: {}", path.display(), e))?;
    }
    Ok(())
}

fn unsafe_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-zA-Z0-9_\-\. ]").expect("filename regex is valid"))
}

/// Sanitize a title for use as a file stem.
///
/// Anything outside `[A-Za-z0-9_-. ]` becomes `_`; the result is capped at
/// `MAX_FILENAME_LEN` characters and never empty.
pub fn sanitize_filename(title: &str) -> String {
    let replaced = unsafe_chars().replace_all(title.trim(), "_");
    let truncated: String = replaced.chars().take(MAX_FILENAME_LEN).collect();
    let cleaned = truncated.trim().trim_matches('.');
    if cleaned.is_empty() {
        "video".to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("My: Clip?"), "My_ Clip_");
        assert_eq!(sanitize_filename("a/b\\c"), "a_b_c");
        assert_eq!(sanitize_filename("Ünïcode 🎬 title"), "_n_code _ title");
        assert_eq!(sanitize_filename("  ..  "), "video");
        assert_eq!(sanitize_filename(""), "video");
    }

    #[test]
    fn test_sanitize_filename_truncates() {
        let long = "x".repeat(500);
        assert_eq!(sanitize_filename(&long).len(), MAX_FILENAME_LEN);
    }

    #[test]
    fn test_ensure_dir_exists() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        ensure_dir_exists(&nested).unwrap();
        assert!(nested.is_dir());
        ensure_dir_exists(&nested).unwrap();
    }
}
