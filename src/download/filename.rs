//! Filename extraction, sanitization, and path uniquification for downloads.
//!
//! Target names come from the Content-Disposition header or the last URL
//! path segment. Colliding paths get a `" (n)"` disambiguator inserted before
//! the extension, e.g. `report.pdf` becomes `report (1).pdf`.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use url::Url;

use super::constants::{INTERMEDIATE_EXTENSION, MAX_UNIQUIFY_ATTEMPTS};

/// Picks a safe filename for a download from its headers and URL.
#[must_use]
pub fn filename_for_download(content_disposition: Option<&str>, url: &str) -> String {
    let from_header = content_disposition
        .and_then(parse_content_disposition)
        .map(|name| sanitize_filename(&name))
        .filter(|name| !name.trim_matches('_').is_empty());
    if let Some(name) = from_header {
        return name;
    }
    Url::parse(url)
        .ok()
        .and_then(|u| fallback_filename_from_url(&u))
        .unwrap_or_else(|| "download.bin".to_string())
}

/// Parses Content-Disposition header to extract filename.
///
/// Handles:
/// - `attachment; filename="example.pdf"`
/// - `attachment; filename=example.pdf`
/// - `attachment; filename*=UTF-8''example.pdf` (RFC 5987)
pub(crate) fn parse_content_disposition(header: &str) -> Option<String> {
    // Try filename*= first (RFC 5987 encoded)
    if let Some(pos) = header.find("filename*=") {
        let value = header[pos + 10..].trim();
        // Format: charset'language'encoded_value
        if let Some(quote_pos) = value.find("''") {
            let encoded = &value[quote_pos + 2..];
            let end = encoded.find(';').unwrap_or(encoded.len());
            if let Ok(decoded) = urlencoding::decode(encoded[..end].trim()) {
                return Some(decoded.into_owned());
            }
        }
    }

    if let Some(pos) = header.find("filename=") {
        let value = header[pos + 9..].trim();

        if let Some(stripped) = value.strip_prefix('"') {
            if let Some(end) = stripped.find('"') {
                return Some(stripped[..end].to_string());
            }
        } else {
            let end = value.find(';').unwrap_or(value.len());
            let filename = value[..end].trim();
            if !filename.is_empty() {
                return Some(filename.to_string());
            }
        }
    }

    None
}

/// Sanitizes filename for filesystem safety.
///
/// Replaces characters that are invalid on common filesystems:
/// / \ : * ? " < > |
pub(crate) fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect()
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

/// Last non-empty URL path segment, percent-decoded and sanitized.
pub(crate) fn fallback_filename_from_url(url: &Url) -> Option<String> {
    let last = url.path_segments()?.next_back()?;
    if last.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(last).map_or_else(|_| last.to_string(), |d| d.into_owned());
    Some(sanitize_filename(&decoded))
}

/// Inserts `" (n)"` before the extension of `path`.
///
/// `dir/report.pdf` with `n = 2` becomes `dir/report (2).pdf`;
/// a name without extension just gets the suffix appended.
#[must_use]
pub fn uniquified_path(path: &Path, n: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut name = format!("{stem} ({n})");
    if let Some(ext) = path.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    path.with_file_name(name)
}

/// Returns `path` if free, else the smallest free `" (n)"` variant.
///
/// `current` is the file being renamed; it never counts as a collision.
/// Returns `None` when every candidate up to the attempt limit is taken.
#[must_use]
pub fn resolve_unique_path(path: &Path, current: Option<&Path>) -> Option<PathBuf> {
    let is_free = |candidate: &Path| current == Some(candidate) || !candidate.exists();
    if is_free(path) {
        return Some(path.to_path_buf());
    }
    (1..=MAX_UNIQUIFY_ATTEMPTS)
        .map(|n| uniquified_path(path, n))
        .find(|candidate| is_free(candidate))
}

/// The in-progress name for a target: `<target>.part`.
#[must_use]
pub fn intermediate_path_for(target: &Path) -> PathBuf {
    let mut name: OsString = target.file_name().map(OsString::from).unwrap_or_default();
    name.push(".");
    name.push(INTERMEDIATE_EXTENSION);
    target.with_file_name(name)
}
