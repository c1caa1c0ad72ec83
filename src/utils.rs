//! Utility functions for file naming and destination paths

use crate::types::{RawEntry, Resolution};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Maximum number of suffixes tried when resolving destination collisions
const MAX_RENAME_ATTEMPTS: u32 = 9999;

/// Characters that cannot appear in a file name on common filesystems
const RESERVED_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Make a string safe to use as a single file name
///
/// Path separators, reserved characters and control characters become `_`. Leading and
/// trailing whitespace and trailing dots are removed. Names that end up empty, or that would
/// refer to the current or parent directory, become `"download"`.
///
/// # Examples
///
/// ```
/// use civitai_dl::utils::sanitize_file_name;
///
/// assert_eq!(sanitize_file_name("a/b:c.safetensors"), "a_b_c.safetensors");
/// assert_eq!(sanitize_file_name("  .. "), "download");
/// ```
#[must_use]
pub fn sanitize_file_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| {
            if RESERVED_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();

    let trimmed = replaced.trim().trim_end_matches('.').trim_end();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Choose the file name for a resolved entry
///
/// Order of preference: the catalog's primary file name, `<entry name>.safetensors`,
/// `model-<versionId>.safetensors`, then the last path segment of the download URL.
/// The result is always sanitized.
pub fn destination_file_name(entry: &RawEntry, resolution: &Resolution) -> String {
    if let Some(file_name) = non_blank(resolution.file_name.as_deref()) {
        return sanitize_file_name(file_name);
    }

    if let Some(name) = non_blank(entry.name.as_deref()) {
        return sanitize_file_name(&format!("{name}.safetensors"));
    }

    if let Some(version_id) = resolution.version_id {
        return format!("model-{version_id}.safetensors");
    }

    let last_segment = url::Url::parse(&resolution.download_url)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).next_back())
                .map(str::to_string)
        })
        .unwrap_or_default();
    sanitize_file_name(&last_segment)
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Claim a destination path that no other target in the batch uses
///
/// If `path` is already in `claimed`, tries `name (1).ext`, `name (2).ext`, ... until an
/// unclaimed path is found. The returned path is inserted into `claimed`. Files that already
/// exist on disk are not considered; they are overwritten by the download.
///
/// # Examples
///
/// ```
/// use civitai_dl::utils::unique_path;
/// use std::collections::HashSet;
/// use std::path::{Path, PathBuf};
///
/// let mut claimed = HashSet::new();
/// let first = unique_path(Path::new("models/Lora/a.safetensors"), &mut claimed);
/// let second = unique_path(Path::new("models/Lora/a.safetensors"), &mut claimed);
/// assert_eq!(first, PathBuf::from("models/Lora/a.safetensors"));
/// assert_eq!(second, PathBuf::from("models/Lora/a (1).safetensors"));
/// ```
pub fn unique_path(path: &Path, claimed: &mut HashSet<PathBuf>) -> PathBuf {
    if claimed.insert(path.to_path_buf()) {
        return path.to_path_buf();
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());
    let parent = path.parent().unwrap_or_else(|| Path::new(""));

    for i in 1..=MAX_RENAME_ATTEMPTS {
        let new_name = match &extension {
            Some(ext) => format!("{stem} ({i}).{ext}"),
            None => format!("{stem} ({i})"),
        };
        let candidate = parent.join(new_name);
        if claimed.insert(candidate.clone()) {
            return candidate;
        }
    }

    // Every numbered name is taken; fall back to a name derived from the claim count
    let fallback = parent.join(format!("{stem} ({})", claimed.len()));
    claimed.insert(fallback.clone());
    fallback
}

/// Temporary path a download streams into before being renamed over `destination`
pub fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}
