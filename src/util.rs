//! Small shared helpers: hashing, timestamps, relative-path validation,
//! and atomic JSON writes.

use anyhow::{bail, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Current UTC time as an RFC 3339 string with a `Z` suffix.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

pub fn sha256_text(text: &str) -> String {
    sha256_bytes(text.as_bytes())
}

/// Normalize a user-supplied relative path to POSIX form.
///
/// Strips leading slashes and `.` segments; rejects `..` segments so a
/// caller can never address files outside the archive root. Returns an
/// empty string for `""` and `"."`.
pub fn normalize_rel_path(rel: &str) -> Result<String> {
    let rel = rel.replace('\\', "/");
    let rel = rel.trim().trim_start_matches('/');
    if rel.is_empty() || rel == "." {
        return Ok(String::new());
    }
    let parts: Vec<&str> = rel
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    if parts.iter().any(|p| *p == "..") {
        bail!("invalid relative path (contains '..'): {}", rel);
    }
    Ok(parts.join("/"))
}

/// Relative POSIX path of `path` under `root`.
pub fn rel_path_under(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Serialize `value` as pretty JSON and write it via a temp file + rename,
/// so readers never observe a half-written file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut text = serde_json::to_string_pretty(value)?;
    text.push('\n');
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, text)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn json_compact<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}
