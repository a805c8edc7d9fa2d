//! Per-directory metadata files.
//!
//! Every directory in the archive carries a small JSON descriptor (by
//! default `meta.json`). The file is the source of truth; the `dirs`
//! table in the store is only a read-through cache refreshed on each
//! index run. Unknown fields are preserved in `extra` so older binaries
//! never drop data written by newer ones.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::util::write_json_atomic;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirMeta {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub dir_type: String,
    /// Free-form filing rules consumed by the auto-filing collaborator.
    #[serde(default)]
    pub rules: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub updated_at: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_schema_version() -> u32 {
    1
}

impl DirMeta {
    pub fn new_for_dir(dir: &Path) -> Self {
        Self {
            schema_version: default_schema_version(),
            title: dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            summary: String::new(),
            tags: Vec::new(),
            keywords: Vec::new(),
            dir_type: String::new(),
            rules: serde_json::Map::new(),
            updated_at: crate::util::now_iso(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Ensure `dir` exists and carries a metadata file, creating a default one
/// when absent. Returns the metadata file path.
pub fn ensure_dir_meta(dir: &Path, meta_filename: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let meta_path = dir.join(meta_filename);
    if !meta_path.exists() {
        write_json_atomic(&meta_path, &DirMeta::new_for_dir(dir))?;
    }
    Ok(meta_path)
}

/// Read a directory's metadata, creating the file if missing. Malformed
/// JSON fails open to a fresh default rather than erroring.
pub fn read_dir_meta(dir: &Path, meta_filename: &str) -> Result<DirMeta> {
    let meta_path = ensure_dir_meta(dir, meta_filename)?;
    let content = std::fs::read_to_string(&meta_path)?;
    match serde_json::from_str::<DirMeta>(&content) {
        Ok(meta) => Ok(meta),
        Err(_) => Ok(DirMeta::new_for_dir(dir)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_creates_default() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("notes");
        let meta_path = ensure_dir_meta(&dir, "meta.json").unwrap();
        assert!(meta_path.exists());
        let meta = read_dir_meta(&dir, "meta.json").unwrap();
        assert_eq!(meta.schema_version, 1);
        assert_eq!(meta.title, "notes");
    }

    #[test]
    fn test_ensure_keeps_existing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().to_path_buf();
        std::fs::write(
            dir.join("meta.json"),
            r#"{"schema_version":1,"title":"Custom","tags":["a"],"color":"red"}"#,
        )
        .unwrap();
        let meta = read_dir_meta(&dir, "meta.json").unwrap();
        assert_eq!(meta.title, "Custom");
        assert_eq!(meta.tags, vec!["a"]);
        // Unknown fields survive the round trip.
        assert_eq!(meta.extra.get("color").and_then(|v| v.as_str()), Some("red"));
    }

    #[test]
    fn test_malformed_meta_fails_open() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().to_path_buf();
        std::fs::write(dir.join("meta.json"), "not json {").unwrap();
        let meta = read_dir_meta(&dir, "meta.json").unwrap();
        assert_eq!(meta.schema_version, 1);
    }
}
