use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveConfig {
    #[serde(default = "default_archive_root")]
    pub root: PathBuf,
    #[serde(default = "default_meta_filename")]
    pub meta_filename: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            root: default_archive_root(),
            meta_filename: default_meta_filename(),
        }
    }
}

fn default_archive_root() -> PathBuf {
    PathBuf::from("./kb")
}
fn default_meta_filename() -> String {
    "meta.json".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./kb_index/index.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap_chars: default_overlap_chars(),
            min_chars: default_min_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    1200
}
fn default_overlap_chars() -> usize {
    150
}
fn default_min_chars() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RetrievalConfig {
    /// Lexical candidate pool size; 0 means `max(50, top_k * 5)`.
    #[serde(default)]
    pub fts_candidates: usize,
    /// Vector candidate pool size; 0 means `max(50, top_k * 5)`.
    #[serde(default)]
    pub vec_candidates: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Base URL of an OpenAI-compatible backend. Empty disables embedding.
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Embedding model name.
    #[serde(default)]
    pub model: String,
    /// Chat model name, used by the answer-generation collaborator.
    #[serde(default)]
    pub chat_model: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key_env: default_api_key_env(),
            model: String::new(),
            chat_model: String::new(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_api_key_env() -> String {
    "KB_OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    2
}
fn default_timeout_secs() -> u64 {
    60
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        !self.base_url.trim().is_empty() && !self.model.trim().is_empty()
    }
}

/// Load configuration from a TOML file. A missing file yields the default
/// configuration; a malformed file is an error.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("failed to parse config file")?;

    if config.chunking.max_chars == 0 {
        bail!("chunking.max_chars must be > 0");
    }
    if config.chunking.min_chars > config.chunking.max_chars {
        bail!("chunking.min_chars must be <= chunking.max_chars");
    }
    if config.chunking.overlap_chars >= config.chunking.max_chars {
        bail!("chunking.overlap_chars must be < chunking.max_chars");
    }

    let base = !config.embedding.base_url.trim().is_empty();
    let model = !config.embedding.model.trim().is_empty();
    if base != model {
        bail!("embedding.base_url and embedding.model must be set together");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_empty() {
        let config = parse_config("").unwrap();
        assert_eq!(config.chunking.max_chars, 1200);
        assert_eq!(config.chunking.overlap_chars, 150);
        assert_eq!(config.chunking.min_chars, 20);
        assert_eq!(config.archive.meta_filename, "meta.json");
        assert_eq!(config.embedding.batch_size, 32);
        assert!(!config.embedding.is_enabled());
    }

    #[test]
    fn test_parse_full() {
        let toml = r#"
[archive]
root = "/data/kb"
meta_filename = "dir.json"

[db]
path = "/data/index.sqlite"

[chunking]
max_chars = 800
overlap_chars = 100
min_chars = 10

[embedding]
base_url = "http://localhost:8080"
model = "bge-m3"
"#;
        let config = parse_config(toml).unwrap();
        assert_eq!(config.archive.root, PathBuf::from("/data/kb"));
        assert_eq!(config.archive.meta_filename, "dir.json");
        assert_eq!(config.chunking.max_chars, 800);
        assert!(config.embedding.is_enabled());
    }

    #[test]
    fn test_validation_errors() {
        assert!(parse_config("[chunking]\nmax_chars = 0\n").is_err());
        assert!(parse_config("[chunking]\nmax_chars = 100\noverlap_chars = 100\n").is_err());
        assert!(parse_config("[chunking]\nmax_chars = 100\nmin_chars = 200\n").is_err());
        // Embedding config must be all-or-nothing.
        assert!(parse_config("[embedding]\nbase_url = \"http://x\"\n").is_err());
        assert!(parse_config("[embedding]\nmodel = \"m\"\n").is_err());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = load_config(Path::new("/nonexistent/kb.toml")).unwrap();
        assert_eq!(config.chunking.max_chars, 1200);
    }
}
