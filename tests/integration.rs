//! End-to-end tests over a real archive tree and SQLite index.

use async_trait::async_trait;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

use mdkb::config::Config;
use mdkb::embedding::{DisabledProvider, EmbeddingError, EmbeddingProvider};
use mdkb::indexer::{index_archive, IndexOptions};
use mdkb::models::ScoreSource;
use mdkb::search::{search_archive, SearchOptions};

fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.archive.root = root.join("kb");
    config.db.path = root.join("kb_index").join("index.sqlite");
    config
}

fn write_doc(config: &Config, rel_path: &str, content: &str) {
    let path = config.archive.root.join(rel_path);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

async fn index(config: &Config, provider: &dyn EmbeddingProvider, opts: IndexOptions) -> mdkb::models::IndexStats {
    index_archive(config, provider, &opts).await.unwrap()
}

fn lexical(top_k: usize) -> SearchOptions {
    SearchOptions {
        top_k,
        semantic: false,
        hybrid: false,
    }
}

// ============ Stub providers ============

/// Embeds every text as an all-zero vector.
struct ZeroProvider;

#[async_trait]
impl EmbeddingProvider for ZeroProvider {
    fn is_enabled(&self) -> bool {
        true
    }
    fn model_name(&self) -> &str {
        "stub-zero"
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|_| vec![0.0f32; 4]).collect())
    }
}

/// Embeds texts onto two axes: [1,0] when the text mentions "rust",
/// [0,1] otherwise. Deterministic, so query and chunk vectors agree.
struct TopicProvider;

#[async_trait]
impl EmbeddingProvider for TopicProvider {
    fn is_enabled(&self) -> bool {
        true
    }
    fn model_name(&self) -> &str {
        "stub-topic"
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts
            .iter()
            .map(|t| {
                if t.to_lowercase().contains("rust") {
                    vec![1.0f32, 0.0]
                } else {
                    vec![0.0f32, 1.0]
                }
            })
            .collect())
    }
}

/// Always fails, as an unreachable backend would.
struct FailingProvider;

#[async_trait]
impl EmbeddingProvider for FailingProvider {
    fn is_enabled(&self) -> bool {
        true
    }
    fn model_name(&self) -> &str {
        "stub-failing"
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::Backend {
            status: 500,
            body: "backend down".to_string(),
        })
    }
}

// ============ Tests ============

#[tokio::test]
async fn test_index_and_lexical_search() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    write_doc(
        &config,
        "alpha.md",
        "---\ntitle: Alpha\ntags: [lang, systems]\n---\n# Alpha\n\nRust programming with cargo and crates.\n",
    );
    write_doc(
        &config,
        "notes/beta.md",
        "# Beta\n\nPython machine learning notes.\n",
    );

    let stats = index(&config, &DisabledProvider, IndexOptions::default()).await;
    assert_eq!(stats.updated_docs, 2);
    assert_eq!(stats.deleted_docs, 0);
    assert_eq!(stats.unchanged_docs, 0);
    assert!(stats.updated_chunks >= 2);
    assert_eq!(stats.embedded_chunks, 0);

    let results = search_archive(&config, &DisabledProvider, "cargo", &lexical(5))
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0].rel_path, "alpha.md");
    assert_eq!(results[0].title, "Alpha");
    assert_eq!(results[0].source, ScoreSource::Fts);
    assert!(results[0].score > 0.0 && results[0].score <= 1.0);
    assert!(results[0].start_line >= 1);
    assert!(results[0].end_line >= results[0].start_line);
}

#[tokio::test]
async fn test_second_run_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    write_doc(&config, "a.md", "# A\n\ncontent one\n");
    write_doc(&config, "b.md", "# B\n\ncontent two\n");

    index(&config, &DisabledProvider, IndexOptions::default()).await;
    let stats = index(&config, &DisabledProvider, IndexOptions::default()).await;
    assert_eq!(stats.updated_docs, 0);
    assert_eq!(stats.deleted_docs, 0);
    assert_eq!(stats.unchanged_docs, 2);
}

#[tokio::test]
async fn test_changed_file_is_reindexed() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    write_doc(&config, "a.md", "# A\n\noriginal text\n");
    write_doc(&config, "b.md", "# B\n\nstable text\n");

    index(&config, &DisabledProvider, IndexOptions::default()).await;
    write_doc(&config, "a.md", "# A\n\nedited text entirely new\n");

    let stats = index(&config, &DisabledProvider, IndexOptions::default()).await;
    assert_eq!(stats.updated_docs, 1);
    assert_eq!(stats.unchanged_docs, 1);

    let results = search_archive(&config, &DisabledProvider, "edited", &lexical(5))
        .await
        .unwrap();
    assert_eq!(results[0].rel_path, "a.md");
}

#[tokio::test]
async fn test_deletion_consistency() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    write_doc(&config, "keep.md", "# Keep\n\nkeyword aardwolf here\n");
    write_doc(&config, "gone.md", "# Gone\n\nkeyword zyzzyva here\n");

    index(&config, &ZeroProvider, IndexOptions { embed: true, ..Default::default() }).await;
    fs::remove_file(config.archive.root.join("gone.md")).unwrap();

    let stats = index(&config, &ZeroProvider, IndexOptions { embed: true, ..Default::default() }).await;
    assert!(stats.deleted_docs >= 1);

    let results = search_archive(&config, &DisabledProvider, "zyzzyva", &lexical(5))
        .await
        .unwrap();
    assert!(results.is_empty(), "deleted doc still searchable");

    let results = search_archive(&config, &DisabledProvider, "aardwolf", &lexical(5))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
}

#[tokio::test]
async fn test_cjk_phrase_query() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    write_doc(
        &config,
        "zh.md",
        "# 架构\n\n这个系统采用离线优先的设计方案。\n",
    );
    write_doc(&config, "en.md", "# Design\n\nAn offline first design.\n");

    index(&config, &DisabledProvider, IndexOptions::default()).await;

    let results = search_archive(&config, &DisabledProvider, "离线优先", &lexical(5))
        .await
        .unwrap();
    assert!(!results.is_empty(), "CJK phrase found nothing");
    assert_eq!(results[0].rel_path, "zh.md");
}

#[tokio::test]
async fn test_zero_norm_query_yields_empty_semantic_results() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    write_doc(&config, "a.md", "# A\n\nsome content to embed\n");

    let stats = index(&config, &ZeroProvider, IndexOptions { embed: true, ..Default::default() }).await;
    assert!(stats.embedded_chunks >= 1);

    let opts = SearchOptions {
        top_k: 5,
        semantic: true,
        hybrid: false,
    };
    let results = search_archive(&config, &ZeroProvider, "anything", &opts)
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_embedding_failure_never_aborts_indexing() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    write_doc(&config, "a.md", "# A\n\nstructural content survives\n");

    let stats = index(&config, &FailingProvider, IndexOptions { embed: true, ..Default::default() }).await;
    assert_eq!(stats.updated_docs, 1);
    assert_eq!(stats.embedded_chunks, 0);

    let results = search_archive(&config, &DisabledProvider, "survives", &lexical(5))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
}

#[tokio::test]
async fn test_hybrid_fusion_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    write_doc(&config, "rust.md", "# Rust\n\nrust ownership and borrowing\n");
    write_doc(&config, "py.md", "# Python\n\npython generators and asyncio\n");

    index(&config, &TopicProvider, IndexOptions { embed: true, ..Default::default() }).await;

    let opts = SearchOptions {
        top_k: 5,
        semantic: false,
        hybrid: true,
    };
    let results = search_archive(&config, &TopicProvider, "rust", &opts)
        .await
        .unwrap();
    assert!(!results.is_empty());
    let top = &results[0];
    assert_eq!(top.rel_path, "rust.md");
    // Present in both channels: fused score and hybrid label.
    assert_eq!(top.source, ScoreSource::Hybrid);
    assert!(top.score > 0.4, "fused score too low: {}", top.score);
    assert!(top.score <= 1.0);
}

#[tokio::test]
async fn test_hybrid_degrades_when_vectors_missing() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    write_doc(&config, "a.md", "# A\n\nplain keyword fallback\n");

    // No embeddings stored at all.
    index(&config, &DisabledProvider, IndexOptions::default()).await;

    let opts = SearchOptions {
        top_k: 5,
        semantic: false,
        hybrid: true,
    };
    // Zero-norm query vector => empty vector map => lexical labeling.
    let results = search_archive(&config, &ZeroProvider, "fallback", &opts)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].source, ScoreSource::Fts);
}

#[tokio::test]
async fn test_semantic_without_backend_fails_fast() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    write_doc(&config, "a.md", "# A\n\ncontent\n");
    index(&config, &DisabledProvider, IndexOptions::default()).await;

    let opts = SearchOptions {
        top_k: 5,
        semantic: true,
        hybrid: false,
    };
    let err = search_archive(&config, &DisabledProvider, "content", &opts).await;
    assert!(err.is_err());
}

#[tokio::test]
async fn test_search_before_index_fails_fast() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());

    let err = search_archive(&config, &DisabledProvider, "anything", &lexical(5))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("index"), "unexpected error: {err}");
}

#[tokio::test]
async fn test_only_paths_restricts_and_validates() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    write_doc(&config, "one.md", "# One\n\nfirst\n");
    write_doc(&config, "two.md", "# Two\n\nsecond\n");

    let opts = IndexOptions {
        only_paths: Some(vec!["one.md".to_string()]),
        ..Default::default()
    };
    let stats = index(&config, &DisabledProvider, opts).await;
    assert_eq!(stats.updated_docs, 1);

    // Path traversal is rejected before touching anything.
    let opts = IndexOptions {
        only_paths: Some(vec!["../outside.md".to_string()]),
        ..Default::default()
    };
    let err = index_archive(&config, &DisabledProvider, &opts).await;
    assert!(err.is_err());
}

#[tokio::test]
async fn test_rebuild_rederives_from_tree() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    write_doc(&config, "a.md", "# A\n\nalpha text\n");
    write_doc(&config, "b.md", "# B\n\nbeta text\n");

    index(&config, &DisabledProvider, IndexOptions::default()).await;
    let stats = index(
        &config,
        &DisabledProvider,
        IndexOptions {
            rebuild: true,
            ..Default::default()
        },
    )
    .await;
    // With the database discarded, everything counts as new again.
    assert_eq!(stats.updated_docs, 2);
    assert_eq!(stats.unchanged_docs, 0);

    let results = search_archive(&config, &DisabledProvider, "beta", &lexical(5))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
}

#[tokio::test]
async fn test_hidden_files_and_meta_are_skipped() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    write_doc(&config, "visible.md", "# V\n\nvisible content\n");
    write_doc(&config, ".hidden.md", "# H\n\nhidden content\n");
    fs::create_dir_all(config.archive.root.join(".private")).unwrap();
    write_doc(&config, ".private/inner.md", "# I\n\nprivate content\n");

    let stats = index(&config, &DisabledProvider, IndexOptions::default()).await;
    assert_eq!(stats.updated_docs, 1);

    // The indexer drops a meta.json in each directory; a second run must
    // not pick it up as a document.
    assert!(config.archive.root.join("meta.json").exists());
    let stats = index(&config, &DisabledProvider, IndexOptions::default()).await;
    assert_eq!(stats.updated_docs, 0);
    assert_eq!(stats.unchanged_docs, 1);
}

#[tokio::test]
async fn test_title_and_summary_derivation() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    // No front-matter title: fall back to the first H1.
    write_doc(&config, "h1.md", "# From Heading\n\nbody paragraph quokka\n");
    // No title anywhere: fall back to the file stem.
    write_doc(&config, "stem-name.md", "just a bare paragraph wombat\n");

    index(&config, &DisabledProvider, IndexOptions::default()).await;

    let results = search_archive(&config, &DisabledProvider, "quokka", &lexical(5))
        .await
        .unwrap();
    assert_eq!(results[0].title, "From Heading");

    let results = search_archive(&config, &DisabledProvider, "wombat", &lexical(5))
        .await
        .unwrap();
    assert_eq!(results[0].title, "stem-name");
}
