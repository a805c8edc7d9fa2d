//! Incremental indexer.
//!
//! Walks the archive tree, diffs it against the stored document states by
//! content hash, re-chunks what changed, and writes each document's rows
//! in one transaction. Embedding is an enrichment step that runs after
//! the structural write has committed: a failing embedding batch is
//! logged and skipped, never allowed to abort or corrupt indexing.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::chunk::{chunk_markdown, extract_links, guess_title, FmValue};
use crate::config::Config;
use crate::db;
use crate::dirmeta::{ensure_dir_meta, read_dir_meta};
use crate::embedding::{EmbeddingError, EmbeddingProvider};
use crate::models::{ChunkRecord, DocRecord, IndexStats};
use crate::store;
use crate::util::{normalize_rel_path, now_iso, rel_path_under, sha256_bytes, sha256_text};

#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    /// Discard the index database and re-derive everything from source.
    pub rebuild: bool,
    /// Request embeddings for updated chunks.
    pub embed: bool,
    /// Restrict the run to these archive-relative paths.
    pub only_paths: Option<Vec<String>>,
}

#[derive(Debug)]
struct ScannedFile {
    abs_path: PathBuf,
    rel_path: String,
    raw: Vec<u8>,
    size: i64,
    mtime_ns: i64,
    content_hash: String,
}

/// Bring the store in sync with the archive tree.
pub async fn index_archive(
    config: &Config,
    provider: &dyn EmbeddingProvider,
    opts: &IndexOptions,
) -> Result<IndexStats> {
    let root = &config.archive.root;
    let meta_filename = config.archive.meta_filename.as_str();
    let db_path = &config.db.path;

    info!(
        root = %root.display(),
        rebuild = opts.rebuild,
        embed = opts.embed,
        db = %db_path.display(),
        "index start"
    );

    if opts.rebuild {
        remove_db_files(db_path)?;
    }

    let pool = db::connect(db_path).await?;
    store::init_schema(&pool).await?;

    refresh_dir_meta_cache(&pool, root, meta_filename).await?;

    let existing = store::list_doc_states(&pool).await?;

    let mut files = scan_markdown_files(root, meta_filename)?;
    if let Some(only) = &opts.only_paths {
        let only: HashSet<String> = only
            .iter()
            .map(|p| normalize_rel_path(p))
            .collect::<Result<_>>()?;
        files.retain(|f| only.contains(&f.rel_path));
    }
    info!(files = files.len(), "scan markdown files");

    let cur_rel_set: HashSet<&str> = files.iter().map(|f| f.rel_path.as_str()).collect();
    let deleted: Vec<String> = existing
        .iter()
        .filter(|(rel_path, _)| !cur_rel_set.contains(rel_path.as_str()))
        .map(|(_, state)| state.doc_id.clone())
        .collect();

    let mut changed: Vec<ScannedFile> = Vec::new();
    let mut unchanged = 0usize;
    for file in files {
        match existing.get(&file.rel_path) {
            Some(prev)
                if prev.content_hash == file.content_hash
                    && prev.size == file.size
                    && prev.mtime_ns == file.mtime_ns =>
            {
                unchanged += 1;
            }
            _ => changed.push(file),
        }
    }
    info!(
        deleted = deleted.len(),
        changed = changed.len(),
        unchanged,
        "diff"
    );

    let mut tx = pool.begin().await?;
    for doc_id in &deleted {
        store::delete_doc(&mut tx, doc_id).await?;
    }
    tx.commit().await?;

    let can_embed = opts.embed && provider.is_enabled();
    if opts.embed && !can_embed {
        warn!("embed requested but embedding.base_url/model not configured");
    }

    let mut stats = IndexStats {
        deleted_docs: deleted.len(),
        unchanged_docs: unchanged,
        ..Default::default()
    };

    let total = changed.len();
    for (i, file) in changed.iter().enumerate() {
        info!(n = i + 1, total, path = %file.rel_path, "indexing");
        let (doc, chunks, links) = build_doc(config, file);

        let mut tx = pool.begin().await?;
        store::upsert_doc_and_chunks(&mut tx, &doc, &chunks, &links).await?;
        tx.commit().await?;

        stats.updated_docs += 1;
        stats.updated_chunks += chunks.len();

        if can_embed && !chunks.is_empty() {
            match embed_chunks(&pool, provider, config.embedding.batch_size, &chunks).await {
                Ok(n) => stats.embedded_chunks += n,
                Err(e) => {
                    warn!(path = %file.rel_path, error = %e, "embedding failed, skip");
                }
            }
        }
    }

    let mut tx = pool.begin().await?;
    store::log_action(
        &mut tx,
        "index",
        Some(&serde_json::json!({
            "ts": now_iso(),
            "rebuild": opts.rebuild,
            "deleted_docs": stats.deleted_docs,
            "updated_docs": stats.updated_docs,
            "updated_chunks": stats.updated_chunks,
            "embedded_chunks": stats.embedded_chunks,
            "unchanged_docs": stats.unchanged_docs,
        })),
    )
    .await?;
    tx.commit().await?;

    info!(
        deleted = stats.deleted_docs,
        updated_docs = stats.updated_docs,
        updated_chunks = stats.updated_chunks,
        embedded_chunks = stats.embedded_chunks,
        unchanged = stats.unchanged_docs,
        "index done"
    );

    pool.close().await;
    Ok(stats)
}

/// Chunk one file and derive its document metadata.
fn build_doc(config: &Config, file: &ScannedFile) -> (DocRecord, Vec<ChunkRecord>, Vec<crate::models::Link>) {
    let text = String::from_utf8_lossy(&file.raw);
    let (fm, chunks) = chunk_markdown(
        &text,
        config.chunking.max_chars,
        config.chunking.overlap_chars,
        config.chunking.min_chars,
    );

    let stem = Path::new(&file.rel_path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let title = fm
        .get("title")
        .and_then(FmValue::as_str)
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| guess_title(&text, &stem));

    let tags = fm.get("tags").map(FmValue::as_str_list).unwrap_or_default();
    let keywords = fm
        .get("keywords")
        .map(FmValue::as_str_list)
        .unwrap_or_default();

    let mut summary = fm
        .get("summary")
        .and_then(FmValue::as_str)
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    if summary.is_empty() {
        if let Some(first) = chunks.first() {
            summary = first
                .text
                .replace('\n', " ")
                .trim()
                .chars()
                .take(220)
                .collect();
        }
    }

    let chunk_records: Vec<ChunkRecord> = chunks
        .into_iter()
        .map(|ch| ChunkRecord {
            chunk_id: sha256_text(&format!("{}#{}", file.rel_path, ch.chunk_index)),
            chunk_index: ch.chunk_index as i64,
            heading_path: ch.heading_path,
            start_line: ch.start_line as i64,
            end_line: ch.end_line as i64,
            text: ch.text,
            text_hash: ch.text_hash,
        })
        .collect();

    let links = extract_links(&text);

    let doc = DocRecord {
        doc_id: sha256_text(&file.rel_path),
        rel_path: file.rel_path.clone(),
        abs_path: file.abs_path.to_string_lossy().to_string(),
        title,
        summary,
        tags,
        keywords,
        mtime_ns: file.mtime_ns,
        size: file.size,
        content_hash: file.content_hash.clone(),
    };
    (doc, chunk_records, links)
}

/// Embed a document's chunk texts in batches and store the vectors in one
/// transaction, so a mid-run failure writes nothing for this document.
async fn embed_chunks(
    pool: &SqlitePool,
    provider: &dyn EmbeddingProvider,
    batch_size: usize,
    chunks: &[ChunkRecord],
) -> Result<usize, EmbeddingError> {
    let batch_size = std::cmp::max(1, batch_size);
    let mut pairs: Vec<(String, Vec<f32>)> = Vec::with_capacity(chunks.len());

    for batch in chunks.chunks(batch_size) {
        debug!(batch = batch.len(), total = chunks.len(), "embed batch");
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let vecs = provider.embed(&texts).await?;
        if vecs.len() != batch.len() {
            return Err(EmbeddingError::BadResponse(format!(
                "expected {} vectors, got {}",
                batch.len(),
                vecs.len()
            )));
        }
        for (chunk, vec) in batch.iter().zip(vecs) {
            pairs.push((chunk.chunk_id.clone(), vec));
        }
    }

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| EmbeddingError::BadResponse(e.to_string()))?;
    store::upsert_embeddings(&mut tx, provider.model_name(), &pairs)
        .await
        .map_err(|e| EmbeddingError::BadResponse(e.to_string()))?;
    tx.commit()
        .await
        .map_err(|e| EmbeddingError::BadResponse(e.to_string()))?;

    Ok(pairs.len())
}

/// Walk every non-hidden subdirectory and refresh the cached metadata
/// snapshots. The per-directory files are the source of truth.
async fn refresh_dir_meta_cache(pool: &SqlitePool, root: &Path, meta_filename: &str) -> Result<()> {
    ensure_dir_meta(root, meta_filename)?;

    let mut tx = pool.begin().await?;
    for entry in WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| !is_hidden(e))
    {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let dir = entry.path();
        let rel = rel_path_under(root, dir);
        let rel = if rel.is_empty() { ".".to_string() } else { rel };
        let meta = read_dir_meta(dir, meta_filename)?;
        store::upsert_dir_meta(&mut tx, &rel, &meta).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Enumerate Markdown files under `root`, skipping hidden entries and the
/// per-directory metadata file, reading and hashing each candidate.
fn scan_markdown_files(root: &Path, meta_filename: &str) -> Result<Vec<ScannedFile>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| !is_hidden(e))
    {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name == meta_filename || !name.to_lowercase().ends_with(".md") {
            continue;
        }

        let abs_path = entry.path().to_path_buf();
        let metadata = entry
            .metadata()
            .with_context(|| format!("stat failed: {}", abs_path.display()))?;
        let mtime_ns = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        let raw = std::fs::read(&abs_path)
            .with_context(|| format!("read failed: {}", abs_path.display()))?;

        out.push(ScannedFile {
            rel_path: rel_path_under(root, &abs_path),
            content_hash: sha256_bytes(&raw),
            size: raw.len() as i64,
            mtime_ns,
            raw,
            abs_path,
        });
    }
    // Deterministic processing order.
    out.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(out)
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|s| s.starts_with('.'))
}

fn remove_db_files(db_path: &Path) -> Result<()> {
    for suffix in ["", "-wal", "-shm"] {
        let mut path = db_path.as_os_str().to_owned();
        path.push(suffix);
        let path = PathBuf::from(path);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
    }
    Ok(())
}
