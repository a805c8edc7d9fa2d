//! SQLite persistence layer.
//!
//! Owns the schema and the read/write primitives. Mutating operations
//! take a `&mut SqliteConnection` so the caller decides the transaction
//! boundary — a document's doc row, chunk rows, FTS rows, and link rows
//! must commit atomically, and only the indexer knows what "one logical
//! update" is.
//!
//! The FTS index uses the `unicode61` tokenizer, which does not segment
//! CJK script. Indexed text and whitespace-free CJK queries are both run
//! through the same per-character spacing so phrase queries keep working;
//! applying the rewrite on only one side silently drops recall to zero.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::Row;
use std::collections::HashMap;

use crate::dirmeta::DirMeta;
use crate::embedding::{l2_norm, vec_to_blob};
use crate::models::{ChunkRecord, DocRecord, Link};
use crate::util::{json_compact, now_iso, sha256_text};

/// One lexical hit: bm25 score, lower is more relevant.
#[derive(Debug, Clone)]
pub struct FtsHit {
    pub chunk_id: String,
    pub score: f64,
}

/// Chunk row joined with its document, as returned by
/// [`fetch_chunk_records`].
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub chunk_id: String,
    pub chunk_index: i64,
    pub heading_path: String,
    pub start_line: i64,
    pub end_line: i64,
    pub text: String,
    pub rel_path: String,
    pub title: String,
}

/// Stored document state used for the incremental diff.
#[derive(Debug, Clone)]
pub struct DocState {
    pub doc_id: String,
    pub content_hash: String,
    pub mtime_ns: i64,
    pub size: i64,
}

#[derive(Debug, Clone)]
pub struct EmbeddingRow {
    pub chunk_id: String,
    pub dim: i64,
    pub blob: Vec<u8>,
    pub norm: f64,
}

/// Create all tables and indexes. Idempotent.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS docs (
          doc_id TEXT PRIMARY KEY,
          rel_path TEXT UNIQUE NOT NULL,
          abs_path TEXT NOT NULL,
          title TEXT,
          summary TEXT,
          tags_json TEXT,
          keywords_json TEXT,
          mtime_ns INTEGER,
          size INTEGER,
          content_hash TEXT NOT NULL,
          updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
          chunk_id TEXT PRIMARY KEY,
          doc_id TEXT NOT NULL,
          chunk_index INTEGER NOT NULL,
          heading_path TEXT,
          start_line INTEGER,
          end_line INTEGER,
          text TEXT NOT NULL,
          text_hash TEXT NOT NULL,
          FOREIGN KEY(doc_id) REFERENCES docs(doc_id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_doc ON chunks(doc_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE VIRTUAL TABLE IF NOT EXISTS chunk_fts
        USING fts5(chunk_id UNINDEXED, text, title, rel_path, heading_path, tokenize='unicode61')
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
          chunk_id TEXT PRIMARY KEY,
          model TEXT NOT NULL,
          dim INTEGER NOT NULL,
          embedding BLOB NOT NULL,
          norm REAL NOT NULL,
          created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dirs (
          dir_rel_path TEXT PRIMARY KEY,
          meta_json TEXT NOT NULL,
          meta_hash TEXT NOT NULL,
          updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS links (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          source_rel_path TEXT NOT NULL,
          target TEXT NOT NULL,
          kind TEXT NOT NULL,
          anchor TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          ts TEXT NOT NULL,
          action TEXT NOT NULL,
          details_json TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Append one audit-log row. Entries are never updated or deleted.
pub async fn log_action(
    conn: &mut SqliteConnection,
    action: &str,
    details: Option<&serde_json::Value>,
) -> Result<()> {
    let details_json = match details {
        Some(v) => Some(json_compact(v)?),
        None => None,
    };
    sqlx::query("INSERT INTO audit_log(ts, action, details_json) VALUES (?, ?, ?)")
        .bind(now_iso())
        .bind(action)
        .bind(details_json)
        .execute(conn)
        .await?;
    Ok(())
}

/// Refresh one directory's cached metadata snapshot.
pub async fn upsert_dir_meta(
    conn: &mut SqliteConnection,
    dir_rel_path: &str,
    meta: &DirMeta,
) -> Result<()> {
    let meta_json = json_compact(meta)?;
    let meta_hash = sha256_text(&meta_json);
    sqlx::query(
        r#"
        INSERT INTO dirs(dir_rel_path, meta_json, meta_hash, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(dir_rel_path) DO UPDATE SET
          meta_json=excluded.meta_json,
          meta_hash=excluded.meta_hash,
          updated_at=excluded.updated_at
        "#,
    )
    .bind(dir_rel_path)
    .bind(meta_json)
    .bind(meta_hash)
    .bind(now_iso())
    .execute(conn)
    .await?;
    Ok(())
}

/// Delete a document and everything derived from it. The chunk rows go
/// via cascade; the FTS shadow rows and embeddings are not foreign-key
/// linked and must be removed explicitly.
pub async fn delete_doc(conn: &mut SqliteConnection, doc_id: &str) -> Result<()> {
    let rel_path: Option<String> = sqlx::query_scalar("SELECT rel_path FROM docs WHERE doc_id = ?")
        .bind(doc_id)
        .fetch_optional(&mut *conn)
        .await?;
    let Some(rel_path) = rel_path else {
        return Ok(());
    };

    sqlx::query(
        "DELETE FROM embeddings WHERE chunk_id IN (SELECT chunk_id FROM chunks WHERE doc_id = ?)",
    )
    .bind(doc_id)
    .execute(&mut *conn)
    .await?;
    sqlx::query("DELETE FROM chunk_fts WHERE rel_path = ?")
        .bind(&rel_path)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM docs WHERE doc_id = ?")
        .bind(doc_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Replace a document and its derived rows in one shot.
///
/// Prior chunks, FTS rows, links, and the embeddings of the prior chunk
/// ids are deleted before insert — chunk identity is not stable across
/// re-chunks, so stale embeddings cannot be kept. Must run inside a
/// caller-managed transaction.
pub async fn upsert_doc_and_chunks(
    conn: &mut SqliteConnection,
    doc: &DocRecord,
    chunks: &[ChunkRecord],
    links: &[Link],
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO docs(doc_id, rel_path, abs_path, title, summary, tags_json, keywords_json,
                         mtime_ns, size, content_hash, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(doc_id) DO UPDATE SET
          rel_path=excluded.rel_path,
          abs_path=excluded.abs_path,
          title=excluded.title,
          summary=excluded.summary,
          tags_json=excluded.tags_json,
          keywords_json=excluded.keywords_json,
          mtime_ns=excluded.mtime_ns,
          size=excluded.size,
          content_hash=excluded.content_hash,
          updated_at=excluded.updated_at
        "#,
    )
    .bind(&doc.doc_id)
    .bind(&doc.rel_path)
    .bind(&doc.abs_path)
    .bind(&doc.title)
    .bind(&doc.summary)
    .bind(json_compact(&doc.tags)?)
    .bind(json_compact(&doc.keywords)?)
    .bind(doc.mtime_ns)
    .bind(doc.size)
    .bind(&doc.content_hash)
    .bind(now_iso())
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        "DELETE FROM embeddings WHERE chunk_id IN (SELECT chunk_id FROM chunks WHERE doc_id = ?)",
    )
    .bind(&doc.doc_id)
    .execute(&mut *conn)
    .await?;
    sqlx::query("DELETE FROM chunks WHERE doc_id = ?")
        .bind(&doc.doc_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM chunk_fts WHERE rel_path = ?")
        .bind(&doc.rel_path)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM links WHERE source_rel_path = ?")
        .bind(&doc.rel_path)
        .execute(&mut *conn)
        .await?;

    for chunk in chunks {
        sqlx::query(
            r#"
            INSERT INTO chunks(chunk_id, doc_id, chunk_index, heading_path, start_line, end_line, text, text_hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.chunk_id)
        .bind(&doc.doc_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.heading_path)
        .bind(chunk.start_line)
        .bind(chunk.end_line)
        .bind(&chunk.text)
        .bind(&chunk.text_hash)
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "INSERT INTO chunk_fts(chunk_id, text, title, rel_path, heading_path) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&chunk.chunk_id)
        .bind(cjk_space(&chunk.text))
        .bind(cjk_space(&doc.title))
        .bind(&doc.rel_path)
        .bind(cjk_space(&chunk.heading_path))
        .execute(&mut *conn)
        .await?;
    }

    for link in links {
        if link.target.is_empty() {
            continue;
        }
        sqlx::query(
            "INSERT INTO links(source_rel_path, target, kind, anchor) VALUES (?, ?, ?, ?)",
        )
        .bind(&doc.rel_path)
        .bind(&link.target)
        .bind(link.kind.as_str())
        .bind(&link.anchor)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

/// Store embedding vectors, replacing any prior row per chunk. The L2
/// norm is precomputed here so query-time scans never recompute it.
pub async fn upsert_embeddings(
    conn: &mut SqliteConnection,
    model: &str,
    embeddings: &[(String, Vec<f32>)],
) -> Result<()> {
    for (chunk_id, vec) in embeddings {
        let blob = vec_to_blob(vec);
        let norm = l2_norm(vec);
        sqlx::query(
            r#"
            INSERT INTO embeddings(chunk_id, model, dim, embedding, norm, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
              model=excluded.model,
              dim=excluded.dim,
              embedding=excluded.embedding,
              norm=excluded.norm,
              created_at=excluded.created_at
            "#,
        )
        .bind(chunk_id)
        .bind(model)
        .bind(vec.len() as i64)
        .bind(blob)
        .bind(norm)
        .bind(now_iso())
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Current per-document state, keyed by `rel_path`.
pub async fn list_doc_states(pool: &SqlitePool) -> Result<HashMap<String, DocState>> {
    let rows = sqlx::query("SELECT doc_id, rel_path, content_hash, mtime_ns, size FROM docs")
        .fetch_all(pool)
        .await?;
    let mut out = HashMap::with_capacity(rows.len());
    for row in rows {
        out.insert(
            row.get::<String, _>("rel_path"),
            DocState {
                doc_id: row.get("doc_id"),
                content_hash: row.get("content_hash"),
                mtime_ns: row.try_get("mtime_ns").unwrap_or(0),
                size: row.try_get("size").unwrap_or(0),
            },
        );
    }
    Ok(out)
}

/// Lexical search over the FTS index, ranked by bm25 ascending.
pub async fn search_fts(pool: &SqlitePool, query: &str, limit: i64) -> Result<Vec<FtsHit>> {
    let q = fts_query(query);
    if q.is_empty() {
        return Ok(Vec::new());
    }
    let rows = sqlx::query(
        r#"
        SELECT chunk_id, bm25(chunk_fts) AS score
        FROM chunk_fts
        WHERE chunk_fts MATCH ?
        ORDER BY score
        LIMIT ?
        "#,
    )
    .bind(q)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| FtsHit {
            chunk_id: row.get("chunk_id"),
            score: row.get("score"),
        })
        .collect())
}

/// Hydrate chunk rows for the given ids, preserving the input order.
/// Callers rely on this to re-attach ranking order without a second sort.
pub async fn fetch_chunk_records(
    pool: &SqlitePool,
    chunk_ids: &[String],
) -> Result<Vec<StoredChunk>> {
    if chunk_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; chunk_ids.len()].join(",");
    let sql = format!(
        r#"
        SELECT c.chunk_id, c.chunk_index, c.heading_path, c.start_line, c.end_line, c.text,
               d.rel_path, d.title
        FROM chunks c
        JOIN docs d ON d.doc_id = c.doc_id
        WHERE c.chunk_id IN ({placeholders})
        "#
    );
    let mut query = sqlx::query(&sql);
    for chunk_id in chunk_ids {
        query = query.bind(chunk_id);
    }
    let rows = query.fetch_all(pool).await?;

    let mut by_id: HashMap<String, StoredChunk> = HashMap::with_capacity(rows.len());
    for row in rows {
        let chunk = StoredChunk {
            chunk_id: row.get("chunk_id"),
            chunk_index: row.get("chunk_index"),
            heading_path: row.try_get("heading_path").unwrap_or_default(),
            start_line: row.try_get("start_line").unwrap_or(0),
            end_line: row.try_get("end_line").unwrap_or(0),
            text: row.get("text"),
            rel_path: row.get("rel_path"),
            title: row.try_get("title").unwrap_or_default(),
        };
        by_id.insert(chunk.chunk_id.clone(), chunk);
    }
    Ok(chunk_ids
        .iter()
        .filter_map(|cid| by_id.remove(cid))
        .collect())
}

/// All stored vectors for one model. Exact linear scan; similarity is the
/// caller's job.
pub async fn iter_embeddings(pool: &SqlitePool, model: &str) -> Result<Vec<EmbeddingRow>> {
    let rows = sqlx::query("SELECT chunk_id, dim, embedding, norm FROM embeddings WHERE model = ?")
        .bind(model)
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|row| EmbeddingRow {
            chunk_id: row.get("chunk_id"),
            dim: row.get("dim"),
            blob: row.get("embedding"),
            norm: row.get("norm"),
        })
        .collect())
}

// ============ CJK normalization ============

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}' | '\u{F900}'..='\u{FAFF}')
}

fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

/// Insert a space after every CJK character so `unicode61` sees one token
/// per character. Applied identically at index time and query time.
pub(crate) fn cjk_space(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        out.push(c);
        if is_cjk(c) {
            out.push(' ');
        }
    }
    out
}

/// Rewrite a user query for the FTS engine. Queries containing whitespace
/// pass through untouched; whitespace-free CJK queries become a quoted
/// phrase of per-character tokens.
pub(crate) fn fts_query(query: &str) -> String {
    let q = query.trim();
    if q.is_empty() {
        return String::new();
    }
    if q.contains(' ') || q.contains('\t') || q.contains('\n') {
        return q.to_string();
    }
    if contains_cjk(q) {
        let phrase = cjk_space(q).trim().replace('"', "");
        return format!("\"{phrase}\"");
    }
    q.to_string()
}
