//! Core data types shared across the indexing and retrieval pipeline.

use serde::{Deserialize, Serialize};

/// Document-level metadata written to the `docs` table.
///
/// `doc_id` is `sha256(rel_path)`, so re-scanning the same tree can never
/// mint a second identity for the same file.
#[derive(Debug, Clone)]
pub struct DocRecord {
    pub doc_id: String,
    pub rel_path: String,
    pub abs_path: String,
    pub title: String,
    pub summary: String,
    pub tags: Vec<String>,
    pub keywords: Vec<String>,
    pub mtime_ns: i64,
    pub size: i64,
    pub content_hash: String,
}

/// A contiguous passage of one document, ready for persistence.
///
/// `chunk_id` is `sha256(rel_path + "#" + chunk_index)`; chunk identity is
/// stable within one indexing pass only — every re-index of a document
/// replaces its chunk set wholesale.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub chunk_index: i64,
    pub heading_path: String,
    pub start_line: i64,
    pub end_line: i64,
    pub text: String,
    pub text_hash: String,
}

/// A link extracted from a document body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub target: String,
    pub kind: LinkKind,
    pub anchor: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Markdown,
    Wiki,
}

impl LinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkKind::Markdown => "md",
            LinkKind::Wiki => "wiki",
        }
    }
}

/// Which retrieval channel produced a result's score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreSource {
    Fts,
    Vec,
    Hybrid,
}

impl ScoreSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreSource::Fts => "fts",
            ScoreSource::Vec => "vec",
            ScoreSource::Hybrid => "hybrid",
        }
    }
}

/// A ranked passage returned by the retriever, hydrated with its source
/// attribution.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub rel_path: String,
    pub title: String,
    pub heading_path: String,
    pub start_line: i64,
    pub end_line: i64,
    pub text: String,
    pub score: f64,
    pub source: ScoreSource,
}

impl RetrievedChunk {
    /// The wire shape consumed by downstream collaborators.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "chunk_id": self.chunk_id,
            "path": self.rel_path,
            "title": self.title,
            "heading_path": self.heading_path,
            "line_range": [self.start_line, self.end_line],
            "score": self.score,
            "source": self.source.as_str(),
            "text": self.text,
        })
    }
}

/// Counters summarizing one indexing run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStats {
    pub deleted_docs: usize,
    pub updated_docs: usize,
    pub updated_chunks: usize,
    pub embedded_chunks: usize,
    pub unchanged_docs: usize,
}
