//! Hybrid retrieval engine.
//!
//! Three modes over the same store: lexical (FTS/bm25), semantic (exact
//! cosine scan over stored vectors), and hybrid (fixed-weight fusion of
//! both). Retrieval is a direct user request, so unlike indexing it
//! fails fast: a missing index or an unconfigured embedding backend is
//! an error, never a silent fallback.

use anyhow::{anyhow, bail, Result};
use sqlx::SqlitePool;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tracing::debug;

use crate::config::Config;
use crate::db;
use crate::embedding::{blob_to_vec, dot, l2_norm, EmbeddingProvider};
use crate::models::{RetrievedChunk, ScoreSource};
use crate::store;

/// Lexical weight in hybrid fusion.
const HYBRID_ALPHA: f64 = 0.6;
/// Vector weight in hybrid fusion.
const HYBRID_BETA: f64 = 0.4;

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub top_k: usize,
    pub semantic: bool,
    pub hybrid: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: 8,
            semantic: false,
            hybrid: false,
        }
    }
}

/// Run a query against the archive index and return ranked passages.
pub async fn search_archive(
    config: &Config,
    provider: &dyn EmbeddingProvider,
    query: &str,
    opts: &SearchOptions,
) -> Result<Vec<RetrievedChunk>> {
    let db_path = &config.db.path;
    if !db_path.exists() {
        bail!("index database not found, run: kb index");
    }
    let pool = db::connect(db_path).await?;
    let result = search_pool(&pool, config, provider, query, opts).await;
    pool.close().await;
    result
}

async fn search_pool(
    pool: &SqlitePool,
    config: &Config,
    provider: &dyn EmbeddingProvider,
    query: &str,
    opts: &SearchOptions,
) -> Result<Vec<RetrievedChunk>> {
    let fts_k = candidate_k(config.retrieval.fts_candidates, opts.top_k);
    let vec_k = candidate_k(config.retrieval.vec_candidates, opts.top_k);

    let want_fts = !opts.semantic || opts.hybrid;
    let want_vec = opts.semantic || opts.hybrid;

    let fts_scores: HashMap<String, f64> = if want_fts {
        let hits = store::search_fts(pool, query, fts_k as i64).await?;
        debug!(hits = hits.len(), "fts candidates");
        hits.into_iter()
            .map(|h| (h.chunk_id, fts_sim(h.score)))
            .collect()
    } else {
        HashMap::new()
    };

    let vec_scores: HashMap<String, f64> = if want_vec {
        if !provider.is_enabled() {
            bail!("semantic search requires embedding.base_url/model in config");
        }
        let scores = semantic_scores(pool, provider, query, vec_k).await?;
        debug!(hits = scores.len(), "vector candidates");
        scores
    } else {
        HashMap::new()
    };

    let merged = fuse_scores(&fts_scores, &vec_scores, opts.semantic, opts.hybrid);

    let mut ranked: Vec<(String, f64, ScoreSource)> = merged
        .into_iter()
        .map(|(cid, (score, source))| (cid, score, source))
        .collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    ranked.truncate(opts.top_k);

    let chunk_ids: Vec<String> = ranked.iter().map(|(cid, _, _)| cid.clone()).collect();
    let by_id: HashMap<&str, (f64, ScoreSource)> = ranked
        .iter()
        .map(|(cid, score, source)| (cid.as_str(), (*score, *source)))
        .collect();

    let rows = store::fetch_chunk_records(pool, &chunk_ids).await?;
    let out = rows
        .into_iter()
        .map(|row| {
            let (score, source) = by_id[row.chunk_id.as_str()];
            RetrievedChunk {
                chunk_id: row.chunk_id,
                rel_path: row.rel_path,
                title: row.title,
                heading_path: row.heading_path,
                start_line: row.start_line,
                end_line: row.end_line,
                text: row.text,
                score,
                source,
            }
        })
        .collect();
    Ok(out)
}

fn candidate_k(configured: usize, top_k: usize) -> usize {
    if configured > 0 {
        configured
    } else {
        std::cmp::max(50, top_k * 5)
    }
}

/// Map a bm25 score (lower = more relevant) to a similarity in (0, 1].
/// Negative raw scores are clamped first: "more negative" must never read
/// as "less relevant".
fn fts_sim(bm25_score: f64) -> f64 {
    1.0 / (1.0 + bm25_score.max(0.0))
}

/// Merge the two score maps under the fusion policy.
///
/// Hybrid with a non-empty vector map weights lexical by 0.6 and vector
/// by 0.4; membership decides the source label. Hybrid with an empty
/// vector map degrades to plain lexical scoring. Semantic-only returns
/// the vector map as-is.
fn fuse_scores(
    fts_scores: &HashMap<String, f64>,
    vec_scores: &HashMap<String, f64>,
    semantic: bool,
    hybrid: bool,
) -> HashMap<String, (f64, ScoreSource)> {
    let mut merged: HashMap<String, (f64, ScoreSource)> = HashMap::new();
    if hybrid && !vec_scores.is_empty() {
        for (cid, s) in fts_scores {
            merged.insert(cid.clone(), (HYBRID_ALPHA * s, ScoreSource::Fts));
        }
        for (cid, s) in vec_scores {
            match merged.get_mut(cid) {
                Some(entry) => {
                    entry.0 += HYBRID_BETA * s;
                    entry.1 = ScoreSource::Hybrid;
                }
                None => {
                    merged.insert(cid.clone(), (HYBRID_BETA * s, ScoreSource::Vec));
                }
            }
        }
    } else if semantic && !hybrid {
        for (cid, s) in vec_scores {
            merged.insert(cid.clone(), (*s, ScoreSource::Vec));
        }
    } else {
        for (cid, s) in fts_scores {
            merged.insert(cid.clone(), (*s, ScoreSource::Fts));
        }
    }
    merged
}

/// Exact linear scan over the stored vectors for the active model,
/// keeping the top `top_k` candidates in a bounded min-heap.
///
/// A query vector with zero norm yields an empty map — a defined result,
/// not an error, so an all-zero embedding can never divide by zero.
async fn semantic_scores(
    pool: &SqlitePool,
    provider: &dyn EmbeddingProvider,
    query: &str,
    top_k: usize,
) -> Result<HashMap<String, f64>> {
    let query_vec = provider
        .embed(&[query.to_string()])
        .await
        .map_err(|e| anyhow!(e))?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("empty embedding response for query"))?;
    let q_norm = l2_norm(&query_vec);
    if q_norm <= 0.0 {
        return Ok(HashMap::new());
    }

    let mut heap: BinaryHeap<Reverse<HeapHit>> = BinaryHeap::with_capacity(top_k);
    for row in store::iter_embeddings(pool, provider.model_name()).await? {
        if row.dim <= 0 || row.norm <= 0.0 {
            continue;
        }
        let stored = blob_to_vec(&row.blob);
        let score = dot(&query_vec, &stored) / (q_norm * row.norm);
        let hit = HeapHit {
            score,
            chunk_id: row.chunk_id,
        };
        if heap.len() < top_k {
            heap.push(Reverse(hit));
        } else if heap.peek().is_some_and(|Reverse(min)| hit.score > min.score) {
            heap.pop();
            heap.push(Reverse(hit));
        }
    }

    Ok(heap
        .into_iter()
        .map(|Reverse(hit)| (hit.chunk_id, hit.score.max(0.0)))
        .collect())
}

#[derive(Debug, PartialEq)]
struct HeapHit {
    score: f64,
    chunk_id: String,
}

impl Eq for HeapHit {}

impl Ord for HeapHit {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| self.chunk_id.cmp(&other.chunk_id))
    }
}

impl PartialOrd for HeapHit {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, f64)]) -> HashMap<String, f64> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[test]
    fn test_fts_sim_transform() {
        assert!((fts_sim(0.0) - 1.0).abs() < 1e-12);
        assert!((fts_sim(1.0) - 0.5).abs() < 1e-12);
        // Negative bm25 must clamp to the best similarity, not beyond it.
        assert!((fts_sim(-5.0) - 1.0).abs() < 1e-12);
        assert!(fts_sim(1e9) > 0.0);
    }

    #[test]
    fn test_fuse_hybrid_weights_and_labels() {
        let fts = map(&[("both", 0.8), ("fts_only", 0.5)]);
        let vec = map(&[("both", 0.6), ("vec_only", 0.9)]);
        let merged = fuse_scores(&fts, &vec, false, true);

        let (score, source) = merged["both"];
        assert!((score - (0.6 * 0.8 + 0.4 * 0.6)).abs() < 1e-12);
        assert_eq!(source, ScoreSource::Hybrid);

        let (score, source) = merged["fts_only"];
        assert!((score - 0.6 * 0.5).abs() < 1e-12);
        assert_eq!(source, ScoreSource::Fts);

        let (score, source) = merged["vec_only"];
        assert!((score - 0.4 * 0.9).abs() < 1e-12);
        assert_eq!(source, ScoreSource::Vec);
    }

    #[test]
    fn test_fuse_hybrid_degrades_without_vectors() {
        let fts = map(&[("a", 0.7)]);
        let merged = fuse_scores(&fts, &HashMap::new(), false, true);
        let (score, source) = merged["a"];
        assert!((score - 0.7).abs() < 1e-12);
        assert_eq!(source, ScoreSource::Fts);
    }

    #[test]
    fn test_fuse_semantic_only() {
        let fts = map(&[("a", 0.7)]);
        let vec = map(&[("b", 0.5)]);
        let merged = fuse_scores(&fts, &vec, true, false);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged["b"], (0.5, ScoreSource::Vec));
    }

    #[test]
    fn test_candidate_k_floor() {
        assert_eq!(candidate_k(0, 8), 50);
        assert_eq!(candidate_k(0, 20), 100);
        assert_eq!(candidate_k(17, 8), 17);
    }

    #[test]
    fn test_heap_hit_ordering() {
        let mut heap: BinaryHeap<Reverse<HeapHit>> = BinaryHeap::new();
        for (score, id) in [(0.2, "a"), (0.9, "b"), (0.5, "c")] {
            heap.push(Reverse(HeapHit {
                score,
                chunk_id: id.to_string(),
            }));
        }
        // Min-heap: the worst candidate is at the top.
        assert_eq!(heap.peek().unwrap().0.chunk_id, "a");
    }
}
