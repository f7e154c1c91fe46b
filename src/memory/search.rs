// src/memory/search.rs
// Hybrid retrieval over the memory corpus: FTS / LIKE / vector branches
// fused with Reciprocal Rank Fusion

use crate::error::Result;
use crate::memory::embeddings::blob_to_vector;
use crate::memory::indexer::MemoryIndexer;
use crate::memory::schema::{has_chunks_table, has_fts_table};
use anyhow::Result as AnyResult;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use tracing::{debug, warn};

/// RRF constant
const RRF_K: f64 = 60.0;

/// Search parameters
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub max_results: usize,
    pub min_score: f64,
    /// `None` searches all sources
    pub source_filter: Option<String>,
    pub use_hybrid: bool,
    pub vector_weight: f64,
    pub text_weight: f64,
    pub context_lines: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            max_results: 6,
            min_score: 0.35,
            source_filter: Some("memory".to_string()),
            use_hybrid: true,
            vector_weight: 0.7,
            text_weight: 0.3,
            context_lines: 2,
        }
    }
}

/// A FileRef bound to a result chunk
#[derive(Debug, Clone, serde::Serialize)]
pub struct FileRefBinding {
    pub file_id: String,
    pub category: String,
    pub metadata_json: Option<String>,
}

/// One ranked search result
#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub path: String,
    pub source: String,
    pub start_line: u32,
    pub end_line: u32,
    pub text: String,
    /// Normalised relevance in [0, 1]
    pub score: f64,
    pub context: String,
    pub file_refs: Vec<FileRefBinding>,
}

/// Search outcome, including degradation flags
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    /// True when the vector branch actually participated
    pub used_hybrid: bool,
    /// True when hybrid was requested but the query fell back to text-only
    pub degraded: bool,
}

#[derive(Debug, Clone)]
struct Candidate {
    chunk_id: String,
    path: String,
    source: String,
    start_line: u32,
    end_line: u32,
    text: String,
}

fn row_to_candidate(row: &rusqlite::Row) -> rusqlite::Result<Candidate> {
    Ok(Candidate {
        chunk_id: row.get(0)?,
        path: row.get(1)?,
        source: row.get(2)?,
        start_line: row.get::<_, i64>(3)? as u32,
        end_line: row.get::<_, i64>(4)? as u32,
        text: row.get(5)?,
    })
}

/// FTS MATCH ranked by bm25, query words quoted against FTS syntax
fn fts_candidates_sync(
    conn: &Connection,
    query: &str,
    limit: usize,
    source: Option<&str>,
) -> AnyResult<Vec<Candidate>> {
    let fts_query = query
        .split_whitespace()
        .map(|word| format!("\"{}\"", word.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ");

    let mut stmt = conn.prepare(
        "SELECT c.id, c.path, c.source, c.start_line, c.end_line, c.text
         FROM chunks_fts
         JOIN chunks c ON c.rowid = chunks_fts.rowid
         WHERE chunks_fts MATCH ?1 AND (?2 IS NULL OR c.source = ?2)
         ORDER BY bm25(chunks_fts)
         LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(params![fts_query, source, limit as i64], row_to_candidate)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

/// LIKE scan with a rough score of `min(1, match_count / 10)`
fn like_candidates_sync(
    conn: &Connection,
    query: &str,
    limit: usize,
    source: Option<&str>,
) -> AnyResult<Vec<(Candidate, f64)>> {
    let pattern = format!("%{}%", query);
    let mut stmt = conn.prepare(
        "SELECT c.id, c.path, c.source, c.start_line, c.end_line, c.text
         FROM chunks c
         WHERE c.text LIKE ?1 AND (?2 IS NULL OR c.source = ?2)
         LIMIT ?3",
    )?;
    let query_lower = query.to_lowercase();
    let rows = stmt
        .query_map(params![pattern, source, limit as i64], row_to_candidate)?
        .filter_map(|r| r.ok())
        .map(|c| {
            let matches = c.text.to_lowercase().matches(&query_lower).count();
            let score = (matches as f64 / 10.0).min(1.0);
            (c, score)
        })
        .collect();
    Ok(rows)
}

/// Vector branch: cosine similarity over stored embeddings, best first.
#[cfg(not(feature = "vectors"))]
fn vector_candidates_sync(
    conn: &Connection,
    query_vector: &[f32],
    limit: usize,
    source: Option<&str>,
) -> AnyResult<Vec<(Candidate, f64)>> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.path, c.source, c.start_line, c.end_line, c.text, v.embedding
         FROM chunk_vectors v
         JOIN chunks c ON c.id = v.chunk_id
         WHERE ?1 IS NULL OR c.source = ?1",
    )?;
    let mut scored: Vec<(Candidate, f64)> = stmt
        .query_map(params![source], |row| {
            let candidate = row_to_candidate(row)?;
            let blob: Vec<u8> = row.get(6)?;
            Ok((candidate, blob))
        })?
        .filter_map(|r| r.ok())
        .map(|(candidate, blob)| {
            let vector = blob_to_vector(&blob);
            let similarity = cosine_similarity(query_vector, &vector);
            (candidate, similarity)
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    Ok(scored)
}

/// Vector branch accelerated by sqlite-vec's distance function.
#[cfg(feature = "vectors")]
fn vector_candidates_sync(
    conn: &Connection,
    query_vector: &[f32],
    limit: usize,
    source: Option<&str>,
) -> AnyResult<Vec<(Candidate, f64)>> {
    use crate::memory::embeddings::vector_to_blob;

    let blob = vector_to_blob(query_vector);
    let mut stmt = conn.prepare(
        "SELECT c.id, c.path, c.source, c.start_line, c.end_line, c.text,
                vec_distance_cosine(v.embedding, ?1) AS dist
         FROM chunk_vectors v
         JOIN chunks c ON c.id = v.chunk_id
         WHERE (?2 IS NULL OR c.source = ?2) AND v.dims = ?3
         ORDER BY dist
         LIMIT ?4",
    )?;
    let rows = stmt
        .query_map(
            params![blob, source, query_vector.len() as i64, limit as i64],
            |row| {
                let candidate = row_to_candidate(row)?;
                let dist: f64 = row.get(6)?;
                Ok((candidate, 1.0 - dist))
            },
        )?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

/// Cosine similarity of two vectors; 0.0 on dimension mismatch or zero norm
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += *x as f64 * *y as f64;
        norm_a += *x as f64 * *x as f64;
        norm_b += *y as f64 * *y as f64;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Min-max normalisation into [0, 1]; a constant set maps to all-ones
pub fn normalize_scores(scores: &[f64]) -> Vec<f64> {
    if scores.is_empty() {
        return Vec::new();
    }
    let min = scores.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if (max - min).abs() < f64::EPSILON {
        return vec![1.0; scores.len()];
    }
    scores.iter().map(|s| (s - min) / (max - min)).collect()
}

/// Reciprocal Rank Fusion over the text and vector branch rankings.
///
/// `score(d) = w_text/(K + rank_text(d)) + w_vec/(K + rank_vec(d))`, then
/// min-max normalised over the fused set.
fn fuse_branches(
    text_ranked: &[Candidate],
    vec_ranked: &[(Candidate, f64)],
    text_weight: f64,
    vector_weight: f64,
) -> Vec<(Candidate, f64)> {
    let mut fused: HashMap<String, (Candidate, f64)> = HashMap::new();

    for (rank, candidate) in text_ranked.iter().enumerate() {
        let rrf = text_weight / (RRF_K + rank as f64 + 1.0);
        fused
            .entry(candidate.chunk_id.clone())
            .and_modify(|(_, s)| *s += rrf)
            .or_insert_with(|| (candidate.clone(), rrf));
    }
    for (rank, (candidate, _)) in vec_ranked.iter().enumerate() {
        let rrf = vector_weight / (RRF_K + rank as f64 + 1.0);
        fused
            .entry(candidate.chunk_id.clone())
            .and_modify(|(_, s)| *s += rrf)
            .or_insert_with(|| (candidate.clone(), rrf));
    }

    let mut entries: Vec<(Candidate, f64)> = fused.into_values().collect();
    let normalized = normalize_scores(&entries.iter().map(|(_, s)| *s).collect::<Vec<_>>());
    for (entry, norm) in entries.iter_mut().zip(normalized) {
        entry.1 = norm;
    }
    entries.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    entries
}

/// Surrounding context for a chunk: ±`context_lines` read from the source
/// file when it still exists, otherwise the chunk text itself (dangling
/// references never fail a query).
async fn context_for(candidate: &Candidate, context_lines: usize) -> String {
    if context_lines == 0 {
        return candidate.text.clone();
    }
    let Ok(content) = tokio::fs::read_to_string(&candidate.path).await else {
        return candidate.text.clone();
    };
    let lines: Vec<&str> = content.split('\n').collect();
    let start = (candidate.start_line as usize).saturating_sub(1 + context_lines);
    let end = ((candidate.end_line as usize) + context_lines).min(lines.len());
    if start >= end {
        return candidate.text.clone();
    }
    lines[start..end].join("\n")
}

impl MemoryIndexer {
    /// Hybrid search across every rotated index file.
    ///
    /// Branch availability decides the mode: hybrid (FTS/LIKE + vectors)
    /// when requested and an embedding provider answers, FTS-only otherwise,
    /// LIKE-only when FTS is absent or finds nothing. Duplicate chunk ids
    /// across index files keep their highest score.
    pub async fn search(&self, query: &str, opts: &SearchOptions) -> Result<SearchResponse> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(SearchResponse::default());
        }
        let fetch = opts.max_results.max(1) * 2;

        // Embed the query once, degrading to text-only on provider failure.
        let mut degraded = false;
        let query_embedding = if opts.use_hybrid {
            match self.provider() {
                Some(provider) => match provider.embed(query).await {
                    Ok(v) => Some(v),
                    Err(e) => {
                        warn!("Query embedding failed, degrading to text-only: {}", e);
                        degraded = true;
                        None
                    }
                },
                None => None,
            }
        } else {
            None
        };

        let mut all_scored: Vec<(Candidate, f64)> = Vec::new();
        let mut used_hybrid = false;

        for (pool, _status) in self.all_pools().await {
            let query_owned = query.to_string();
            let source = opts.source_filter.clone();
            let embedding = query_embedding.clone();
            let text_weight = opts.text_weight;
            let vector_weight = opts.vector_weight;

            let per_index = pool
                .interact(move |conn| {
                    search_one_index_sync(
                        conn,
                        &query_owned,
                        embedding.as_deref(),
                        fetch,
                        source.as_deref(),
                        text_weight,
                        vector_weight,
                    )
                })
                .await;

            match per_index {
                Ok((scored, hybrid)) => {
                    used_hybrid |= hybrid;
                    all_scored.extend(scored);
                }
                Err(e) => {
                    // A corrupt index file must not fail the query.
                    warn!("Search failed on one index file, skipping: {}", e);
                }
            }
        }

        // Highest-score-wins dedup across index files.
        all_scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let mut seen = std::collections::HashSet::new();
        let mut unique: Vec<(Candidate, f64)> = Vec::new();
        for (candidate, score) in all_scored {
            if seen.insert(candidate.chunk_id.clone()) {
                unique.push((candidate, score));
            }
        }

        unique.retain(|(_, score)| *score >= opts.min_score);
        unique.truncate(opts.max_results);

        // Enrich with context and bound FileRefs (batch per index file).
        let refs_map = self
            .file_refs_for_chunks(unique.iter().map(|(c, _)| c.chunk_id.clone()).collect())
            .await?;

        let mut results = Vec::with_capacity(unique.len());
        for (candidate, score) in unique {
            let context = context_for(&candidate, opts.context_lines).await;
            let file_refs = refs_map.get(&candidate.chunk_id).cloned().unwrap_or_default();
            results.push(SearchResult {
                chunk_id: candidate.chunk_id,
                path: candidate.path,
                source: candidate.source,
                start_line: candidate.start_line,
                end_line: candidate.end_line,
                text: candidate.text,
                score,
                context,
                file_refs,
            });
        }

        debug!(
            "Search '{}': {} results (hybrid={}, degraded={})",
            query,
            results.len(),
            used_hybrid,
            degraded
        );
        Ok(SearchResponse {
            results,
            used_hybrid,
            degraded: degraded && opts.use_hybrid,
        })
    }

    /// Batch-load FileRef bindings for a set of chunk ids.
    async fn file_refs_for_chunks(
        &self,
        chunk_ids: Vec<String>,
    ) -> Result<HashMap<String, Vec<FileRefBinding>>> {
        let mut map: HashMap<String, Vec<FileRefBinding>> = HashMap::new();
        if chunk_ids.is_empty() {
            return Ok(map);
        }
        for (pool, _) in self.all_pools().await {
            let ids = chunk_ids.clone();
            let rows: Vec<(String, FileRefBinding)> = pool
                .interact(move |conn| {
                    let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
                    let sql = format!(
                        "SELECT chunk_id, file_id, category, metadata
                         FROM chunk_file_refs
                         WHERE chunk_id IN ({})
                         ORDER BY created_at DESC",
                        placeholders
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt
                        .query_map(rusqlite::params_from_iter(ids.iter()), |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                FileRefBinding {
                                    file_id: row.get(1)?,
                                    category: row.get(2)?,
                                    metadata_json: row.get(3)?,
                                },
                            ))
                        })?
                        .filter_map(|r| r.ok())
                        .collect::<Vec<_>>();
                    Ok(rows)
                })
                .await?;
            for (chunk_id, binding) in rows {
                map.entry(chunk_id).or_default().push(binding);
            }
        }
        Ok(map)
    }
}

/// Run the branch searches and fusion against a single index file.
fn search_one_index_sync(
    conn: &Connection,
    query: &str,
    query_embedding: Option<&[f32]>,
    fetch: usize,
    source: Option<&str>,
    text_weight: f64,
    vector_weight: f64,
) -> AnyResult<(Vec<(Candidate, f64)>, bool)> {
    if !has_chunks_table(conn) {
        return Ok((Vec::new(), false));
    }

    let fts_available = has_fts_table(conn);
    let text_ranked: Vec<Candidate> = if fts_available {
        let matched = fts_candidates_sync(conn, query, fetch, source)?;
        if matched.is_empty() {
            // FTS tokenisers miss CJK text; fall back to the LIKE scan.
            like_candidates_sync(conn, query, fetch, source)?
                .into_iter()
                .map(|(c, _)| c)
                .collect()
        } else {
            matched
        }
    } else {
        Vec::new()
    };

    let vec_ranked: Vec<(Candidate, f64)> = match query_embedding {
        Some(embedding) => vector_candidates_sync(conn, embedding, fetch, source)?,
        None => Vec::new(),
    };
    let hybrid = !vec_ranked.is_empty();

    if text_ranked.is_empty() && vec_ranked.is_empty() {
        // LIKE-only path keeps its rough absolute score.
        let scored = like_candidates_sync(conn, query, fetch, source)?;
        return Ok((scored, false));
    }

    Ok((
        fuse_branches(&text_ranked, &vec_ranked, text_weight, vector_weight),
        hybrid,
    ))
}
