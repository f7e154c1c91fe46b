// src/memory/indexer.rs
// Incremental indexing of memory files into the rotated SQLite indexes

use crate::db::DatabasePool;
use crate::error::{AgentError, Result};
use crate::memory::chunking::{chunk_content, Chunk};
use crate::memory::embeddings::{
    get_cached_embedding_sync, put_cached_embedding_sync, put_chunk_vector_sync, EmbeddingProvider,
};
use crate::memory::rotation::IndexRotation;
use crate::memory::schema::{ensure_memory_index_schema, SchemaStatus};
use crate::utils::{content_hash, now_ts, path_to_string};
use anyhow::Result as AnyResult;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Result of an `index_file` call
#[derive(Debug, Clone, Default)]
pub struct IndexOutcome {
    /// False when the file hash matched and nothing was written
    pub updated: bool,
    pub chunks_added: usize,
}

/// Aggregate index statistics across all rotated index files
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct IndexStatus {
    pub file_count: u64,
    pub chunk_count: u64,
    pub vector_count: u64,
    pub fts_available: bool,
    pub fts_error: Option<String>,
    pub index_files: Vec<String>,
}

/// Maintains the searchable index over the memory corpus. Writes are
/// serialised per index file by the pool; reads union every index file.
pub struct MemoryIndexer {
    rotation: IndexRotation,
    chunk_lines: usize,
    chunk_overlap: usize,
    fts_enabled: bool,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    pools: Mutex<HashMap<PathBuf, (Arc<DatabasePool>, SchemaStatus)>>,
}

impl MemoryIndexer {
    pub fn new(
        rotation: IndexRotation,
        chunk_lines: usize,
        chunk_overlap: usize,
        fts_enabled: bool,
        provider: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Self {
        Self {
            rotation,
            chunk_lines,
            chunk_overlap,
            fts_enabled,
            provider,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    pub fn provider(&self) -> Option<&Arc<dyn EmbeddingProvider>> {
        self.provider.as_ref()
    }

    /// Open (or reuse) the pool for one index file, applying the schema.
    async fn pool_for(&self, path: &Path) -> Result<(Arc<DatabasePool>, SchemaStatus)> {
        let mut pools = self.pools.lock().await;
        if let Some((pool, status)) = pools.get(path) {
            return Ok((pool.clone(), status.clone()));
        }
        let pool = Arc::new(DatabasePool::open(path).await?);
        let fts_enabled = self.fts_enabled;
        let status = pool
            .interact(move |conn| ensure_memory_index_schema(conn, fts_enabled))
            .await?;
        pools.insert(path.to_path_buf(), (pool.clone(), status.clone()));
        Ok((pool, status))
    }

    /// Pools for every existing index file, skipping ones that fail to open
    /// (a corrupt index must not take queries down).
    pub(crate) async fn all_pools(&self) -> Vec<(Arc<DatabasePool>, SchemaStatus)> {
        let mut result = Vec::new();
        for path in self.rotation.all_index_paths() {
            if !path.exists() {
                continue;
            }
            match self.pool_for(&path).await {
                Ok(entry) => result.push(entry),
                Err(e) => warn!("Skipping unreadable index {:?}: {}", path, e),
            }
        }
        result
    }

    /// Pool that writes should target (honouring rotation), plus every pool
    /// that already tracks `path` (for in-place updates).
    async fn write_pool(&self, file_path: &str) -> Result<(Arc<DatabasePool>, SchemaStatus)> {
        // Prefer an index file that already knows this path.
        for index_path in self.rotation.all_index_paths() {
            if !index_path.exists() {
                continue;
            }
            let (pool, status) = self.pool_for(&index_path).await?;
            let file_path_owned = file_path.to_string();
            let known: Option<String> = pool
                .interact(move |conn| {
                    Ok(conn
                        .query_row(
                            "SELECT hash FROM files WHERE path = ?1",
                            params![file_path_owned],
                            |row| row.get(0),
                        )
                        .optional()?)
                })
                .await?;
            if known.is_some() {
                return Ok((pool, status));
            }
        }
        let current = self.rotation.current_index_path();
        self.pool_for(&current).await
    }

    /// Index one file. Returns `updated=false` when the stored hash matches
    /// and performs zero writes in that case.
    pub async fn index_file(&self, file_path: &Path) -> Result<IndexOutcome> {
        let content = match tokio::fs::read_to_string(file_path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AgentError::NotFound(format!("{:?}", file_path)))
            }
            Err(e) => return Err(e.into()),
        };
        let meta = tokio::fs::metadata(file_path).await?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let size = meta.len() as i64;

        let path_str = path_to_string(file_path);
        let file_hash = content_hash(content.as_bytes());
        let (pool, status) = self.write_pool(&path_str).await?;

        // Short-circuit on unchanged content.
        {
            let path_owned = path_str.clone();
            let existing: Option<String> = pool
                .interact(move |conn| {
                    Ok(conn
                        .query_row(
                            "SELECT hash FROM files WHERE path = ?1",
                            params![path_owned],
                            |row| row.get(0),
                        )
                        .optional()?)
                })
                .await?;
            if existing.as_deref() == Some(file_hash.as_str()) {
                return Ok(IndexOutcome {
                    updated: false,
                    chunks_added: 0,
                });
            }
        }

        let chunks = chunk_content(
            &content,
            &path_str,
            "memory",
            self.chunk_lines,
            self.chunk_overlap,
        );
        let chunks_added = chunks.len();

        let fts_available = status.fts_available;
        let path_owned = path_str.clone();
        let hash_owned = file_hash.clone();
        let chunks_for_db = chunks.clone();
        pool.interact(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO files (path, source, hash, mtime, size)
                 VALUES (?1, 'memory', ?2, ?3, ?4)
                 ON CONFLICT(path) DO UPDATE SET
                    source = excluded.source,
                    hash = excluded.hash,
                    mtime = excluded.mtime,
                    size = excluded.size",
                params![path_owned, hash_owned, mtime, size],
            )?;
            delete_chunks_for_path(&tx, &path_owned, fts_available)?;
            let now = now_ts();
            for chunk in &chunks_for_db {
                insert_chunk(&tx, chunk, now, fts_available)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?;

        debug!("Indexed {:?}: {} chunks", file_path, chunks_added);

        // Embedding generation is best-effort; failures degrade to FTS-only.
        if let Some(provider) = &self.provider {
            if let Err(e) = self.embed_chunks(&pool, provider.clone(), &chunks).await {
                warn!("Embedding generation failed for {:?}: {}", file_path, e);
            }
        }

        Ok(IndexOutcome {
            updated: true,
            chunks_added,
        })
    }

    async fn embed_chunks(
        &self,
        pool: &Arc<DatabasePool>,
        provider: Arc<dyn EmbeddingProvider>,
        chunks: &[Chunk],
    ) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        // Resolve cache hits first, keyed by text hash.
        let provider_name = provider.name().to_string();
        let model = provider.model().to_string();
        let keys: Vec<(String, String)> = chunks
            .iter()
            .map(|c| (c.id.clone(), c.hash.clone()))
            .collect();
        let cached: HashMap<String, Vec<f32>> = {
            let provider_name = provider_name.clone();
            let model = model.clone();
            let keys = keys.clone();
            pool.interact(move |conn| {
                let mut hits = HashMap::new();
                for (chunk_id, hash) in &keys {
                    if let Some(v) =
                        get_cached_embedding_sync(conn, &provider_name, &model, hash)?
                    {
                        hits.insert(chunk_id.clone(), v);
                    }
                }
                Ok(hits)
            })
            .await?
        };

        let missing: Vec<&Chunk> = chunks.iter().filter(|c| !cached.contains_key(&c.id)).collect();
        let mut fresh: Vec<(String, String, Vec<f32>)> = Vec::new();
        if !missing.is_empty() {
            let texts: Vec<String> = missing.iter().map(|c| c.text.clone()).collect();
            let vectors = provider
                .embed_batch(&texts)
                .await
                .map_err(|e| AgentError::Embedding(e.to_string()))?;
            for (chunk, vector) in missing.iter().zip(vectors) {
                fresh.push((chunk.id.clone(), chunk.hash.clone(), vector));
            }
        }

        let cached_rows: Vec<(String, Vec<f32>)> = cached.into_iter().collect();
        pool.interact(move |conn| {
            let now = now_ts();
            for (chunk_id, vector) in &cached_rows {
                put_chunk_vector_sync(conn, chunk_id, vector, now)?;
            }
            for (chunk_id, hash, vector) in &fresh {
                put_cached_embedding_sync(conn, &provider_name, &model, hash, vector, now)?;
                put_chunk_vector_sync(conn, chunk_id, vector, now)?;
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Remove a file (and its chunks/vectors) from every index that has it.
    pub async fn remove_file(&self, file_path: &Path) -> Result<()> {
        let path_str = path_to_string(file_path);
        for (pool, status) in self.all_pools().await {
            let path_owned = path_str.clone();
            let fts_available = status.fts_available;
            pool.interact(move |conn| {
                let tx = conn.transaction()?;
                delete_chunks_for_path(&tx, &path_owned, fts_available)?;
                tx.execute("DELETE FROM files WHERE path = ?1", params![path_owned])?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        }
        Ok(())
    }

    /// `(mtime, size)` the index knows for a path, if any (watcher dirtiness
    /// check). Scans all index files.
    pub async fn known_file_state(&self, file_path: &Path) -> Result<Option<(i64, i64)>> {
        let path_str = path_to_string(file_path);
        for (pool, _) in self.all_pools().await {
            let path_owned = path_str.clone();
            let found: Option<(i64, i64)> = pool
                .interact(move |conn| {
                    Ok(conn
                        .query_row(
                            "SELECT mtime, size FROM files WHERE path = ?1",
                            params![path_owned],
                            |row| Ok((row.get(0)?, row.get(1)?)),
                        )
                        .optional()?)
                })
                .await?;
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    /// Bind FileRefs to a chunk in whichever index file holds it.
    pub async fn add_file_refs(
        &self,
        chunk_id: &str,
        refs: Vec<(String, String, Option<String>)>,
    ) -> Result<usize> {
        if refs.is_empty() {
            return Ok(0);
        }
        for (pool, _) in self.all_pools().await {
            let chunk_id_owned = chunk_id.to_string();
            let has_chunk: bool = pool
                .interact(move |conn| {
                    Ok(conn
                        .query_row(
                            "SELECT 1 FROM chunks WHERE id = ?1",
                            params![chunk_id_owned],
                            |_| Ok(()),
                        )
                        .optional()?
                        .is_some())
                })
                .await?;
            if !has_chunk {
                continue;
            }
            let chunk_id_owned = chunk_id.to_string();
            let refs_owned = refs.clone();
            let added = pool
                .interact(move |conn| {
                    let now = now_ts();
                    let mut count = 0usize;
                    for (file_id, category, metadata_json) in &refs_owned {
                        conn.execute(
                            "INSERT OR REPLACE INTO chunk_file_refs
                                (chunk_id, file_id, category, metadata, created_at)
                             VALUES (?1, ?2, ?3, ?4, ?5)",
                            params![chunk_id_owned, file_id, category, metadata_json, now],
                        )?;
                        count += 1;
                    }
                    Ok(count)
                })
                .await?;
            return Ok(added);
        }
        Ok(0)
    }

    /// Aggregate statistics across every index file.
    pub async fn status(&self) -> Result<IndexStatus> {
        let mut status = IndexStatus {
            fts_available: false,
            ..Default::default()
        };
        for path in self.rotation.all_index_paths() {
            if !path.exists() {
                continue;
            }
            let (pool, schema) = self.pool_for(&path).await?;
            let (files, chunks, vectors): (i64, i64, i64) = pool
                .interact(|conn| {
                    let files = conn.query_row("SELECT COUNT(*) FROM files", [], |r| r.get(0))?;
                    let chunks = conn.query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))?;
                    let vectors =
                        conn.query_row("SELECT COUNT(*) FROM chunk_vectors", [], |r| r.get(0))?;
                    Ok((files, chunks, vectors))
                })
                .await?;
            status.file_count += files as u64;
            status.chunk_count += chunks as u64;
            status.vector_count += vectors as u64;
            status.fts_available |= schema.fts_available;
            if status.fts_error.is_none() {
                status.fts_error = schema.fts_error;
            }
            status.index_files.push(
                path.file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default(),
            );
        }
        Ok(status)
    }
}

fn delete_chunks_for_path(conn: &Connection, path: &str, fts_available: bool) -> AnyResult<()> {
    if fts_available {
        conn.execute("DELETE FROM chunks_fts WHERE path = ?1", params![path])?;
    }
    conn.execute(
        "DELETE FROM chunk_vectors WHERE chunk_id IN (SELECT id FROM chunks WHERE path = ?1)",
        params![path],
    )?;
    conn.execute("DELETE FROM chunks WHERE path = ?1", params![path])?;
    Ok(())
}

fn insert_chunk(conn: &Connection, chunk: &Chunk, now: i64, fts_available: bool) -> AnyResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO chunks
            (id, path, source, start_line, end_line, hash, text, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            chunk.id,
            chunk.path,
            chunk.source,
            chunk.start_line,
            chunk.end_line,
            chunk.hash,
            chunk.text,
            now
        ],
    )?;
    if fts_available {
        conn.execute(
            "INSERT INTO chunks_fts (rowid, text, id, path, source, start_line, end_line)
             VALUES ((SELECT rowid FROM chunks WHERE id = ?1), ?2, ?1, ?3, ?4, ?5, ?6)",
            params![
                chunk.id,
                chunk.text,
                chunk.path,
                chunk.source,
                chunk.start_line,
                chunk.end_line
            ],
        )?;
    }
    Ok(())
}
