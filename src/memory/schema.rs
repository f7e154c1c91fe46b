// src/memory/schema.rs
// Memory index schema: files, chunks, FTS5, vectors, embedding cache,
// and chunk-to-FileRef bindings

use anyhow::Result;
use rusqlite::Connection;
use tracing::warn;

/// Outcome of schema creation. FTS5 may be unavailable at runtime; the index
/// then degrades to LIKE search and records why.
#[derive(Debug, Clone)]
pub struct SchemaStatus {
    pub fts_available: bool,
    pub fts_error: Option<String>,
}

/// Create all memory-index tables if missing. `fts_enabled=false` skips the
/// FTS virtual table entirely (also used to simulate FTS-less builds).
pub fn ensure_memory_index_schema(conn: &mut Connection, fts_enabled: bool) -> Result<SchemaStatus> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS files (
            path TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            hash TEXT NOT NULL,
            mtime INTEGER NOT NULL,
            size INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            path TEXT NOT NULL,
            source TEXT NOT NULL,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            hash TEXT NOT NULL,
            text TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_chunks_path ON chunks(path);
        CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source);
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id TEXT PRIMARY KEY,
            embedding BLOB NOT NULL,
            dims INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS embedding_cache (
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            embedding BLOB NOT NULL,
            dims INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (provider, model, content_hash)
        );
        CREATE TABLE IF NOT EXISTS chunk_file_refs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            chunk_id TEXT NOT NULL,
            file_id TEXT NOT NULL,
            category TEXT NOT NULL,
            metadata TEXT,
            created_at INTEGER NOT NULL,
            UNIQUE(chunk_id, file_id, category)
        );
        CREATE INDEX IF NOT EXISTS idx_chunk_file_refs_chunk ON chunk_file_refs(chunk_id);
        CREATE INDEX IF NOT EXISTS idx_chunk_file_refs_file ON chunk_file_refs(file_id);",
    )?;

    if !fts_enabled {
        return Ok(SchemaStatus {
            fts_available: false,
            fts_error: Some("FTS disabled".to_string()),
        });
    }

    match conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
            text,
            id UNINDEXED,
            path UNINDEXED,
            source UNINDEXED,
            start_line UNINDEXED,
            end_line UNINDEXED,
            tokenize='porter unicode61 remove_diacritics 1'
        );",
    ) {
        Ok(()) => Ok(SchemaStatus {
            fts_available: true,
            fts_error: None,
        }),
        Err(e) => {
            warn!("FTS5 unavailable, degrading to LIKE search: {}", e);
            Ok(SchemaStatus {
                fts_available: false,
                fts_error: Some(e.to_string()),
            })
        }
    }
}

/// Whether the chunks table exists (used when unioning rotated index files,
/// some of which may be empty shells).
pub fn has_chunks_table(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type='table' AND name='chunks'",
        [],
        |_| Ok(()),
    )
    .is_ok()
}

/// Whether the FTS virtual table exists in this index file.
pub fn has_fts_table(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
        [],
        |_| Ok(()),
    )
    .is_ok()
}
