// src/filestore/index.rs
// Per-category SQLite metadata index (sync helpers, run via DatabasePool)

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

/// One row of a category's file index
#[derive(Debug, Clone)]
pub struct FileRow {
    pub file_id: String,
    pub filename: String,
    pub size_bytes: u64,
    pub hash: String,
    pub mime_type: String,
    pub session_id: Option<String>,
    pub created_at: i64,
    pub metadata_json: Option<String>,
    pub expires_at: Option<i64>,
    pub access_count: u64,
    pub last_accessed_at: Option<i64>,
}

/// Create the file index schema if missing
pub fn ensure_file_index_schema(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS file_index (
            file_id TEXT PRIMARY KEY,
            filename TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            hash TEXT NOT NULL,
            mime_type TEXT NOT NULL,
            session_id TEXT,
            created_at INTEGER NOT NULL,
            metadata TEXT,
            expires_at INTEGER,
            access_count INTEGER NOT NULL DEFAULT 0,
            last_accessed_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_file_index_session ON file_index(session_id);
        CREATE INDEX IF NOT EXISTS idx_file_index_created ON file_index(created_at);
        CREATE INDEX IF NOT EXISTS idx_file_index_expires ON file_index(expires_at);",
    )?;
    Ok(())
}

fn row_to_file_row(row: &rusqlite::Row) -> rusqlite::Result<FileRow> {
    Ok(FileRow {
        file_id: row.get("file_id")?,
        filename: row.get("filename")?,
        size_bytes: row.get::<_, i64>("size_bytes")? as u64,
        hash: row.get("hash")?,
        mime_type: row.get("mime_type")?,
        session_id: row.get("session_id")?,
        created_at: row.get("created_at")?,
        metadata_json: row.get("metadata")?,
        expires_at: row.get("expires_at")?,
        access_count: row.get::<_, i64>("access_count")? as u64,
        last_accessed_at: row.get("last_accessed_at")?,
    })
}

const FILE_COLUMNS: &str = "file_id, filename, size_bytes, hash, mime_type, session_id, \
                            created_at, metadata, expires_at, access_count, last_accessed_at";

/// Insert or replace an index row. Replacement covers the content-hash id
/// strategy, where re-storing identical bytes refreshes the same row.
pub fn upsert_file_sync(conn: &Connection, row: &FileRow) -> Result<()> {
    conn.execute(
        "INSERT INTO file_index
            (file_id, filename, size_bytes, hash, mime_type, session_id,
             created_at, metadata, expires_at, access_count, last_accessed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(file_id) DO UPDATE SET
            filename = excluded.filename,
            size_bytes = excluded.size_bytes,
            hash = excluded.hash,
            mime_type = excluded.mime_type,
            session_id = excluded.session_id,
            created_at = excluded.created_at,
            metadata = excluded.metadata,
            expires_at = excluded.expires_at",
        params![
            row.file_id,
            row.filename,
            row.size_bytes as i64,
            row.hash,
            row.mime_type,
            row.session_id,
            row.created_at,
            row.metadata_json,
            row.expires_at,
            row.access_count as i64,
            row.last_accessed_at,
        ],
    )?;
    Ok(())
}

pub fn get_file_sync(conn: &Connection, file_id: &str) -> Result<Option<FileRow>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM file_index WHERE file_id = ?1", FILE_COLUMNS),
            params![file_id],
            row_to_file_row,
        )
        .optional()?;
    Ok(row)
}

/// Delete an index row; returns whether a row was removed
pub fn delete_file_sync(conn: &Connection, file_id: &str) -> Result<bool> {
    let n = conn.execute("DELETE FROM file_index WHERE file_id = ?1", params![file_id])?;
    Ok(n > 0)
}

pub fn exists_sync(conn: &Connection, file_id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM file_index WHERE file_id = ?1",
            params![file_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// List rows, newest first, optionally filtered by session
pub fn list_files_sync(
    conn: &Connection,
    session_id: Option<&str>,
    limit: Option<usize>,
) -> Result<Vec<FileRow>> {
    let limit = limit.unwrap_or(usize::MAX).min(i64::MAX as usize) as i64;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM file_index
         WHERE (?1 IS NULL OR session_id = ?1)
         ORDER BY created_at DESC
         LIMIT ?2",
        FILE_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![session_id, limit], row_to_file_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Bump access counters on retrieval
pub fn touch_access_sync(conn: &Connection, file_id: &str, now: i64) -> Result<()> {
    conn.execute(
        "UPDATE file_index
         SET access_count = access_count + 1, last_accessed_at = ?2
         WHERE file_id = ?1",
        params![file_id, now],
    )?;
    Ok(())
}

/// Ids and sizes of rows whose expiry has passed
pub fn expired_files_sync(conn: &Connection, now: i64) -> Result<Vec<(String, u64)>> {
    let mut stmt = conn.prepare(
        "SELECT file_id, size_bytes FROM file_index
         WHERE expires_at IS NOT NULL AND expires_at <= ?1",
    )?;
    let rows = stmt
        .query_map(params![now], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// All tracked file ids (startup orphan sweep)
pub fn all_file_ids_sync(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT file_id FROM file_index")?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// (file count, total bytes) for the category
pub fn usage_sync(conn: &Connection) -> Result<(u64, u64)> {
    let (count, size): (i64, Option<i64>) = conn.query_row(
        "SELECT COUNT(*), SUM(size_bytes) FROM file_index",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok((count as u64, size.unwrap_or(0) as u64))
}
