// src/filestore/store.rs
// Category-partitioned blob storage with per-category policies and indices

use crate::config::{CategoryPolicy, FileStoreConfig};
use crate::db::DatabasePool;
use crate::error::{AgentError, Result};
use crate::filestore::index::{self, FileRow};
use crate::filestore::security::{self, FileAccessControl};
use crate::filestore::types::{
    ExpiredFile, FileCategory, FileMetadata, FileRef, IdStrategy, StorageStats,
};
use crate::utils::{content_hash, now_ts};
use chrono::{TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Options accompanying a `store` call
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub filename: Option<String>,
    pub session_id: Option<String>,
    pub mime_type: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Durable, category-partitioned storage. Safe for concurrent use; all
/// mutable state lives behind the per-category SQLite pools.
pub struct FileStore {
    base_dir: PathBuf,
    config: FileStoreConfig,
    access: FileAccessControl,
    indexes: HashMap<FileCategory, Arc<DatabasePool>>,
}

impl FileStore {
    /// Open the store: creates the category tree, opens each indexed
    /// category's SQLite index, and sweeps orphan files left by crashes
    /// between a rename and its index commit.
    pub async fn open(base_dir: PathBuf, config: FileStoreConfig) -> Result<Self> {
        let mut indexes = HashMap::new();
        for category in FileCategory::ALL {
            let dir = base_dir.join(category.dir_name());
            tokio::fs::create_dir_all(&dir).await?;
            if category.indexed() {
                let pool = DatabasePool::open(&dir.join("index.db")).await?;
                pool.interact(index::ensure_file_index_schema).await?;
                indexes.insert(category, Arc::new(pool));
            }
        }

        let store = Self {
            base_dir,
            config,
            access: FileAccessControl,
            indexes,
        };
        let swept = store.sweep_orphans().await?;
        if swept > 0 {
            info!("Startup sweep removed {} orphan file(s)", swept);
        }
        Ok(store)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Effective policy: config override wins, built-in defaults otherwise
    pub fn policy(&self, category: FileCategory) -> CategoryPolicy {
        self.config
            .categories
            .get(category.as_str())
            .cloned()
            .unwrap_or_else(|| category.default_policy())
    }

    fn pool(&self, category: FileCategory) -> Option<&Arc<DatabasePool>> {
        self.indexes.get(&category)
    }

    fn expires_at_for(&self, category: FileCategory, created_at: i64) -> Option<i64> {
        let ttl_hours = self.policy(category).ttl_hours;
        if ttl_hours == 0 {
            None
        } else {
            Some(created_at + ttl_hours as i64 * 3600)
        }
    }

    /// Store a blob. Fully visible (bytes renamed into place and index row
    /// committed) or not visible at all.
    pub async fn store(
        &self,
        content: &[u8],
        category: FileCategory,
        opts: StoreOptions,
    ) -> Result<FileRef> {
        let file_id = match category.id_strategy() {
            IdStrategy::Uuid => uuid::Uuid::new_v4().simple().to_string(),
            IdStrategy::ContentHash => content_hash(content)[..32].to_string(),
        };
        self.store_with_id(content, category, &file_id, opts).await
    }

    /// Store under a caller-chosen id (tool memoisation keys).
    /// The id passes the same path-safety validation as generated ids.
    pub async fn store_with_id(
        &self,
        content: &[u8],
        category: FileCategory,
        file_id: &str,
        opts: StoreOptions,
    ) -> Result<FileRef> {
        let policy = self.policy(category);
        if policy.max_size_mb > 0 {
            let limit = policy.max_size_mb * 1024 * 1024;
            if content.len() as u64 > limit {
                return Err(AgentError::SizeExceeded {
                    actual: content.len() as u64,
                    limit,
                });
            }
        }

        let hash = content_hash(content);
        let file_id = file_id.to_string();
        let path = security::resolve_path(&self.base_dir, category, &file_id)?;

        // Write-tmp-then-rename keeps partially written blobs unreachable.
        let tmp = path.with_file_name(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;

        let created_at = now_ts();
        let filename = opts
            .filename
            .clone()
            .unwrap_or_else(|| file_id.clone());
        let mime_type = opts.mime_type.clone().unwrap_or_else(|| {
            mime_guess::from_path(&filename)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        });

        if let Some(pool) = self.pool(category) {
            let row = FileRow {
                file_id: file_id.clone(),
                filename: filename.clone(),
                size_bytes: content.len() as u64,
                hash: hash.clone(),
                mime_type: mime_type.clone(),
                session_id: opts.session_id.clone(),
                created_at,
                metadata_json: opts
                    .metadata
                    .as_ref()
                    .map(|m| serde_json::to_string(m).unwrap_or_default()),
                expires_at: self.expires_at_for(category, created_at),
                access_count: 0,
                last_accessed_at: None,
            };
            if let Err(e) = pool.interact(move |conn| index::upsert_file_sync(conn, &row)).await {
                // Index commit failed: remove the blob so the store call is
                // invisible rather than leaving a reachable orphan.
                let _ = tokio::fs::remove_file(&path).await;
                return Err(e.into());
            }
        }

        debug!("Stored {}:{} ({} bytes)", category, file_id, content.len());

        Ok(FileRef {
            file_id,
            category,
            session_id: opts.session_id,
            size_bytes: content.len() as u64,
            hash,
            mime_type,
            created_at: Utc.timestamp_opt(created_at, 0).single().unwrap_or_else(Utc::now),
            metadata: opts.metadata.unwrap_or(serde_json::Value::Null),
        })
    }

    /// Retrieve stored content, or `None` when missing or expired.
    pub async fn retrieve(&self, file_ref: &FileRef) -> Result<Option<Vec<u8>>> {
        let path = security::resolve_path(&self.base_dir, file_ref.category, &file_ref.file_id)?;

        if let Some(pool) = self.pool(file_ref.category) {
            let file_id = file_ref.file_id.clone();
            let row = pool
                .interact(move |conn| index::get_file_sync(conn, &file_id))
                .await?;
            match row {
                None => return Ok(None),
                Some(row) => {
                    if row.expires_at.is_some_and(|exp| exp <= now_ts()) {
                        self.evict(file_ref).await?;
                        return Ok(None);
                    }
                }
            }
            let file_id = file_ref.file_id.clone();
            let now = now_ts();
            pool.interact(move |conn| index::touch_access_sync(conn, &file_id, now))
                .await?;
        }

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Retrieve with access control for the calling session.
    pub async fn retrieve_for_session(
        &self,
        file_ref: &FileRef,
        session_id: &str,
    ) -> Result<Option<Vec<u8>>> {
        if !self.access.can_access(file_ref, session_id) {
            return Err(AgentError::NotPermitted(format!(
                "session has no access to {}",
                file_ref.to_ref_string()
            )));
        }
        self.retrieve(file_ref).await
    }

    /// Delete a blob and its index row. Idempotent.
    pub async fn delete(&self, file_ref: &FileRef) -> Result<bool> {
        self.delete_by_id(file_ref.category, &file_ref.file_id).await
    }

    /// Delete with access control for the calling session.
    pub async fn delete_for_session(&self, file_ref: &FileRef, session_id: &str) -> Result<bool> {
        if !self.access.can_delete(file_ref, session_id) {
            return Err(AgentError::NotPermitted(format!(
                "session may not delete {}",
                file_ref.to_ref_string()
            )));
        }
        self.delete(file_ref).await
    }

    pub(crate) async fn delete_by_id(&self, category: FileCategory, file_id: &str) -> Result<bool> {
        let path = security::resolve_path(&self.base_dir, category, file_id)?;
        let file_removed = match tokio::fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        let mut row_removed = false;
        if let Some(pool) = self.pool(category) {
            let file_id = file_id.to_string();
            row_removed = pool
                .interact(move |conn| index::delete_file_sync(conn, &file_id))
                .await?;
        }
        Ok(file_removed || row_removed)
    }

    async fn evict(&self, file_ref: &FileRef) -> Result<()> {
        debug!("Lazily evicting expired {}", file_ref.to_ref_string());
        self.delete(file_ref).await.map(|_| ())
    }

    /// Whether a ref resolves to live content. For indexed categories this
    /// also checks expiry and evicts lazily.
    pub async fn exists(&self, file_ref: &FileRef) -> Result<bool> {
        let path = security::resolve_path(&self.base_dir, file_ref.category, &file_ref.file_id)?;
        if let Some(pool) = self.pool(file_ref.category) {
            let file_id = file_ref.file_id.clone();
            let row = pool
                .interact(move |conn| index::get_file_sync(conn, &file_id))
                .await?;
            return match row {
                None => Ok(false),
                Some(row) => {
                    if row.expires_at.is_some_and(|exp| exp <= now_ts()) {
                        self.evict(file_ref).await?;
                        Ok(false)
                    } else {
                        Ok(true)
                    }
                }
            };
        }
        Ok(path.exists())
    }

    /// List files in a category, newest first.
    pub async fn list_files(
        &self,
        category: FileCategory,
        session_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<FileMetadata>> {
        if let Some(pool) = self.pool(category) {
            let session = session_id.map(String::from);
            let rows = pool
                .interact(move |conn| index::list_files_sync(conn, session.as_deref(), limit))
                .await?;
            return Ok(rows
                .into_iter()
                .map(|row| self.row_to_metadata(category, row))
                .collect());
        }

        // Unindexed categories are listed from the filesystem.
        let dir = self.base_dir.join(category.dir_name());
        let mut entries: Vec<(i64, FileMetadata)> = Vec::new();
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = read_dir.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if is_internal_file(&name) {
                continue;
            }
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            let created_at = Utc.timestamp_opt(mtime, 0).single().unwrap_or_else(Utc::now);
            entries.push((
                mtime,
                FileMetadata {
                    file_ref: FileRef {
                        file_id: name.clone(),
                        category,
                        session_id: None,
                        size_bytes: meta.len(),
                        hash: String::new(),
                        mime_type: mime_guess::from_path(&name)
                            .first_or_octet_stream()
                            .essence_str()
                            .to_string(),
                        created_at,
                        metadata: serde_json::Value::Null,
                    },
                    filename: name,
                    access_count: 0,
                    last_accessed_at: None,
                    expires_at: None,
                },
            ));
        }
        entries.sort_by_key(|(mtime, _)| std::cmp::Reverse(*mtime));
        let mut result: Vec<FileMetadata> = entries.into_iter().map(|(_, m)| m).collect();
        if let Some(limit) = limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    fn row_to_metadata(&self, category: FileCategory, row: FileRow) -> FileMetadata {
        FileMetadata {
            file_ref: FileRef {
                file_id: row.file_id,
                category,
                session_id: row.session_id,
                size_bytes: row.size_bytes,
                hash: row.hash,
                mime_type: row.mime_type,
                created_at: Utc
                    .timestamp_opt(row.created_at, 0)
                    .single()
                    .unwrap_or_else(Utc::now),
                metadata: row
                    .metadata_json
                    .and_then(|m| serde_json::from_str(&m).ok())
                    .unwrap_or(serde_json::Value::Null),
            },
            filename: row.filename,
            access_count: row.access_count,
            last_accessed_at: row
                .last_accessed_at
                .and_then(|t| Utc.timestamp_opt(t, 0).single()),
            expires_at: row.expires_at.and_then(|t| Utc.timestamp_opt(t, 0).single()),
        }
    }

    /// Rebuild a FileRef from a `category:file_id` string using index data
    /// when available.
    pub async fn resolve_ref(&self, ref_string: &str) -> Result<Option<FileRef>> {
        let (category, file_id) = FileRef::parse_ref_string(ref_string)?;
        security::validate_file_id(&file_id)?;
        if let Some(pool) = self.pool(category) {
            let id = file_id.clone();
            let row = pool.interact(move |conn| index::get_file_sync(conn, &id)).await?;
            return Ok(row.map(|row| self.row_to_metadata(category, row).file_ref));
        }
        let path = security::resolve_path(&self.base_dir, category, &file_id)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some(FileRef {
                file_id,
                category,
                session_id: None,
                size_bytes: meta.len(),
                hash: String::new(),
                mime_type: "application/octet-stream".to_string(),
                created_at: Utc::now(),
                metadata: serde_json::Value::Null,
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Store a named conversation checkpoint under
    /// `temp/checkpoints/<session>/<name>.json`. Multiple named checkpoints
    /// per session coexist; re-storing a name replaces it.
    pub async fn store_checkpoint(
        &self,
        session_id: &str,
        name: &str,
        content: &[u8],
    ) -> Result<FileRef> {
        let policy = self.policy(FileCategory::Checkpoint);
        if policy.max_size_mb > 0 {
            let limit = policy.max_size_mb * 1024 * 1024;
            if content.len() as u64 > limit {
                return Err(AgentError::SizeExceeded {
                    actual: content.len() as u64,
                    limit,
                });
            }
        }

        let file_id = format!("{}.json", name);
        let path = security::resolve_scoped_path(
            &self.base_dir,
            FileCategory::Checkpoint,
            session_id,
            &file_id,
        )?;

        let tmp = path.with_file_name(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!("Stored checkpoint {}/{}", session_id, file_id);

        Ok(FileRef {
            file_id,
            category: FileCategory::Checkpoint,
            session_id: Some(session_id.to_string()),
            size_bytes: content.len() as u64,
            hash: content_hash(content),
            mime_type: "application/json".to_string(),
            created_at: Utc::now(),
            metadata: serde_json::Value::Null,
        })
    }

    /// Load a named checkpoint, or `None` when the session has none by
    /// that name.
    pub async fn load_checkpoint(&self, session_id: &str, name: &str) -> Result<Option<Vec<u8>>> {
        let path = security::resolve_scoped_path(
            &self.base_dir,
            FileCategory::Checkpoint,
            session_id,
            &format!("{}.json", name),
        )?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Checkpoint names for a session, newest first.
    pub async fn list_checkpoints(&self, session_id: &str) -> Result<Vec<String>> {
        security::validate_file_id(session_id)?;
        let dir = self
            .base_dir
            .join(FileCategory::Checkpoint.dir_name())
            .join(session_id);
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries: Vec<(i64, String)> = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if is_internal_file(&name) {
                continue;
            }
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            entries.push((mtime, stem.to_string()));
        }
        entries.sort_by_key(|(mtime, _)| std::cmp::Reverse(*mtime));
        Ok(entries.into_iter().map(|(_, name)| name).collect())
    }

    /// Delete a named checkpoint. Idempotent.
    pub async fn delete_checkpoint(&self, session_id: &str, name: &str) -> Result<bool> {
        self.delete_scoped(
            FileCategory::Checkpoint,
            session_id,
            &format!("{}.json", name),
        )
        .await
    }

    pub(crate) async fn delete_scoped(
        &self,
        category: FileCategory,
        scope: &str,
        file_id: &str,
    ) -> Result<bool> {
        let path = security::resolve_scoped_path(&self.base_dir, category, scope, file_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Append markdown to a named file in the memory category (daily flush
    /// files are append-only).
    pub async fn append_memory_markdown(&self, filename: &str, text: &str) -> Result<PathBuf> {
        let path = security::resolve_path(&self.base_dir, FileCategory::Memory, filename)?;
        let mut existing = match tokio::fs::read_to_string(&path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        existing.push_str(text);
        let tmp = path.with_file_name(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, existing).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(path)
    }

    /// Per-category usage statistics.
    pub async fn storage_stats(&self) -> Result<Vec<StorageStats>> {
        let mut stats = Vec::new();
        for category in FileCategory::ALL {
            if let Some(pool) = self.pool(category) {
                let (file_count, total_size_bytes) =
                    pool.interact(|conn| index::usage_sync(conn)).await?;
                stats.push(StorageStats {
                    category,
                    file_count,
                    total_size_bytes,
                });
            } else {
                let dir = self.base_dir.join(category.dir_name());
                let (mut count, mut size) = (0u64, 0u64);
                for entry in walkdir::WalkDir::new(&dir)
                    .max_depth(walk_depth(category))
                    .into_iter()
                    .filter_map(|e| e.ok())
                {
                    if entry.file_type().is_file() {
                        let name = entry.file_name().to_string_lossy();
                        if is_internal_file(&name) {
                            continue;
                        }
                        count += 1;
                        size += entry.metadata().map(|m| m.len()).unwrap_or(0);
                    }
                }
                stats.push(StorageStats {
                    category,
                    file_count: count,
                    total_size_bytes: size,
                });
            }
        }
        Ok(stats)
    }

    /// Total bytes across every category.
    pub async fn total_usage_bytes(&self) -> Result<u64> {
        Ok(self
            .storage_stats()
            .await?
            .iter()
            .map(|s| s.total_size_bytes)
            .sum())
    }

    /// Expired items of one category. Indexed categories consult expiry
    /// columns; unindexed ones fall back to file mtime against the policy
    /// TTL. Session-nested categories report the owning scope.
    pub async fn expired_candidates(&self, category: FileCategory) -> Result<Vec<ExpiredFile>> {
        let now = now_ts();
        if let Some(pool) = self.pool(category) {
            return Ok(pool
                .interact(move |conn| index::expired_files_sync(conn, now))
                .await?
                .into_iter()
                .map(|(file_id, size_bytes)| ExpiredFile {
                    scope: None,
                    file_id,
                    size_bytes,
                })
                .collect());
        }

        let ttl_hours = self.policy(category).ttl_hours;
        if ttl_hours == 0 {
            return Ok(Vec::new());
        }
        let cutoff = now - ttl_hours as i64 * 3600;
        let dir = self.base_dir.join(category.dir_name());
        let mut expired = Vec::new();
        for entry in walkdir::WalkDir::new(&dir)
            .max_depth(walk_depth(category))
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if is_internal_file(&name) {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(i64::MAX);
            if mtime <= cutoff {
                // Files below the category root belong to a session scope.
                let scope = (entry.depth() > 1)
                    .then(|| {
                        entry
                            .path()
                            .parent()
                            .and_then(|p| p.file_name())
                            .map(|n| n.to_string_lossy().to_string())
                    })
                    .flatten();
                expired.push(ExpiredFile {
                    scope,
                    file_id: name,
                    size_bytes: meta.len(),
                });
            }
        }
        Ok(expired)
    }

    /// Delete files in indexed categories that have no index row. Covers
    /// crashes between the blob rename and the index commit.
    pub async fn sweep_orphans(&self) -> Result<u64> {
        let mut swept = 0u64;
        for (&category, pool) in &self.indexes {
            let known: HashSet<String> = pool
                .interact(|conn| index::all_file_ids_sync(conn))
                .await?
                .into_iter()
                .collect();
            let dir = self.base_dir.join(category.dir_name());
            for entry in walkdir::WalkDir::new(&dir)
                .max_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if is_internal_file(&name) || known.contains(&name) {
                    continue;
                }
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => {
                        swept += 1;
                        debug!("Swept orphan {}:{}", category, name);
                    }
                    Err(e) => warn!("Failed to sweep orphan {:?}: {}", entry.path(), e),
                }
            }
        }
        Ok(swept)
    }
}

/// Pool databases, WAL sidecars, and in-flight temp files are not blobs.
fn is_internal_file(name: &str) -> bool {
    name.starts_with("index.db") || name.starts_with(".tmp-") || name.starts_with('.')
}

/// Filesystem scan depth: checkpoints nest one session directory deep.
fn walk_depth(category: FileCategory) -> usize {
    match category {
        FileCategory::Checkpoint => 2,
        _ => 1,
    }
}
