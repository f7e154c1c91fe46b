// src/filestore/types.rs
// FileRef, categories, metadata, and cleanup statistics

use crate::config::CategoryPolicy;
use crate::error::{AgentError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a category derives file ids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdStrategy {
    /// Random UUID per store call
    Uuid,
    /// Content-hash prefix, deduplicating identical payloads
    ContentHash,
}

/// Top-level namespace in the file store. Each category has its own
/// directory, size limit, TTL, indexing choice, and access rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    Artifact,
    Upload,
    Report,
    Chart,
    Cache,
    Temp,
    Memory,
    Checkpoint,
    Code,
}

impl FileCategory {
    pub const ALL: [FileCategory; 9] = [
        Self::Artifact,
        Self::Upload,
        Self::Report,
        Self::Chart,
        Self::Cache,
        Self::Temp,
        Self::Memory,
        Self::Checkpoint,
        Self::Code,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Artifact => "artifact",
            Self::Upload => "upload",
            Self::Report => "report",
            Self::Chart => "chart",
            Self::Cache => "cache",
            Self::Temp => "temp",
            Self::Memory => "memory",
            Self::Checkpoint => "checkpoint",
            Self::Code => "code",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "artifact" => Some(Self::Artifact),
            "upload" => Some(Self::Upload),
            "report" => Some(Self::Report),
            "chart" => Some(Self::Chart),
            "cache" => Some(Self::Cache),
            "temp" => Some(Self::Temp),
            "memory" => Some(Self::Memory),
            "checkpoint" => Some(Self::Checkpoint),
            "code" => Some(Self::Code),
            _ => None,
        }
    }

    /// Directory under the storage base for this category
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Artifact => "artifacts",
            Self::Upload => "uploads",
            Self::Report => "reports",
            Self::Chart => "charts",
            Self::Cache => "cache",
            Self::Temp => "temp",
            Self::Memory => "memory",
            Self::Checkpoint => "temp/checkpoints",
            Self::Code => "code",
        }
    }

    /// Whether the category keeps a SQLite metadata index
    pub fn indexed(&self) -> bool {
        matches!(
            self,
            Self::Upload | Self::Report | Self::Chart | Self::Cache | Self::Temp | Self::Code
        )
    }

    pub fn id_strategy(&self) -> IdStrategy {
        match self {
            Self::Cache | Self::Code => IdStrategy::ContentHash,
            _ => IdStrategy::Uuid,
        }
    }

    /// Built-in policy (overridable via config). `max_size_mb == 0` means
    /// unlimited, `ttl_hours == 0` means never expires.
    pub fn default_policy(&self) -> CategoryPolicy {
        let (max_size_mb, ttl_hours) = match self {
            Self::Artifact => (100, 24),
            Self::Upload => (50, 168),
            Self::Report => (50, 720),
            Self::Chart => (10, 168),
            Self::Cache => (10, 1),
            Self::Temp => (50, 24),
            Self::Memory => (0, 0),
            Self::Checkpoint => (0, 24),
            Self::Code => (0, 0),
        };
        CategoryPolicy {
            max_size_mb,
            ttl_hours,
        }
    }
}

impl fmt::Display for FileCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque, path-free handle to a stored blob. Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRef {
    pub file_id: String,
    pub category: FileCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub size_bytes: u64,
    pub hash: String,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl FileRef {
    /// Canonical string form: `<category>:<file_id>`
    pub fn to_ref_string(&self) -> String {
        format!("{}:{}", self.category, self.file_id)
    }

    /// Parse a `<category>:<file_id>` string
    pub fn parse_ref_string(s: &str) -> Result<(FileCategory, String)> {
        let (category, file_id) = s
            .split_once(':')
            .ok_or_else(|| AgentError::BadInput(format!("malformed file ref: {}", s)))?;
        let category = FileCategory::parse(category)
            .ok_or_else(|| AgentError::BadInput(format!("unknown category: {}", category)))?;
        if file_id.is_empty() {
            return Err(AgentError::BadInput("empty file_id".to_string()));
        }
        Ok((category, file_id.to_string()))
    }
}

/// Mutable bookkeeping attached to a FileRef
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_ref: FileRef,
    pub filename: String,
    pub access_count: u64,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Outcome of a janitor pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupStats {
    pub deleted_count: u64,
    pub freed_space_bytes: u64,
    pub category_stats: std::collections::HashMap<String, u64>,
    pub duration_ms: u64,
}

/// Per-category usage numbers
#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub category: FileCategory,
    pub file_count: u64,
    pub total_size_bytes: u64,
}

/// One expired item found by the janitor scan. Session-nested categories
/// (checkpoints) carry the owning scope directory.
#[derive(Debug, Clone)]
pub struct ExpiredFile {
    pub scope: Option<String>,
    pub file_id: String,
    pub size_bytes: u64,
}
