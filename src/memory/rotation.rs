// src/memory/rotation.rs
// Index file rotation: writes go to the newest index, reads union all of them

use std::path::{Path, PathBuf};
use tracing::info;

/// Manages `memory.db`, `memory-1.db`, ... under the index directory.
pub struct IndexRotation {
    index_dir: PathBuf,
    prefix: String,
    max_size_bytes: u64,
}

impl IndexRotation {
    pub fn new(index_dir: PathBuf, prefix: String, max_size_mb: f64) -> Self {
        Self {
            index_dir,
            prefix,
            max_size_bytes: (max_size_mb * 1024.0 * 1024.0) as u64,
        }
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    /// Numeric rotation rank of an index file name: `memory.db` is 0,
    /// `memory-N.db` is N. Returns `None` for unrelated files.
    fn rank_of(&self, name: &str) -> Option<u64> {
        let stem = name.strip_suffix(".db")?;
        if stem == self.prefix {
            return Some(0);
        }
        let suffix = stem.strip_prefix(&self.prefix)?.strip_prefix('-')?;
        suffix.parse::<u64>().ok()
    }

    /// All existing index files, oldest first. Falls back to the primary
    /// path when none exist yet.
    pub fn all_index_paths(&self) -> Vec<PathBuf> {
        let mut found: Vec<(u64, PathBuf)> = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.index_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some(rank) = self.rank_of(&name) {
                    found.push((rank, entry.path()));
                }
            }
        }
        if found.is_empty() {
            return vec![self.index_dir.join(format!("{}.db", self.prefix))];
        }
        found.sort_by_key(|(rank, _)| *rank);
        found.into_iter().map(|(_, p)| p).collect()
    }

    /// Path the next write should target. When the newest index file has
    /// grown past the size cap, returns the next rotation name instead.
    pub fn current_index_path(&self) -> PathBuf {
        let all = self.all_index_paths();
        let latest = all.last().expect("at least the primary path");
        let latest_size = std::fs::metadata(latest).map(|m| m.len()).unwrap_or(0);

        if latest_size < self.max_size_bytes || self.max_size_bytes == 0 {
            return latest.clone();
        }

        let latest_rank = latest
            .file_name()
            .and_then(|n| self.rank_of(&n.to_string_lossy()))
            .unwrap_or(0);
        let next = self
            .index_dir
            .join(format!("{}-{}.db", self.prefix, latest_rank + 1));
        info!(
            "Index {:?} reached {} bytes, rotating to {:?}",
            latest.file_name(),
            latest_size,
            next.file_name()
        );
        next
    }
}
