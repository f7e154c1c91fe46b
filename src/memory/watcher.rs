// src/memory/watcher.rs
// Polling watcher that keeps the memory index in sync with the memory tree.
// Deliberately not OS file events: a scan every check_interval compares
// (mtime, size) against what the index knows, and a dirty file is only
// reindexed after a debounce window of stability.

use crate::memory::indexer::MemoryIndexer;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// File extensions the memory tree indexes
const WATCHED_EXTENSIONS: &[&str] = &["md", "markdown", "txt"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileState {
    mtime: i64,
    size: i64,
}

#[derive(Debug, Clone, Copy)]
struct DirtyEntry {
    state: FileState,
    since: Instant,
}

/// Outcome of one watcher pass (exposed for tests and the status endpoint)
#[derive(Debug, Clone, Default)]
pub struct WatchPassStats {
    pub scanned: usize,
    pub reindexed: usize,
    pub failed: usize,
}

/// Polling watcher over a set of memory roots.
pub struct MemoryWatcher {
    indexer: Arc<MemoryIndexer>,
    watch_paths: Vec<PathBuf>,
    debounce: Duration,
    dirty: HashMap<PathBuf, DirtyEntry>,
}

impl MemoryWatcher {
    pub fn new(indexer: Arc<MemoryIndexer>, watch_paths: Vec<PathBuf>, debounce: Duration) -> Self {
        Self {
            indexer,
            watch_paths,
            debounce,
            dirty: HashMap::new(),
        }
    }

    fn is_watchable(path: &Path) -> bool {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if !WATCHED_EXTENSIONS.contains(&ext) {
            return false;
        }
        // Skip dotfiles and the .index directory
        !path.components().any(|c| {
            matches!(c, std::path::Component::Normal(name)
                if name.to_string_lossy().starts_with('.'))
        })
    }

    fn disk_state(path: &Path) -> Option<FileState> {
        let meta = std::fs::metadata(path).ok()?;
        let mtime = meta
            .modified()
            .ok()?
            .duration_since(std::time::UNIX_EPOCH)
            .ok()?
            .as_secs() as i64;
        Some(FileState {
            mtime,
            size: meta.len() as i64,
        })
    }

    /// One watcher pass: scan the roots for changed files, then reindex
    /// dirty files that have been stable for the debounce window.
    /// Individual file errors are logged and never stop the pass.
    pub async fn tick(&mut self) -> WatchPassStats {
        let mut stats = WatchPassStats::default();

        // Scan phase: mark changed files dirty (or re-stamp unstable ones).
        for root in self.watch_paths.clone() {
            if !root.exists() {
                continue;
            }
            for entry in walkdir::WalkDir::new(&root)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() || !Self::is_watchable(entry.path()) {
                    continue;
                }
                stats.scanned += 1;
                let path = entry.path().to_path_buf();
                let Some(current) = Self::disk_state(&path) else {
                    continue;
                };

                match self.dirty.get(&path) {
                    Some(existing) if existing.state != current => {
                        // Still being written; restart the debounce window.
                        self.dirty.insert(
                            path,
                            DirtyEntry {
                                state: current,
                                since: Instant::now(),
                            },
                        );
                    }
                    Some(_) => {}
                    None => {
                        let known = match self.indexer.known_file_state(&path).await {
                            Ok(k) => k,
                            Err(e) => {
                                warn!("Watcher state lookup failed for {:?}: {}", path, e);
                                continue;
                            }
                        };
                        if known != Some((current.mtime, current.size)) {
                            debug!("Watcher: {:?} marked dirty", path);
                            self.dirty.insert(
                                path,
                                DirtyEntry {
                                    state: current,
                                    since: Instant::now(),
                                },
                            );
                        }
                    }
                }
            }
        }

        // Process phase: reindex entries that survived the debounce window.
        let ready: Vec<PathBuf> = self
            .dirty
            .iter()
            .filter(|(_, entry)| entry.since.elapsed() >= self.debounce)
            .map(|(path, _)| path.clone())
            .collect();

        for path in ready {
            match self.indexer.index_file(&path).await {
                Ok(outcome) => {
                    self.dirty.remove(&path);
                    stats.reindexed += 1;
                    if outcome.updated {
                        debug!(
                            "Watcher: reindexed {:?} ({} chunks)",
                            path, outcome.chunks_added
                        );
                    }
                }
                Err(e) => {
                    stats.failed += 1;
                    warn!("Watcher: failed to index {:?}: {}", path, e);
                    // Re-stamp so the file is retried after another window.
                    if let Some(entry) = self.dirty.get_mut(&path) {
                        entry.since = Instant::now();
                    }
                }
            }
        }

        stats
    }

    /// Run until the shutdown signal flips. Stops within one tick.
    pub async fn run(mut self, check_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Memory watcher started ({} roots, every {:?})",
            self.watch_paths.len(),
            check_interval
        );
        let mut ticker = tokio::time::interval(check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = self.tick().await;
                    if stats.reindexed > 0 || stats.failed > 0 {
                        info!(
                            "Memory watcher: {} reindexed, {} failed",
                            stats.reindexed, stats.failed
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Memory watcher shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Spawn the watcher loop on the runtime.
pub fn spawn_watcher(
    indexer: Arc<MemoryIndexer>,
    watch_paths: Vec<PathBuf>,
    debounce: Duration,
    check_interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let watcher = MemoryWatcher::new(indexer, watch_paths, debounce);
    tokio::spawn(watcher.run(check_interval, shutdown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::rotation::IndexRotation;

    fn make_indexer(dir: &Path) -> Arc<MemoryIndexer> {
        let rotation = IndexRotation::new(dir.join(".index"), "memory".to_string(), 50.0);
        Arc::new(MemoryIndexer::new(rotation, 400, 80, true, None))
    }

    #[test]
    fn test_is_watchable() {
        assert!(MemoryWatcher::is_watchable(Path::new("memory/2024-01-01.md")));
        assert!(MemoryWatcher::is_watchable(Path::new("memory/notes.txt")));
        assert!(!MemoryWatcher::is_watchable(Path::new("memory/data.db")));
        assert!(!MemoryWatcher::is_watchable(Path::new(
            "memory/.index/memory.db"
        )));
        assert!(!MemoryWatcher::is_watchable(Path::new(
            "memory/.hidden/file.md"
        )));
    }

    #[tokio::test]
    async fn test_new_file_is_indexed_after_debounce() {
        let dir = tempfile::tempdir().unwrap();
        let memory_dir = dir.path().join("memory");
        std::fs::create_dir_all(&memory_dir).unwrap();
        std::fs::write(memory_dir.join("facts.md"), "Python decorator examples\n").unwrap();

        let indexer = make_indexer(dir.path());
        let mut watcher =
            MemoryWatcher::new(indexer.clone(), vec![memory_dir.clone()], Duration::ZERO);

        // First tick marks dirty and (debounce zero) reindexes immediately
        let stats = watcher.tick().await;
        assert_eq!(stats.reindexed, 1);
        assert_eq!(stats.failed, 0);

        let status = indexer.status().await.unwrap();
        assert_eq!(status.file_count, 1);
        assert!(status.chunk_count >= 1);
    }

    #[tokio::test]
    async fn test_unchanged_file_not_reindexed() {
        let dir = tempfile::tempdir().unwrap();
        let memory_dir = dir.path().join("memory");
        std::fs::create_dir_all(&memory_dir).unwrap();
        std::fs::write(memory_dir.join("facts.md"), "stable content\n").unwrap();

        let indexer = make_indexer(dir.path());
        let mut watcher =
            MemoryWatcher::new(indexer.clone(), vec![memory_dir.clone()], Duration::ZERO);

        assert_eq!(watcher.tick().await.reindexed, 1);
        // Second pass sees (mtime, size) matching the index; nothing dirty
        let second = watcher.tick().await;
        assert_eq!(second.reindexed, 0);
    }

    #[tokio::test]
    async fn test_debounce_defers_unstable_files() {
        let dir = tempfile::tempdir().unwrap();
        let memory_dir = dir.path().join("memory");
        std::fs::create_dir_all(&memory_dir).unwrap();
        std::fs::write(memory_dir.join("facts.md"), "first draft\n").unwrap();

        let indexer = make_indexer(dir.path());
        let mut watcher = MemoryWatcher::new(
            indexer.clone(),
            vec![memory_dir.clone()],
            Duration::from_secs(3600),
        );

        // Dirty but inside the debounce window: no reindex yet
        let stats = watcher.tick().await;
        assert_eq!(stats.reindexed, 0);
        assert_eq!(indexer.status().await.unwrap().file_count, 0);
    }

    #[tokio::test]
    async fn test_per_file_errors_do_not_stop_pass() {
        let dir = tempfile::tempdir().unwrap();
        let memory_dir = dir.path().join("memory");
        std::fs::create_dir_all(&memory_dir).unwrap();
        std::fs::write(memory_dir.join("good.md"), "valid content here\n").unwrap();
        std::fs::write(memory_dir.join("gone.md"), "will vanish\n").unwrap();

        let indexer = make_indexer(dir.path());
        let mut watcher =
            MemoryWatcher::new(indexer.clone(), vec![memory_dir.clone()], Duration::ZERO);

        // Delete one file between scan and process by scanning first via a
        // zero-debounce tick where the removal happens mid-flight: simulate
        // by removing before the tick and pre-seeding the dirty map.
        watcher.dirty.insert(
            memory_dir.join("gone.md"),
            DirtyEntry {
                state: FileState { mtime: 0, size: 0 },
                since: Instant::now() - Duration::from_secs(10),
            },
        );
        std::fs::remove_file(memory_dir.join("gone.md")).unwrap();

        let stats = watcher.tick().await;
        assert_eq!(stats.failed, 1);
        assert!(stats.reindexed >= 1, "good file still indexed");
    }
}
