// src/filestore/lifecycle.rs
// TTL cleanup and the background janitor loop

use crate::error::Result;
use crate::filestore::store::FileStore;
use crate::filestore::types::{CleanupStats, FileCategory};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Cleanup order: cheap, short-lived categories first.
const CLEANUP_ORDER: [FileCategory; 9] = [
    FileCategory::Cache,
    FileCategory::Temp,
    FileCategory::Artifact,
    FileCategory::Upload,
    FileCategory::Report,
    FileCategory::Chart,
    FileCategory::Checkpoint,
    FileCategory::Code,
    FileCategory::Memory,
];

/// Lifecycle manager: expired-file cleanup and usage-threshold checks.
pub struct LifecycleManager {
    store: Arc<FileStore>,
    max_total_bytes: u64,
    threshold_percent: f64,
}

impl LifecycleManager {
    pub fn new(store: Arc<FileStore>, max_total_size_gb: f64, threshold_percent: f64) -> Self {
        Self {
            store,
            max_total_bytes: (max_total_size_gb * 1024.0 * 1024.0 * 1024.0) as u64,
            threshold_percent,
        }
    }

    /// Delete expired items in every category, in `CLEANUP_ORDER`. With
    /// `dry_run` the pass only counts what would be deleted.
    pub async fn cleanup_expired(&self, dry_run: bool) -> Result<CleanupStats> {
        self.cleanup_categories(&CLEANUP_ORDER, dry_run).await
    }

    async fn cleanup_categories(
        &self,
        categories: &[FileCategory],
        dry_run: bool,
    ) -> Result<CleanupStats> {
        let start = Instant::now();
        let mut stats = CleanupStats::default();

        for &category in categories {
            let candidates = match self.store.expired_candidates(category).await {
                Ok(c) => c,
                Err(e) => {
                    error!("Error scanning {} for expired files: {}", category, e);
                    continue;
                }
            };

            let mut deleted_here = 0u64;
            for candidate in candidates {
                if dry_run {
                    stats.deleted_count += 1;
                    stats.freed_space_bytes += candidate.size_bytes;
                    deleted_here += 1;
                    continue;
                }
                let deleted = match &candidate.scope {
                    Some(scope) => {
                        self.store
                            .delete_scoped(category, scope, &candidate.file_id)
                            .await
                    }
                    None => self.store.delete_by_id(category, &candidate.file_id).await,
                };
                match deleted {
                    Ok(true) => {
                        stats.deleted_count += 1;
                        stats.freed_space_bytes += candidate.size_bytes;
                        deleted_here += 1;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(
                        "Failed to delete expired {}:{}: {}",
                        category, candidate.file_id, e
                    ),
                }
            }
            if deleted_here > 0 {
                stats
                    .category_stats
                    .insert(category.as_str().to_string(), deleted_here);
            }
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        if stats.deleted_count > 0 {
            info!(
                "Cleanup{}: {} files, {} bytes freed in {}ms",
                if dry_run { " (dry run)" } else { "" },
                stats.deleted_count,
                stats.freed_space_bytes,
                stats.duration_ms
            );
        }
        Ok(stats)
    }

    /// Current usage as a percentage of the configured cap.
    pub async fn usage_percent(&self) -> Result<f64> {
        if self.max_total_bytes == 0 {
            return Ok(0.0);
        }
        let used = self.store.total_usage_bytes().await?;
        Ok(used as f64 / self.max_total_bytes as f64 * 100.0)
    }

    /// Run cleanup when usage exceeds the threshold: cache and temp first,
    /// then a full pass if still over. Returns whether anything ran.
    pub async fn cleanup_if_needed(&self) -> Result<bool> {
        let usage = self.usage_percent().await?;
        if usage <= self.threshold_percent {
            return Ok(false);
        }
        warn!(
            "Storage usage {:.1}% exceeds threshold {:.1}%, cleaning up",
            usage, self.threshold_percent
        );

        self.cleanup_categories(&[FileCategory::Cache, FileCategory::Temp], false)
            .await?;

        if self.usage_percent().await? > self.threshold_percent {
            self.cleanup_expired(false).await?;
        }
        Ok(true)
    }
}

/// Spawn the janitor loop. Wakes every `interval`, deletes expired items,
/// and runs the threshold check. Stops promptly when `shutdown` flips.
pub fn spawn_janitor(
    manager: Arc<LifecycleManager>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("File-store janitor started (interval {:?})", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of tokio::time::interval fires immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = manager.cleanup_expired(false).await {
                        error!("Janitor cleanup failed: {}", e);
                    }
                    if let Err(e) = manager.cleanup_if_needed().await {
                        error!("Janitor threshold check failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("File-store janitor shutting down");
                        break;
                    }
                }
            }
        }
    })
}
