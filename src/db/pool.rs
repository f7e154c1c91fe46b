// src/db/pool.rs
// Async connection pool using deadpool-sqlite
//
// All SQL in this crate lives in synchronous `*_sync(conn, ..)` helpers that
// run inside `pool.interact(..)` closures, keeping blocking work off the
// async runtime. In-memory pools use a shared-cache URI so every pooled
// connection sees the same database (required for tests).

use anyhow::{anyhow, Context, Result};
use deadpool_sqlite::{Config, Pool, Runtime};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Wait this long on a locked database before giving up
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Counter for unique in-memory database names
static MEMDB_COUNTER: AtomicU64 = AtomicU64::new(0);

#[cfg(feature = "vectors")]
mod vec_ext {
    use std::sync::Once;

    static SQLITE_VEC_INIT: Once = Once::new();

    /// Registers sqlite-vec globally (once per process). Must run before any
    /// SQLite connection is opened.
    #[allow(clippy::missing_transmute_annotations)]
    pub fn ensure_registered() {
        SQLITE_VEC_INIT.call_once(|| {
            // SAFETY: sqlite3_vec_init matches the signature expected by
            // sqlite3_auto_extension; the symbol is statically linked and
            // valid for the lifetime of the process.
            unsafe {
                rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
                    sqlite_vec::sqlite3_vec_init as *const (),
                )));
            }
            tracing::debug!("sqlite-vec extension registered globally");
        });
    }
}

/// Register optional SQLite extensions. No-op without the `vectors` feature.
pub fn ensure_extensions_registered() {
    #[cfg(feature = "vectors")]
    vec_ext::ensure_registered();
}

/// Database pool wrapper with per-call busy-timeout setup.
pub struct DatabasePool {
    pool: Pool,
    path: Option<PathBuf>,
}

impl DatabasePool {
    /// Open (or create) a file-backed pool.
    pub async fn open(path: &Path) -> Result<Self> {
        ensure_extensions_registered();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {:?}", parent))?;
        }

        let cfg = Config::new(path);
        let pool = cfg
            .create_pool(Runtime::Tokio1)
            .context("creating SQLite pool")?;

        let db = Self {
            pool,
            path: Some(path.to_path_buf()),
        };

        // WAL is persistent per database file, so one write is enough.
        db.interact(|conn| {
            conn.execute_batch("PRAGMA journal_mode=WAL;")?;
            Ok(())
        })
        .await?;

        Ok(db)
    }

    /// Open a shared-cache in-memory pool (tests and ephemeral indexes).
    pub async fn open_in_memory() -> Result<Self> {
        ensure_extensions_registered();

        let n = MEMDB_COUNTER.fetch_add(1, Ordering::Relaxed);
        let uri = format!("file:memdb_{}?mode=memory&cache=shared", n);
        let cfg = Config::new(uri);
        let pool = cfg
            .create_pool(Runtime::Tokio1)
            .context("creating in-memory SQLite pool")?;

        Ok(Self { pool, path: None })
    }

    /// File path backing this pool, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run a synchronous closure against a pooled connection.
    pub async fn interact<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let obj = self.pool.get().await.context("acquiring connection")?;
        let result = obj
            .interact(move |conn| {
                let _ = conn.busy_timeout(BUSY_TIMEOUT);
                f(conn)
            })
            .await
            .map_err(|e| anyhow!("database interact failed: {}", e))?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory_and_query() {
        let pool = DatabasePool::open_in_memory().await.unwrap();
        let value: i64 = pool
            .interact(|conn| {
                conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (42);")?;
                Ok(conn.query_row("SELECT x FROM t", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_in_memory_pools_are_isolated() {
        let a = DatabasePool::open_in_memory().await.unwrap();
        let b = DatabasePool::open_in_memory().await.unwrap();
        a.interact(|conn| {
            conn.execute_batch("CREATE TABLE only_in_a (x INTEGER);")?;
            Ok(())
        })
        .await
        .unwrap();

        let missing = b
            .interact(|conn| {
                Ok(conn
                    .query_row("SELECT 1 FROM only_in_a", [], |row| row.get::<_, i64>(0))
                    .is_err())
            })
            .await
            .unwrap();
        assert!(missing);
    }

    #[tokio::test]
    async fn test_shared_cache_across_pool_connections() {
        let pool = DatabasePool::open_in_memory().await.unwrap();
        pool.interact(|conn| {
            conn.execute_batch("CREATE TABLE shared (x INTEGER); INSERT INTO shared VALUES (1);")?;
            Ok(())
        })
        .await
        .unwrap();

        // A second interact may land on a different pooled connection; the
        // shared-cache URI guarantees it still sees the table.
        for _ in 0..4 {
            let count: i64 = pool
                .interact(|conn| {
                    Ok(conn.query_row("SELECT COUNT(*) FROM shared", [], |row| row.get(0))?)
                })
                .await
                .unwrap();
            assert_eq!(count, 1);
        }
    }
}
