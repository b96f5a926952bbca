pub mod migrations;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;

use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;

use crate::error::{HiveError, Result};

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// Backoff schedule for `with_sqlite_retry`.
const RETRY_BACKOFF_MS: [u64; 3] = [100, 200, 400];

/// Run a write sequence, retrying on `busy`/`locked` with exponential
/// backoff. Constraint, mismatch, and other errors surface immediately.
pub fn with_sqlite_retry<T>(mut f: impl FnMut() -> Result<T>) -> Result<T> {
    for backoff_ms in RETRY_BACKOFF_MS {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if matches!(err, HiveError::Busy(_) | HiveError::Locked(_)) => {
                tracing::debug!(error = %err, backoff_ms, "storage contention, retrying");
                std::thread::sleep(Duration::from_millis(backoff_ms));
            }
            Err(err) => return Err(err),
        }
    }
    f()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct WalStats {
    pub wal_size_bytes: u64,
    pub wal_file_count: u32,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WalHealth {
    pub healthy: bool,
    pub message: String,
}

pub const DEFAULT_WAL_THRESHOLD_MB: u64 = 100;

/// Uniform adapter over the embedded SQLite engine. Owns the connection;
/// every subsystem in the process shares one `Database` for its lifetime.
pub struct Database {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (or create) the database at the given path with sqlite-vec
    /// loaded, WAL mode on, and all migrations applied.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        load_sqlite_vec();

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA foreign_keys=ON;\
             PRAGMA busy_timeout=5000;",
        )?;

        let db = Self {
            conn,
            path: Some(path.to_path_buf()),
        };
        with_sqlite_retry(|| migrations::run_migrations(&db))?;
        db.quick_check()?;
        tracing::info!(path = %path.display(), "database initialized");
        Ok(db)
    }

    /// Open an in-memory database (tests and ephemeral tooling).
    pub fn open_memory() -> Result<Self> {
        load_sqlite_vec();
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;
        let db = Self { conn, path: None };
        migrations::run_migrations(&db)?;
        Ok(db)
    }

    /// Convenience: open `<repo_root>/.hive/hive.db`, creating the
    /// directory if needed.
    pub fn from_repo(repo_root: &Path) -> Result<Self> {
        let hive_dir = repo_root.join(".hive");
        fs::create_dir_all(&hive_dir)?;
        Self::open(hive_dir.join("hive.db"))
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Truncating WAL checkpoint. Called after each migration batch and
    /// after `reset`.
    pub fn checkpoint(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }

    /// Size and count of WAL side files next to the main database file.
    /// In-memory databases report zeros.
    pub fn wal_stats(&self) -> Result<WalStats> {
        let Some(path) = &self.path else {
            return Ok(WalStats {
                wal_size_bytes: 0,
                wal_file_count: 0,
            });
        };
        let mut size = 0u64;
        let mut count = 0u32;
        for suffix in ["-wal", "-shm"] {
            let mut os = path.clone().into_os_string();
            os.push(suffix);
            let side = PathBuf::from(os);
            if let Ok(meta) = fs::metadata(&side) {
                size += meta.len();
                count += 1;
            }
        }
        Ok(WalStats {
            wal_size_bytes: size,
            wal_file_count: count,
        })
    }

    /// WAL bloat check. Exceeding the threshold is a warning surfaced to
    /// the caller, never an error.
    pub fn check_wal_health(&self, threshold_mb: u64) -> Result<WalHealth> {
        let stats = self.wal_stats()?;
        let threshold_bytes = threshold_mb * 1024 * 1024;
        if stats.wal_size_bytes > threshold_bytes {
            Ok(WalHealth {
                healthy: false,
                message: format!(
                    "WAL is {} bytes across {} files (threshold {} MB); run a checkpoint",
                    stats.wal_size_bytes, stats.wal_file_count, threshold_mb
                ),
            })
        } else {
            Ok(WalHealth {
                healthy: true,
                message: format!(
                    "WAL is {} bytes across {} files",
                    stats.wal_size_bytes, stats.wal_file_count
                ),
            })
        }
    }

    /// PRAGMA quick_check; fails with `Schema` on corruption.
    pub fn quick_check(&self) -> Result<()> {
        let verdict: String = self
            .conn
            .pragma_query_value(None, "quick_check", |row| row.get(0))?;
        if verdict != "ok" {
            return Err(HiveError::Schema(format!(
                "integrity check failed: {verdict}"
            )));
        }
        Ok(())
    }

    /// Administrative reset: drop every table and re-run migrations.
    /// Events are otherwise never deleted; this is the one exception.
    pub fn reset(&self) -> Result<()> {
        with_sqlite_retry(|| {
            let tx = self.conn.unchecked_transaction()?;
            for table in migrations::ALL_TABLES {
                tx.execute_batch(&format!("DROP TABLE IF EXISTS \"{table}\""))?;
            }
            tx.commit()?;
            Ok(())
        })?;
        with_sqlite_retry(|| migrations::run_migrations(self))?;
        self.checkpoint()?;
        tracing::warn!("database reset: all tables dropped and recreated");
        Ok(())
    }

    /// Close the connection explicitly (normally handled by Drop).
    pub fn close(self) -> Result<()> {
        self.conn
            .close()
            .map_err(|(_conn, err)| HiveError::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_parent_dirs_and_migrates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("hive.db");
        let db = Database::open(&path).unwrap();
        assert!(path.exists());
        let version = migrations::current_version(&db).unwrap();
        assert_eq!(version, migrations::LATEST_VERSION);
    }

    #[test]
    fn memory_database_has_zero_wal_stats() {
        let db = Database::open_memory().unwrap();
        let stats = db.wal_stats().unwrap();
        assert_eq!(stats.wal_size_bytes, 0);
        assert_eq!(stats.wal_file_count, 0);
        assert!(db.check_wal_health(DEFAULT_WAL_THRESHOLD_MB).unwrap().healthy);
    }

    #[test]
    fn retry_passes_through_non_retryable() {
        let mut calls = 0;
        let result: Result<()> = with_sqlite_retry(|| {
            calls += 1;
            Err(HiveError::Constraint("pk".into()))
        });
        assert!(matches!(result, Err(HiveError::Constraint(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn retry_retries_busy_then_succeeds() {
        let mut calls = 0;
        let result = with_sqlite_retry(|| {
            calls += 1;
            if calls < 3 {
                Err(HiveError::Busy("wal".into()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 3);
    }

    #[test]
    fn retry_gives_up_after_backoff_schedule() {
        let mut calls = 0;
        let result: Result<()> = with_sqlite_retry(|| {
            calls += 1;
            Err(HiveError::Locked("db".into()))
        });
        assert!(matches!(result, Err(HiveError::Locked(_))));
        assert_eq!(calls, 4);
    }

    #[test]
    fn reset_recreates_schema() {
        let db = Database::open_memory().unwrap();
        db.conn()
            .execute(
                "INSERT INTO events (type, project_key, timestamp, sequence, data)
                 VALUES ('bead_created', '/r', 0, 1, '{}')",
                [],
            )
            .unwrap();
        db.reset().unwrap();
        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
        assert_eq!(
            migrations::current_version(&db).unwrap(),
            migrations::LATEST_VERSION
        );
    }
}
