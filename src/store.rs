// SQLite WAL backend shared by the entry store, session manager and metrics log.
use parking_lot::Mutex;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{CacheError, Result};

pub(crate) const SCHEMA_VERSION: u32 = 1;

const PRAGMAS: &str = "PRAGMA journal_mode=WAL;
     PRAGMA synchronous=NORMAL;
     PRAGMA busy_timeout=2500;";

const CREATE_TABLES: &str = "CREATE TABLE IF NOT EXISTS foundation_sessions (
        id                 TEXT    PRIMARY KEY,
        project_path       TEXT    NOT NULL,
        base_context       TEXT    NOT NULL,
        created_at         INTEGER NOT NULL,
        last_used          INTEGER NOT NULL,
        total_tokens_saved INTEGER NOT NULL DEFAULT 0,
        cache_hits         INTEGER NOT NULL DEFAULT 0,
        cache_misses       INTEGER NOT NULL DEFAULT 0,
        derived_sessions   TEXT    NOT NULL DEFAULT '[]',
        project_hash       TEXT    NOT NULL,
        file_hashes        TEXT    NOT NULL DEFAULT '{}',
        last_validated     INTEGER NOT NULL,
        UNIQUE (project_path, project_hash)
     );
     CREATE TABLE IF NOT EXISTS cache_entries (
        id                    TEXT    PRIMARY KEY,
        content_hash          TEXT    NOT NULL,
        template_id           TEXT    NOT NULL,
        file_path             TEXT    NOT NULL,
        session_id            TEXT    NOT NULL,
        foundation_session_id TEXT,
        result                TEXT    NOT NULL,
        tokens_used           INTEGER NOT NULL DEFAULT 0,
        tokens_saved          INTEGER NOT NULL DEFAULT 0,
        created_at            INTEGER NOT NULL,
        last_accessed         INTEGER NOT NULL,
        access_count          INTEGER NOT NULL DEFAULT 0,
        expires_at            INTEGER NOT NULL
     );
     CREATE TABLE IF NOT EXISTS project_metadata (
        project_path    TEXT    PRIMARY KEY,
        project_hash    TEXT    NOT NULL,
        key_files       TEXT    NOT NULL DEFAULT '[]',
        last_analyzed   INTEGER NOT NULL,
        git_commit_hash TEXT
     );
     CREATE TABLE IF NOT EXISTS cache_metrics (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        metric_type TEXT    NOT NULL,
        metric_key  TEXT    NOT NULL,
        value       REAL    NOT NULL,
        timestamp   INTEGER NOT NULL
     );
     CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER NOT NULL
     );
     CREATE INDEX IF NOT EXISTS idx_entries_content_hash
         ON cache_entries(content_hash);
     CREATE INDEX IF NOT EXISTS idx_entries_template_session
         ON cache_entries(template_id, session_id);
     CREATE INDEX IF NOT EXISTS idx_entries_foundation
         ON cache_entries(foundation_session_id);
     CREATE INDEX IF NOT EXISTS idx_entries_expires
         ON cache_entries(expires_at);
     CREATE INDEX IF NOT EXISTS idx_sessions_project_path
         ON foundation_sessions(project_path);
     CREATE INDEX IF NOT EXISTS idx_sessions_project_hash
         ON foundation_sessions(project_hash);
     CREATE INDEX IF NOT EXISTS idx_metadata_hash
         ON project_metadata(project_hash);
     CREATE INDEX IF NOT EXISTS idx_metrics_type_key_time
         ON cache_metrics(metric_type, metric_key, timestamp);";

/// Thread-safe SQLite handle. Cloning shares the same connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    /// Open (or create) the cache db, enable WAL mode and initialise the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        init(&conn)?;
        info!(path = %path.display(), "analysis cache database opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    /// Open an in-memory database (tests and throwaway caches).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Like `with_conn`, retrying transient SQLITE_BUSY failures.
    pub fn with_conn_retry<F, T>(&self, f: F) -> Result<T>
    where
        F: Fn(&Connection) -> Result<T>,
    {
        with_retry(3, || self.with_conn(&f))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current on-disk footprint in bytes (page_count * page_size).
    pub fn size_bytes(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let pages: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
            let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
            Ok((pages.max(0) as u64) * (page_size.max(0) as u64))
        })
    }

    /// VACUUM the store. Returns the number of bytes reclaimed.
    pub fn compact(&self) -> Result<u64> {
        let before = self.size_bytes()?;
        self.with_conn(|conn| {
            conn.execute_batch("VACUUM;")?;
            Ok(())
        })?;
        let after = self.size_bytes()?;
        Ok(before.saturating_sub(after))
    }
}

fn init(conn: &Connection) -> Result<()> {
    conn.execute_batch(PRAGMAS)?;
    conn.execute_batch(CREATE_TABLES)?;

    let version: Option<u32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();
    if version.is_none() {
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [SCHEMA_VERSION],
        )?;
    }
    Ok(())
}

/// Retry wrapper for operations that may fail with SQLITE_BUSY when several
/// processes share one cache file. Backoff: 100ms, 200ms, 400ms.
pub(crate) fn with_retry<T, F: Fn() -> Result<T>>(max_retries: u32, op: F) -> Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !e.is_busy() || attempt >= max_retries {
                    return Err(e);
                }
                attempt += 1;
                let backoff_ms = 100 * (1u64 << (attempt - 1));
                std::thread::sleep(Duration::from_millis(backoff_ms));
            }
        }
    }
}

// ── Row helpers ──────────────────────────────────────────────────────────────

/// Parse a JSON text column, reporting the column on failure.
pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| CacheError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

// ── Timestamp helpers ────────────────────────────────────────────────────────

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn busy() -> CacheError {
        CacheError::Storage(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        ))
    }

    #[test]
    fn tables_created() {
        let db = Database::in_memory().unwrap();
        let tables: Vec<String> = db
            .with_conn(|conn| {
                let mut stmt =
                    conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                Ok(rows.collect::<std::result::Result<_, _>>()?)
            })
            .unwrap();
        for expected in [
            "cache_entries",
            "cache_metrics",
            "foundation_sessions",
            "project_metadata",
            "schema_version",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing {expected}");
        }
    }

    #[test]
    fn schema_version_set_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("cache.db");
        drop(Database::open(&path).unwrap());
        let db = Database::open(&path).unwrap();
        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 1);
        assert!(path.exists());
    }

    #[test]
    fn compact_reports_non_negative_reclaim() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            for i in 0..200 {
                conn.execute(
                    "INSERT INTO cache_metrics (metric_type, metric_key, value, timestamp)
                     VALUES ('t', ?1, 1.0, 0)",
                    [format!("key-{i}-{}", "x".repeat(200))],
                )?;
            }
            conn.execute("DELETE FROM cache_metrics", [])?;
            Ok(())
        })
        .unwrap();
        let before = db.size_bytes().unwrap();
        let reclaimed = db.compact().unwrap();
        let after = db.size_bytes().unwrap();
        assert!(after <= before);
        assert_eq!(reclaimed, before - after);
    }

    #[test]
    fn retry_succeeds_on_first_attempt() {
        let result = with_retry(3, || Ok::<u32, CacheError>(42));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn retry_propagates_non_busy_error_immediately() {
        let attempts = AtomicU32::new(0);
        let result = with_retry(3, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(CacheError::InvalidInvocation("other".into()))
        });
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retry_retries_on_database_locked() {
        let attempts = AtomicU32::new(0);
        let result = with_retry(2, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err::<u32, _>(busy())
            } else {
                Ok(99)
            }
        });
        assert_eq!(result.unwrap(), 99);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
