//! Foundation sessions: one durable context per observed project state, plus
//! the derived session ids that inherit from it. Also owns `project_metadata`.

use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::error::Result;
use crate::fingerprint::{self, KeyFileInfo, ProjectFingerprint};
use crate::manifest::{self, ProjectKind};
use crate::store::{duration_millis, now_millis, parse_json, Database};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FoundationSession {
    pub id: String,
    pub project_path: String,
    pub base_context: String,
    pub created_at: i64,
    pub last_used: i64,
    pub total_tokens_saved: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub derived_sessions: Vec<String>,
    pub project_hash: String,
    pub file_hashes: BTreeMap<String, String>,
    pub last_validated: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectMetadata {
    pub project_path: String,
    pub project_hash: String,
    pub key_files: Vec<KeyFileInfo>,
    pub last_analyzed: i64,
    pub git_commit_hash: Option<String>,
}

/// The columns maintenance needs to judge a session.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SessionHeader {
    pub id: String,
    pub project_path: String,
    pub project_hash: String,
    pub last_validated: i64,
}

/// A scanned row: a label to report it by, and its decoded value.
pub(crate) type Scanned<T> = (String, Result<T>);

const SESSION_COLUMNS: &str = "id, project_path, base_context, created_at, last_used,
     total_tokens_saved, cache_hits, cache_misses, derived_sessions,
     project_hash, file_hashes, last_validated";

pub(crate) struct SessionManager {
    db: Database,
    validity: Duration,
    /// Serializes creation per canonical project path within this process.
    creation_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(db: Database, validity: Duration) -> Self {
        Self {
            db,
            validity,
            creation_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` holding the creation lock for `root`. The map entry is dropped
    /// once no other caller holds or waits on it.
    fn with_creation_lock<T>(&self, root: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self
            .creation_locks
            .lock()
            .entry(root.to_path_buf())
            .or_default()
            .clone();
        let out = {
            let _guard = lock.lock();
            f()
        };
        let mut locks = self.creation_locks.lock();
        // One handle in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(root);
        }
        out
    }

    /// Return the most recently used valid session for the project's current
    /// state, creating one when none exists.
    #[instrument(skip(self, base_context), fields(project = %project_path.display()))]
    pub fn get_or_create(&self, project_path: &Path, base_context: Option<&str>) -> Result<String> {
        let root = fingerprint::canonicalize_lossy(project_path);
        self.with_creation_lock(&root, || {
            let fp = fingerprint::compute_fingerprint(&root);
            self.upsert_metadata(&root, &fp)?;

            if let Some(existing) = self.find_latest(&root, &fp.hash)? {
                if self.check_valid(&existing, &root, Some(&fp.hash))? {
                    self.touch(&existing.id)?;
                    return Ok(existing.id);
                }
                // Same (path, hash) but no longer usable: retire before recreating.
                self.delete(&existing.id)?;
            }

            self.insert(&root, &fp, base_context)
        })
    }

    /// Create a session for exactly `project_path` (no root detection). If a
    /// session for the same (path, hash) already exists, the first writer wins
    /// and its id is returned.
    #[instrument(skip(self, base_context), fields(project = %project_path.display()))]
    pub fn create(&self, project_path: &Path, base_context: Option<&str>) -> Result<String> {
        let root = fingerprint::canonicalize_lossy(project_path);
        self.with_creation_lock(&root, || {
            let fp = fingerprint::compute_fingerprint(&root);
            self.upsert_metadata(&root, &fp)?;
            self.insert(&root, &fp, base_context)
        })
    }

    fn insert(&self, root: &Path, fp: &ProjectFingerprint, base_context: Option<&str>) -> Result<String> {
        let id = format!("foundation_{}", uuid::Uuid::new_v4().simple());
        let now = now_millis();
        let path = root.to_string_lossy().to_string();
        let file_hashes = serde_json::to_string(&fingerprint::compute_file_hashes(root))?;
        let base_context = match base_context {
            Some(ctx) => ctx.to_string(),
            None => default_base_context(root),
        };

        let canonical: String = self.db.with_conn_retry(|conn| {
            conn.execute(
                "INSERT INTO foundation_sessions
                     (id, project_path, base_context, created_at, last_used,
                      derived_sessions, project_hash, file_hashes, last_validated)
                 VALUES (?1, ?2, ?3, ?4, ?4, '[]', ?5, ?6, ?4)
                 ON CONFLICT(project_path, project_hash) DO NOTHING",
                params![id, path, base_context, now, fp.hash, file_hashes],
            )?;
            Ok(conn.query_row(
                "SELECT id FROM foundation_sessions WHERE project_path = ?1 AND project_hash = ?2",
                params![path, fp.hash],
                |row| row.get(0),
            )?)
        })?;

        if canonical == id {
            info!(session_id = %id, project = %path, "foundation session created");
        } else {
            debug!(session_id = %canonical, "foundation session already existed");
        }
        Ok(canonical)
    }

    fn find_latest(&self, root: &Path, project_hash: &str) -> Result<Option<FoundationSession>> {
        let path = root.to_string_lossy().to_string();
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM foundation_sessions
                 WHERE project_path = ?1 AND project_hash = ?2
                 ORDER BY last_used DESC LIMIT 1"
            ))?;
            let mut rows = stmt.query(params![path, project_hash])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_session(row)?)),
                None => Ok(None),
            }
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<FoundationSession>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM foundation_sessions WHERE id = ?1"
            ))?;
            let mut rows = stmt.query(params![id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_session(row)?)),
                None => Ok(None),
            }
        })
    }

    pub fn list(&self) -> Result<Vec<FoundationSession>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM foundation_sessions ORDER BY created_at ASC"
            ))?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_session(row)?);
            }
            Ok(out)
        })
    }

    /// Every session's header, decoded row by row so one unreadable row
    /// does not fail the scan.
    pub fn scan_headers(&self) -> Result<Vec<Scanned<SessionHeader>>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT rowid, id, project_path, project_hash, last_validated
                 FROM foundation_sessions ORDER BY created_at ASC",
            )?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let label = row_label(row, 1)?;
                out.push((label, row_to_header(row)));
            }
            Ok(out)
        })
    }

    pub fn ids_for_path(&self, root: &Path) -> Result<Vec<String>> {
        let path = root.to_string_lossy().to_string();
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id FROM foundation_sessions WHERE project_path = ?1")?;
            let ids = stmt
                .query_map(params![path], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(ids)
        })
    }

    /// True if the paths match and either the last validation is still fresh
    /// or a recomputed hash equals the stored one (refreshing `last_validated`).
    pub fn is_valid(&self, session_id: &str, project_path: &Path) -> Result<bool> {
        let Some(session) = self.get(session_id)? else {
            return Ok(false);
        };
        let root = fingerprint::canonicalize_lossy(project_path);
        self.check_valid(&session, &root, None)
    }

    fn check_valid(
        &self,
        session: &FoundationSession,
        root: &Path,
        current_hash: Option<&str>,
    ) -> Result<bool> {
        if Path::new(&session.project_path) != root {
            return Ok(false);
        }
        if self.is_fresh(session.last_validated) {
            return Ok(true);
        }
        let recomputed;
        let hash = match current_hash {
            Some(h) => h,
            None => {
                recomputed = fingerprint::compute_project_hash(root);
                &recomputed
            }
        };
        if hash != session.project_hash {
            return Ok(false);
        }
        self.mark_validated(&session.id)?;
        Ok(true)
    }

    pub fn is_fresh(&self, last_validated: i64) -> bool {
        now_millis() - last_validated < duration_millis(self.validity)
    }

    pub fn mark_validated(&self, id: &str) -> Result<()> {
        self.db.with_conn_retry(|conn| {
            conn.execute(
                "UPDATE foundation_sessions SET last_validated = ?1 WHERE id = ?2",
                params![now_millis(), id],
            )?;
            Ok(())
        })
    }

    /// Register `derived_id` as inheriting from `foundation_id`.
    /// False when the foundation does not exist. The append happens in one
    /// statement, so concurrent derives on one foundation all land.
    #[instrument(skip(self))]
    pub fn derive(&self, foundation_id: &str, derived_id: &str) -> Result<bool> {
        let n = self.db.with_conn_retry(|conn| {
            Ok(conn.execute(
                "UPDATE foundation_sessions
                 SET derived_sessions = CASE
                         WHEN EXISTS (SELECT 1 FROM json_each(derived_sessions) WHERE value = ?1)
                         THEN derived_sessions
                         ELSE json_insert(derived_sessions, '$[#]', ?1)
                     END,
                     last_used = ?2
                 WHERE id = ?3",
                params![derived_id, now_millis(), foundation_id],
            )?)
        })?;
        Ok(n > 0)
    }

    /// The session itself if it is a foundation, else the foundation listing
    /// it as derived, else None.
    pub fn find_foundation_id(&self, session_id: &str) -> Result<Option<String>> {
        self.db.with_conn(|conn| {
            let own: Option<String> = conn
                .query_row(
                    "SELECT id FROM foundation_sessions WHERE id = ?1",
                    params![session_id],
                    |row| row.get(0),
                )
                .optional()?;
            if own.is_some() {
                return Ok(own);
            }
            // A corrupt list on one row must not break lookups for the rest.
            Ok(conn
                .query_row(
                    "SELECT f.id FROM foundation_sessions f,
                         json_each(CASE WHEN json_valid(f.derived_sessions)
                                        THEN f.derived_sessions ELSE '[]' END) d
                     WHERE d.value = ?1
                     ORDER BY f.last_used DESC LIMIT 1",
                    params![session_id],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn touch(&self, id: &str) -> Result<()> {
        self.db.with_conn_retry(|conn| {
            conn.execute(
                "UPDATE foundation_sessions SET last_used = ?1 WHERE id = ?2",
                params![now_millis(), id],
            )?;
            Ok(())
        })
    }

    pub fn record_hit(&self, id: &str, tokens_saved: u64) -> Result<()> {
        let tokens = i64::try_from(tokens_saved).unwrap_or(i64::MAX);
        self.db.with_conn_retry(|conn| {
            conn.execute(
                "UPDATE foundation_sessions
                 SET cache_hits = cache_hits + 1,
                     total_tokens_saved = total_tokens_saved + ?1,
                     last_used = ?2
                 WHERE id = ?3",
                params![tokens, now_millis(), id],
            )?;
            Ok(())
        })
    }

    pub fn record_miss(&self, id: &str) -> Result<()> {
        self.db.with_conn_retry(|conn| {
            conn.execute(
                "UPDATE foundation_sessions SET cache_misses = cache_misses + 1 WHERE id = ?1",
                params![id],
            )?;
            Ok(())
        })
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let n = self.db.with_conn_retry(|conn| {
            Ok(conn.execute("DELETE FROM foundation_sessions WHERE id = ?1", params![id])?)
        })?;
        if n > 0 {
            info!(session_id = %id, "foundation session retired");
        }
        Ok(n > 0)
    }

    // ── project_metadata ────────────────────────────────────────────────────

    pub fn upsert_metadata(&self, root: &Path, fp: &ProjectFingerprint) -> Result<()> {
        let path = root.to_string_lossy().to_string();
        let key_files = serde_json::to_string(&fp.key_files)?;
        self.db.with_conn_retry(|conn| {
            conn.execute(
                "INSERT INTO project_metadata
                     (project_path, project_hash, key_files, last_analyzed, git_commit_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(project_path) DO UPDATE SET
                     project_hash = excluded.project_hash,
                     key_files = excluded.key_files,
                     last_analyzed = excluded.last_analyzed,
                     git_commit_hash = excluded.git_commit_hash",
                params![path, fp.hash, key_files, now_millis(), fp.git_head],
            )?;
            Ok(())
        })
    }

    pub fn get_metadata(&self, root: &Path) -> Result<Option<ProjectMetadata>> {
        let path = root.to_string_lossy().to_string();
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT project_path, project_hash, key_files, last_analyzed, git_commit_hash
                 FROM project_metadata WHERE project_path = ?1",
            )?;
            let mut rows = stmt.query(params![path])?;
            let Some(row) = rows.next()? else {
                return Ok(None);
            };
            let key_files: String = row.get(2)?;
            Ok(Some(ProjectMetadata {
                project_path: row.get(0)?,
                project_hash: row.get(1)?,
                key_files: parse_json(&key_files, "project_metadata", "key_files")?,
                last_analyzed: row.get(3)?,
                git_commit_hash: row.get(4)?,
            }))
        })
    }

    /// `(project_path, last_analyzed)` per metadata row, decoded row by row.
    pub fn scan_metadata_ages(&self) -> Result<Vec<Scanned<(String, i64)>>> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT rowid, project_path, last_analyzed FROM project_metadata")?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let label = row_label(row, 1)?;
                out.push((label, row_to_age(row)));
            }
            Ok(out)
        })
    }

    pub fn delete_metadata(&self, project_path: &str) -> Result<bool> {
        let n = self.db.with_conn_retry(|conn| {
            Ok(conn.execute(
                "DELETE FROM project_metadata WHERE project_path = ?1",
                params![project_path],
            )?)
        })?;
        Ok(n > 0)
    }
}

/// Text key at `col`, or the rowid (column 0) when the key itself is unreadable.
fn row_label(row: &Row<'_>, col: usize) -> Result<String> {
    match row.get::<_, String>(col) {
        Ok(key) => Ok(key),
        Err(_) => Ok(format!("rowid {}", row.get::<_, i64>(0)?)),
    }
}

fn row_to_header(row: &Row<'_>) -> Result<SessionHeader> {
    Ok(SessionHeader {
        id: row.get(1)?,
        project_path: row.get(2)?,
        project_hash: row.get(3)?,
        last_validated: row.get(4)?,
    })
}

fn row_to_age(row: &Row<'_>) -> Result<(String, i64)> {
    Ok((row.get(1)?, row.get(2)?))
}

fn row_to_session(row: &Row<'_>) -> Result<FoundationSession> {
    let derived: String = row.get(8)?;
    let file_hashes: String = row.get(10)?;
    Ok(FoundationSession {
        id: row.get(0)?,
        project_path: row.get(1)?,
        base_context: row.get(2)?,
        created_at: row.get(3)?,
        last_used: row.get(4)?,
        total_tokens_saved: row.get::<_, i64>(5)?.max(0) as u64,
        cache_hits: row.get::<_, i64>(6)?.max(0) as u64,
        cache_misses: row.get::<_, i64>(7)?.max(0) as u64,
        derived_sessions: parse_json(&derived, "foundation_sessions", "derived_sessions")?,
        project_hash: row.get(9)?,
        file_hashes: parse_json(&file_hashes, "foundation_sessions", "file_hashes")?,
        last_validated: row.get(11)?,
    })
}

/// Project summary synthesized from manifests when the caller supplies none.
pub fn default_base_context(root: &Path) -> String {
    let manifests = manifest::parse_manifests(root);
    let name = manifests
        .iter()
        .find_map(|m| m.name.clone())
        .or_else(|| root.file_name().map(|n| n.to_string_lossy().to_string()))
        .unwrap_or_else(|| "unknown".to_string());
    let kind = manifests
        .iter()
        .map(|m| m.kind)
        .find(|k| *k != ProjectKind::Generic)
        .unwrap_or(ProjectKind::Generic);
    let tools = fingerprint::detect_tools(root, &manifests);
    let dep_count: usize = manifests.iter().map(|m| m.all_deps().count()).sum();

    let mut ctx = format!("Project: {name}\nType: {kind}\nPath: {}\n", root.display());
    if let Some(version) = manifests.iter().find_map(|m| m.version.as_deref()) {
        ctx.push_str(&format!("Version: {version}\n"));
    }
    if !tools.is_empty() {
        ctx.push_str(&format!("Technologies: {}\n", tools.join(", ")));
    }
    ctx.push_str(&format!("Dependencies: {dep_count}\n"));
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn manager(validity: Duration) -> SessionManager {
        SessionManager::new(Database::in_memory().unwrap(), validity)
    }

    fn project() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{"name":"demo","version":"1.0.0","dependencies":{"react":"^18.2.0"}}"#,
        )
        .unwrap();
        dir
    }

    #[test]
    fn sequential_get_or_create_returns_one_session() {
        let m = manager(Duration::from_secs(3600));
        let dir = project();
        let a = m.get_or_create(dir.path(), None).unwrap();
        let b = m.get_or_create(dir.path(), None).unwrap();
        assert_eq!(a, b);
        assert_eq!(m.list().unwrap().len(), 1);
    }

    #[test]
    fn concurrent_creation_yields_single_session() {
        let m = Arc::new(manager(Duration::from_secs(3600)));
        let dir = project();
        let path = dir.path().to_path_buf();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = Arc::clone(&m);
                let path = path.clone();
                std::thread::spawn(move || m.get_or_create(&path, None).unwrap())
            })
            .collect();
        let ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(m.list().unwrap().len(), 1);
    }

    #[test]
    fn explicit_create_is_first_writer_wins() {
        let m = manager(Duration::from_secs(3600));
        let dir = project();
        let a = m.create(dir.path(), Some("ctx")).unwrap();
        let b = m.create(dir.path(), Some("other")).unwrap();
        assert_eq!(a, b);
        assert_eq!(m.get(&a).unwrap().unwrap().base_context, "ctx");
    }

    #[test]
    fn default_context_mentions_project_signals() {
        let dir = project();
        let ctx = default_base_context(dir.path());
        assert!(ctx.contains("Project: demo"));
        assert!(ctx.contains("Type: node"));
        assert!(ctx.contains("framework:react"));
        assert!(ctx.contains("Version: 1.0.0"));
    }

    #[test]
    fn new_session_records_file_hashes_and_metadata() {
        let m = manager(Duration::from_secs(3600));
        let dir = project();
        let id = m.get_or_create(dir.path(), None).unwrap();
        let session = m.get(&id).unwrap().unwrap();
        assert!(session.file_hashes.contains_key("package.json"));
        let root = fs::canonicalize(dir.path()).unwrap();
        let meta = m.get_metadata(&root).unwrap().unwrap();
        assert_eq!(meta.project_hash, session.project_hash);
        assert_eq!(meta.key_files.len(), 1);
    }

    #[test]
    fn changed_project_gets_new_session() {
        let m = manager(Duration::ZERO);
        let dir = project();
        let first = m.get_or_create(dir.path(), None).unwrap();
        fs::write(dir.path().join("package.json"), r#"{"version":"2.0.0"}"#).unwrap();
        let second = m.get_or_create(dir.path(), None).unwrap();
        assert_ne!(first, second);
        assert!(!m.is_valid(&first, dir.path()).unwrap());
        assert!(m.is_valid(&second, dir.path()).unwrap());
    }

    #[test]
    fn fresh_validation_short_circuits_hash_check() {
        let m = manager(Duration::from_secs(3600));
        let dir = project();
        let id = m.get_or_create(dir.path(), None).unwrap();
        fs::write(dir.path().join("package.json"), "{}").unwrap();
        assert!(m.is_valid(&id, dir.path()).unwrap());
    }

    #[test]
    fn validity_requires_matching_path() {
        let m = manager(Duration::from_secs(3600));
        let dir = project();
        let other = TempDir::new().unwrap();
        let id = m.get_or_create(dir.path(), None).unwrap();
        assert!(!m.is_valid(&id, other.path()).unwrap());
        assert!(!m.is_valid("missing", dir.path()).unwrap());
    }

    #[test]
    fn derive_and_find_foundation() {
        let m = manager(Duration::from_secs(3600));
        let dir = project();
        let f = m.get_or_create(dir.path(), None).unwrap();
        assert!(m.derive(&f, "child").unwrap());
        assert!(m.derive(&f, "child").unwrap());
        assert!(!m.derive("nope", "child").unwrap());

        let session = m.get(&f).unwrap().unwrap();
        assert_eq!(session.derived_sessions, vec!["child".to_string()]);
        assert_eq!(m.find_foundation_id(&f).unwrap().as_deref(), Some(f.as_str()));
        assert_eq!(m.find_foundation_id("child").unwrap().as_deref(), Some(f.as_str()));
        assert_eq!(m.find_foundation_id("stranger").unwrap(), None);
    }

    #[test]
    fn creation_locks_are_released_after_use() {
        let m = Arc::new(manager(Duration::from_secs(3600)));
        let dirs: Vec<TempDir> = (0..4).map(|_| project()).collect();
        std::thread::scope(|s| {
            for dir in &dirs {
                let m = &m;
                s.spawn(move || m.get_or_create(dir.path(), None).unwrap());
                s.spawn(move || m.create(dir.path(), None).unwrap());
            }
        });
        assert_eq!(m.list().unwrap().len(), 4);
        assert!(m.creation_locks.lock().is_empty());
    }

    #[test]
    fn concurrent_derives_keep_every_id() {
        let m = Arc::new(manager(Duration::from_secs(3600)));
        let dir = project();
        let f = m.get_or_create(dir.path(), None).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let m = Arc::clone(&m);
                let f = f.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        m.derive(&f, &format!("d{t}-{i}")).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.get(&f).unwrap().unwrap().derived_sessions.len(), 400);
    }

    #[test]
    fn metadata_lookup_targets_one_project() {
        let m = manager(Duration::from_secs(3600));
        let a = project();
        let b = project();
        m.get_or_create(a.path(), None).unwrap();
        m.get_or_create(b.path(), None).unwrap();
        let root = fs::canonicalize(b.path()).unwrap();
        let meta = m.get_metadata(&root).unwrap().unwrap();
        assert_eq!(meta.project_path, root.to_string_lossy());
        assert!(m.get_metadata(Path::new("/nonexistent/project")).unwrap().is_none());
    }

    #[test]
    fn hit_and_miss_counters_accumulate() {
        let m = manager(Duration::from_secs(3600));
        let dir = project();
        let f = m.get_or_create(dir.path(), None).unwrap();
        m.record_hit(&f, 40).unwrap();
        m.record_hit(&f, 2).unwrap();
        m.record_miss(&f).unwrap();
        let s = m.get(&f).unwrap().unwrap();
        assert_eq!(s.cache_hits, 2);
        assert_eq!(s.total_tokens_saved, 42);
        assert_eq!(s.cache_misses, 1);
    }
}
