//! Cache entry store: content-keyed results in SQLite fronted by the hot tier.
//!
//! Lookup order for `(content_hash, template_id, session)`:
//! hot cache → persistent row for the session (preferred) or the default
//! session → persistent row tagged with the session's foundation.

use parking_lot::Mutex;
use rusqlite::{params, types::ToSql, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;
use crate::estimate::TokenEstimator;
use crate::fingerprint;
use crate::hot_cache::{HotCache, HotKey};
use crate::metrics::{MetricsRecorder, CACHE_HIT, CACHE_MISS, CACHE_STORE};
use crate::sessions::SessionManager;
use crate::store::{duration_millis, now_millis, parse_json, Database};

const DEFAULT_SESSION: &str = "default";

/// Session an entry is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionRef {
    Explicit(String),
    Default,
}

impl SessionRef {
    pub fn from_option(id: Option<&str>) -> Self {
        match id {
            Some(id) if id != DEFAULT_SESSION => Self::Explicit(id.to_string()),
            _ => Self::Default,
        }
    }

    pub fn explicit_id(&self) -> Option<&str> {
        match self {
            Self::Explicit(id) => Some(id),
            Self::Default => None,
        }
    }

    pub(crate) fn as_stored(&self) -> &str {
        self.explicit_id().unwrap_or(DEFAULT_SESSION)
    }

    fn from_stored(raw: String) -> Self {
        if raw == DEFAULT_SESSION {
            Self::Default
        } else {
            Self::Explicit(raw)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub id: String,
    pub content_hash: String,
    pub template_id: String,
    pub file_path: String,
    pub session: SessionRef,
    pub foundation_session_id: Option<String>,
    pub result: Value,
    pub tokens_used: u64,
    pub tokens_saved: u64,
    pub created_at: i64,
    pub last_accessed: i64,
    pub access_count: u64,
    pub expires_at: i64,
}

impl CacheEntry {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

/// What a caller asks about: this content, under this template, in this session.
#[derive(Debug, Clone, Copy)]
pub struct AnalysisKey<'a> {
    pub file_path: &'a Path,
    pub content: &'a str,
    pub template_id: &'a str,
    pub session_id: Option<&'a str>,
}

impl<'a> AnalysisKey<'a> {
    pub fn new(file_path: &'a Path, content: &'a str, template_id: &'a str) -> Self {
        Self {
            file_path,
            content,
            template_id,
            session_id: None,
        }
    }

    pub fn in_session(mut self, session_id: &'a str) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

/// Digest of raw content plus template id.
pub fn content_hash(content: &str, template_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher.update([0u8]);
    hasher.update(template_id.as_bytes());
    hex::encode(hasher.finalize())
}

const ENTRY_COLUMNS: &str = "id, content_hash, template_id, file_path, session_id,
     foundation_session_id, result, tokens_used, tokens_saved,
     created_at, last_accessed, access_count, expires_at";

pub(crate) struct EntryStore {
    db: Database,
    hot: Mutex<HotCache>,
    sessions: Arc<SessionManager>,
    metrics: MetricsRecorder,
    estimator: Arc<dyn TokenEstimator>,
    ttl: Duration,
    auto_sessions: bool,
}

impl EntryStore {
    pub fn new(
        db: Database,
        hot: HotCache,
        sessions: Arc<SessionManager>,
        metrics: MetricsRecorder,
        estimator: Arc<dyn TokenEstimator>,
        ttl: Duration,
        auto_sessions: bool,
    ) -> Self {
        Self {
            db,
            hot: Mutex::new(hot),
            sessions,
            metrics,
            estimator,
            ttl,
            auto_sessions,
        }
    }

    /// Explicit id if given; else the file's project foundation when
    /// auto-sessions are on; else the default session.
    pub fn resolve_session(&self, file_path: &Path, session_id: Option<&str>) -> Result<SessionRef> {
        if session_id.is_some() || !self.auto_sessions {
            return Ok(SessionRef::from_option(session_id));
        }
        let root = fingerprint::find_project_root(file_path);
        let id = self.sessions.get_or_create(&root, None)?;
        Ok(SessionRef::Explicit(id))
    }

    fn foundation_for(&self, session: &SessionRef) -> Result<Option<String>> {
        match session.explicit_id() {
            Some(id) => self.sessions.find_foundation_id(id),
            None => Ok(None),
        }
    }

    pub fn get(&self, key: &AnalysisKey<'_>) -> Result<Option<Value>> {
        let hash = content_hash(key.content, key.template_id);
        let session = self.resolve_session(key.file_path, key.session_id)?;
        let foundation = self.foundation_for(&session)?;
        let hot_key = HotKey::new(&hash, key.template_id, &session);
        let now = now_millis();

        let hot_hit = {
            let mut hot = self.hot.lock();
            match hot.get_mut(&hot_key) {
                Some(entry) if !entry.is_expired(now) => {
                    entry.last_accessed = now;
                    entry.access_count += 1;
                    Some(entry.clone())
                }
                Some(_) => {
                    hot.remove(&hot_key);
                    None
                }
                None => None,
            }
        };
        if let Some(entry) = hot_hit {
            if let Err(e) = self.mark_accessed(&entry.id, now) {
                warn!(entry_id = %entry.id, error = %e, "failed to persist hot-hit access");
            }
            self.on_hit(&entry, foundation.as_deref(), "memory");
            return Ok(Some(entry.result));
        }

        let mut found = self
            .find_in_session(&hash, key.template_id, &session, now)?
            .map(|e| (e, "persistent"));
        if found.is_none() {
            if let Some(fid) = foundation.as_deref() {
                found = self
                    .find_in_foundation(&hash, key.template_id, fid, now)?
                    .map(|e| (e, "foundation"));
            }
        }

        let Some((mut entry, tier)) = found else {
            debug!(template_id = key.template_id, "analysis cache miss");
            self.metrics.record(CACHE_MISS, key.template_id, 0.0);
            if let Some(fid) = foundation.as_deref() {
                if let Err(e) = self.sessions.record_miss(fid) {
                    warn!(session_id = fid, error = %e, "failed to update miss counter");
                }
            }
            return Ok(None);
        };

        self.mark_accessed(&entry.id, now)?;
        entry.last_accessed = now;
        entry.access_count += 1;

        {
            let mut hot = self.hot.lock();
            hot.insert(hot_key, entry.clone());
            if hot.over_budget() {
                hot.evict();
            }
        }
        self.on_hit(&entry, foundation.as_deref(), tier);
        Ok(Some(entry.result))
    }

    fn on_hit(&self, entry: &CacheEntry, foundation: Option<&str>, tier: &str) {
        debug!(entry_id = %entry.id, tier, "analysis cache hit");
        self.metrics
            .record(CACHE_HIT, tier, entry.tokens_saved as f64);
        if entry.tokens_saved == 0 {
            return;
        }
        let fid = foundation.or(entry.foundation_session_id.as_deref());
        if let Some(fid) = fid {
            if let Err(e) = self.sessions.record_hit(fid, entry.tokens_saved) {
                warn!(session_id = fid, error = %e, "failed to update hit counter");
            }
        }
    }

    /// Store a result, replacing any row for the same key and session.
    ///
    /// The write-side counter on the foundation session is `last_used`.
    /// `cache_misses` is counted on the read path, where the miss happens,
    /// so a get-then-put cycle counts one miss rather than two.
    pub fn put(&self, key: &AnalysisKey<'_>, result: &Value, tokens_used: u64) -> Result<String> {
        let hash = content_hash(key.content, key.template_id);
        let session = self.resolve_session(key.file_path, key.session_id)?;
        let foundation = self.foundation_for(&session)?;
        let now = now_millis();

        let entry = CacheEntry {
            id: uuid::Uuid::new_v4().to_string(),
            content_hash: hash,
            template_id: key.template_id.to_string(),
            file_path: key.file_path.to_string_lossy().to_string(),
            session: session.clone(),
            foundation_session_id: foundation.clone(),
            result: result.clone(),
            tokens_used,
            tokens_saved: self.estimator.estimate_saved(key.content, result),
            created_at: now,
            last_accessed: now,
            access_count: 0,
            expires_at: now.saturating_add(duration_millis(self.ttl)),
        };
        let result_json = serde_json::to_string(&entry.result)?;

        let replaced: HashSet<String> = self.db.with_conn_retry(|conn| {
            // One live row per (content_hash, template_id, session).
            let replaced = conn
                .prepare(
                    "DELETE FROM cache_entries
                     WHERE content_hash = ?1 AND template_id = ?2 AND session_id = ?3
                     RETURNING id",
                )?
                .query_map(
                    params![entry.content_hash, entry.template_id, session.as_stored()],
                    |row| row.get(0),
                )?
                .collect::<rusqlite::Result<HashSet<String>>>()?;
            conn.execute(
                &format!(
                    "INSERT INTO cache_entries ({ENTRY_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    entry.id,
                    entry.content_hash,
                    entry.template_id,
                    entry.file_path,
                    session.as_stored(),
                    entry.foundation_session_id,
                    result_json,
                    to_i64(entry.tokens_used),
                    to_i64(entry.tokens_saved),
                    entry.created_at,
                    entry.last_accessed,
                    to_i64(entry.access_count),
                    entry.expires_at,
                ],
            )?;
            Ok(replaced)
        })?;

        let id = entry.id.clone();
        {
            let mut hot = self.hot.lock();
            // Copies promoted under other sessions' keys must not outlive the row.
            hot.remove_ids(&replaced);
            hot.insert(HotKey::new(&entry.content_hash, &entry.template_id, &session), entry);
            if hot.over_budget() {
                hot.evict();
            }
        }

        if let Some(fid) = foundation.as_deref() {
            if let Err(e) = self.sessions.touch(fid) {
                warn!(session_id = fid, error = %e, "failed to touch foundation session");
            }
        }
        self.metrics
            .record(CACHE_STORE, key.template_id, tokens_used as f64);
        debug!(entry_id = %id, template_id = key.template_id, "analysis result cached");
        Ok(id)
    }

    fn find_in_session(
        &self,
        hash: &str,
        template_id: &str,
        session: &SessionRef,
        now: i64,
    ) -> Result<Option<CacheEntry>> {
        let stored = session.as_stored();
        self.query_one(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM cache_entries
                 WHERE content_hash = ?1 AND template_id = ?2
                   AND session_id IN (?3, ?4) AND expires_at > ?5
                 ORDER BY CASE WHEN session_id = ?3 THEN 0 ELSE 1 END, last_accessed DESC
                 LIMIT 1"
            ),
            params![hash, template_id, stored, DEFAULT_SESSION, now],
        )
    }

    fn find_in_foundation(
        &self,
        hash: &str,
        template_id: &str,
        foundation_id: &str,
        now: i64,
    ) -> Result<Option<CacheEntry>> {
        self.query_one(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM cache_entries
                 WHERE content_hash = ?1 AND template_id = ?2
                   AND foundation_session_id = ?3 AND expires_at > ?4
                 ORDER BY last_accessed DESC
                 LIMIT 1"
            ),
            params![hash, template_id, foundation_id, now],
        )
    }

    fn query_one(&self, sql: &str, args: &[&dyn ToSql]) -> Result<Option<CacheEntry>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(args)?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_entry(row)?)),
                None => Ok(None),
            }
        })
    }

    fn mark_accessed(&self, id: &str, now: i64) -> Result<()> {
        self.db.with_conn_retry(|conn| {
            conn.execute(
                "UPDATE cache_entries
                 SET last_accessed = ?1, access_count = access_count + 1
                 WHERE id = ?2",
                params![now, id],
            )?;
            Ok(())
        })
    }

    /// Delete entries matching `where_clause`, mirroring deletions into the hot tier.
    pub fn delete_where(&self, where_clause: &str, args: &[&dyn ToSql]) -> Result<usize> {
        let sql = format!("DELETE FROM cache_entries WHERE {where_clause} RETURNING id");
        let ids: HashSet<String> = self.db.with_conn_retry(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let ids = stmt
                .query_map(args, |row| row.get(0))?
                .collect::<rusqlite::Result<HashSet<String>>>()?;
            Ok(ids)
        })?;
        self.hot.lock().remove_ids(&ids);
        Ok(ids.len())
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<CacheEntry>> {
        self.query_one(
            &format!("SELECT {ENTRY_COLUMNS} FROM cache_entries WHERE id = ?1"),
            params![id],
        )
    }

    /// Drop expired hot entries, then evict down to budget.
    pub fn sweep_hot(&self, now: i64) -> usize {
        let mut hot = self.hot.lock();
        hot.retain(|e| !e.is_expired(now)) + hot.evict()
    }

    pub fn hot_len(&self) -> usize {
        self.hot.lock().len()
    }

    pub fn clear_hot(&self) {
        self.hot.lock().clear();
    }
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn row_to_entry(row: &Row<'_>) -> Result<CacheEntry> {
    let session: String = row.get(4)?;
    let result: String = row.get(6)?;
    Ok(CacheEntry {
        id: row.get(0)?,
        content_hash: row.get(1)?,
        template_id: row.get(2)?,
        file_path: row.get(3)?,
        session: SessionRef::from_stored(session),
        foundation_session_id: row.get(5)?,
        result: parse_json(&result, "cache_entries", "result")?,
        tokens_used: row.get::<_, i64>(7)?.max(0) as u64,
        tokens_saved: row.get::<_, i64>(8)?.max(0) as u64,
        created_at: row.get(9)?,
        last_accessed: row.get(10)?,
        access_count: row.get::<_, i64>(11)?.max(0) as u64,
        expires_at: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimate::CharRatioEstimator;
    use serde_json::json;

    fn store(auto_sessions: bool, ttl: Duration) -> (EntryStore, Database) {
        let db = Database::in_memory().unwrap();
        let sessions = Arc::new(SessionManager::new(db.clone(), Duration::from_secs(3600)));
        let store = EntryStore::new(
            db.clone(),
            HotCache::new(100, 1 << 20),
            sessions,
            MetricsRecorder::new(db.clone(), true),
            Arc::new(CharRatioEstimator::default()),
            ttl,
            auto_sessions,
        );
        (store, db)
    }

    #[test]
    fn content_hash_depends_on_template() {
        assert_ne!(content_hash("abc", "T1"), content_hash("abc", "T2"));
        assert_eq!(content_hash("abc", "T1"), content_hash("abc", "T1"));
        assert_ne!(content_hash("ab", "cT"), content_hash("abc", "T"));
    }

    #[test]
    fn session_ref_default_sentinel() {
        assert_eq!(SessionRef::from_option(None), SessionRef::Default);
        assert_eq!(SessionRef::from_option(Some("default")), SessionRef::Default);
        assert_eq!(
            SessionRef::from_option(Some("s1")),
            SessionRef::Explicit("s1".into())
        );
        assert_eq!(SessionRef::Default.as_stored(), "default");
        assert_eq!(SessionRef::from_stored("x".into()).explicit_id(), Some("x"));
    }

    #[test]
    fn round_trip_through_persistent_tier() {
        let (store, _db) = store(false, Duration::from_secs(3600));
        let key = AnalysisKey::new(Path::new("a.ts"), "const a = 1;", "symbols").in_session("s1");
        let result = json!({"symbols": ["a"]});
        let id = store.put(&key, &result, 12).unwrap();

        store.clear_hot();
        assert_eq!(store.get(&key).unwrap(), Some(result.clone()));
        assert_eq!(store.hot_len(), 1, "persistent hit is promoted");
        assert_eq!(store.get(&key).unwrap(), Some(result));

        let entry = store.get_by_id(&id).unwrap().unwrap();
        assert_eq!(entry.access_count, 2);
        assert_eq!(entry.tokens_used, 12);
        assert!(entry.tokens_saved > 0);
    }

    #[test]
    fn default_session_entries_serve_explicit_sessions() {
        let (store, _db) = store(false, Duration::from_secs(3600));
        let shared = AnalysisKey::new(Path::new("a.ts"), "x", "T");
        store.put(&shared, &json!("shared"), 0).unwrap();
        store.put(&shared.in_session("s1"), &json!("mine"), 0).unwrap();

        store.clear_hot();
        assert_eq!(store.get(&shared.in_session("s1")).unwrap(), Some(json!("mine")));
        assert_eq!(store.get(&shared.in_session("s2")).unwrap(), Some(json!("shared")));
    }

    #[test]
    fn rewrite_replaces_previous_row() {
        let (store, db) = store(false, Duration::from_secs(3600));
        let key = AnalysisKey::new(Path::new("a.ts"), "x", "T").in_session("s1");
        store.put(&key, &json!(1), 0).unwrap();
        store.put(&key, &json!(2), 0).unwrap();
        let count: i64 = db
            .with_conn(|c| Ok(c.query_row("SELECT COUNT(*) FROM cache_entries", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 1);
        store.clear_hot();
        assert_eq!(store.get(&key).unwrap(), Some(json!(2)));
    }

    #[test]
    fn rewrite_drops_copies_promoted_under_other_sessions() {
        let (store, _db) = store(false, Duration::from_secs(3600));
        let shared = AnalysisKey::new(Path::new("a.ts"), "x", "T");
        store.put(&shared, &json!("old"), 0).unwrap();
        store.clear_hot();
        assert_eq!(store.get(&shared.in_session("s2")).unwrap(), Some(json!("old")));

        store.put(&shared, &json!("new"), 0).unwrap();
        assert_eq!(store.get(&shared.in_session("s2")).unwrap(), Some(json!("new")));
    }

    #[test]
    fn zero_ttl_entries_are_never_served() {
        let (store, _db) = store(false, Duration::ZERO);
        let key = AnalysisKey::new(Path::new("a.ts"), "x", "T").in_session("s1");
        store.put(&key, &json!(1), 0).unwrap();
        assert_eq!(store.get(&key).unwrap(), None);
        assert_eq!(store.hot_len(), 0, "expired hot copy is dropped");
    }

    #[test]
    fn miss_is_not_an_error() {
        let (store, _db) = store(false, Duration::from_secs(3600));
        let key = AnalysisKey::new(Path::new("a.ts"), "never stored", "T");
        assert_eq!(store.get(&key).unwrap(), None);
    }

    #[test]
    fn delete_where_mirrors_into_hot_tier() {
        let (store, _db) = store(false, Duration::from_secs(3600));
        let key = AnalysisKey::new(Path::new("a.ts"), "x", "T").in_session("s1");
        store.put(&key, &json!(1), 0).unwrap();
        assert_eq!(store.hot_len(), 1);
        assert_eq!(store.delete_where("template_id = ?1", params!["T"]).unwrap(), 1);
        assert_eq!(store.hot_len(), 0);
        assert_eq!(store.get(&key).unwrap(), None);
    }

    #[test]
    fn auto_session_binds_entries_to_project_foundation() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\nname = \"p\"\n").unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        let file = dir.path().join("src").join("lib.rs");

        let (store, _db) = store(true, Duration::from_secs(3600));
        let key = AnalysisKey::new(&file, "pub fn f() {}", "symbols");
        let id = store.put(&key, &json!(["f"]), 0).unwrap();
        let entry = store.get_by_id(&id).unwrap().unwrap();
        let fid = entry.foundation_session_id.clone().unwrap();
        assert_eq!(entry.session, SessionRef::Explicit(fid));
        assert_eq!(store.get(&key).unwrap(), Some(json!(["f"])));
    }
}
