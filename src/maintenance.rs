//! Periodic sweep, read-only health check, and explicit invalidation.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use rusqlite::{params, types::ToSql};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::entries::{EntryStore, SessionRef};
use crate::error::{CacheError, Result};
use crate::fingerprint;
use crate::metrics::MetricsRecorder;
use crate::sessions::{SessionHeader, SessionManager};
use crate::store::{duration_millis, now_millis, Database};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepFailure {
    pub step: &'static str,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub expired_entries: usize,
    pub orphaned_entries: usize,
    pub invalid_sessions: usize,
    pub stale_project_metadata: usize,
    pub pruned_metrics: usize,
    /// Bytes reclaimed by compaction.
    pub compacted_size: u64,
    pub evicted_hot_entries: usize,
    pub failures: Vec<StepFailure>,
}

impl MaintenanceReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn run_step<T: Default>(&mut self, step: &'static str, op: impl FnOnce() -> Result<T>) -> T {
        match op() {
            Ok(v) => v,
            Err(e) => {
                self.fail(step, &e);
                T::default()
            }
        }
    }

    fn fail(&mut self, step: &'static str, err: &CacheError) {
        warn!(step, error = %err, "maintenance step failed");
        self.failures.push(StepFailure {
            step,
            error: err.to_string(),
        });
    }

    /// One record failed; the step carries on with the rest.
    fn fail_record(&mut self, step: &'static str, record: &str, err: &CacheError) {
        warn!(step, record, error = %err, "maintenance skipped a record");
        self.failures.push(StepFailure {
            step,
            error: format!("{record}: {err}"),
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionHealth {
    /// Project exists, hash matches, validation still fresh.
    Valid,
    /// Hash matches but the freshness window expired.
    Stale,
    /// Project exists but its hash diverged.
    Invalid,
    /// Project path is gone.
    Missing,
}

impl SessionHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Stale => "stale",
            Self::Invalid => "invalid",
            Self::Missing => "missing",
        }
    }
}

impl fmt::Display for SessionHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionValidation {
    pub session_id: String,
    pub project_path: String,
    pub status: SessionHealth,
    /// Recomputed project hash; None when the project is missing.
    pub current_hash: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub sessions: Vec<SessionValidation>,
    pub valid: usize,
    pub stale: usize,
    pub invalid: usize,
    pub missing: usize,
    /// Rows that could not be decoded, by id (or rowid).
    pub unreadable: Vec<String>,
}

impl ValidationReport {
    fn push(&mut self, v: SessionValidation) {
        match v.status {
            SessionHealth::Valid => self.valid += 1,
            SessionHealth::Stale => self.stale += 1,
            SessionHealth::Invalid => self.invalid += 1,
            SessionHealth::Missing => self.missing += 1,
        }
        self.sessions.push(v);
    }
}

/// Conjunction of entry filters. At least one must be set.
#[derive(Debug, Clone, Default)]
pub struct InvalidationCriteria {
    pub session_id: Option<String>,
    pub template_id: Option<String>,
    pub file_path: Option<PathBuf>,
    pub older_than: Option<DateTime<Utc>>,
}

impl InvalidationCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn template(mut self, id: impl Into<String>) -> Self {
        self.template_id = Some(id.into());
        self
    }

    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn created_before(mut self, ts: DateTime<Utc>) -> Self {
        self.older_than = Some(ts);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.session_id.is_none()
            && self.template_id.is_none()
            && self.file_path.is_none()
            && self.older_than.is_none()
    }

    fn to_sql(&self) -> (String, Vec<Box<dyn ToSql>>) {
        let mut clauses = Vec::new();
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(id) = &self.session_id {
            args.push(Box::new(
                SessionRef::from_option(Some(id)).as_stored().to_string(),
            ));
            clauses.push(format!("session_id = ?{}", args.len()));
        }
        if let Some(t) = &self.template_id {
            args.push(Box::new(t.clone()));
            clauses.push(format!("template_id = ?{}", args.len()));
        }
        if let Some(p) = &self.file_path {
            args.push(Box::new(p.to_string_lossy().to_string()));
            clauses.push(format!("file_path = ?{}", args.len()));
        }
        if let Some(ts) = &self.older_than {
            args.push(Box::new(ts.timestamp_millis()));
            clauses.push(format!("created_at < ?{}", args.len()));
        }
        (clauses.join(" AND "), args)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProjectInvalidation {
    pub entries: usize,
    pub sessions: usize,
    pub metadata_removed: bool,
}

pub(crate) struct Maintenance {
    db: Database,
    sessions: Arc<SessionManager>,
    entries: Arc<EntryStore>,
    metrics: MetricsRecorder,
    metrics_retention: Duration,
    metadata_staleness: Duration,
    running: AtomicBool,
}

/// Clears the in-progress flag when a pass ends, including by panic.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Maintenance {
    pub fn new(
        db: Database,
        sessions: Arc<SessionManager>,
        entries: Arc<EntryStore>,
        metrics: MetricsRecorder,
        metrics_retention: Duration,
        metadata_staleness: Duration,
    ) -> Self {
        Self {
            db,
            sessions,
            entries,
            metrics,
            metrics_retention,
            metadata_staleness,
            running: AtomicBool::new(false),
        }
    }

    /// One full sweep. Steps run independently; failures land in the report.
    #[instrument(skip(self))]
    pub fn perform(&self) -> Result<MaintenanceReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CacheError::MaintenanceInProgress);
        }
        let _guard = RunningGuard(&self.running);

        let mut report = MaintenanceReport::default();
        let now = now_millis();

        report.expired_entries = report.run_step("expire_entries", || {
            self.entries.delete_where("expires_at <= ?1", params![now])
        });
        // Sessions go before the orphan sweep so their entries are purged this pass.
        report.invalid_sessions = self.retire_sessions(&mut report);
        report.orphaned_entries = report.run_step("orphan_entries", || {
            self.entries.delete_where(
                "foundation_session_id IS NOT NULL
                 AND foundation_session_id NOT IN (SELECT id FROM foundation_sessions)",
                &[],
            )
        });
        report.stale_project_metadata = self.sweep_metadata(now, &mut report);
        report.pruned_metrics = report.run_step("prune_metrics", || {
            self.metrics.prune(self.metrics_retention)
        });
        report.compacted_size = report.run_step("compact", || self.db.compact());
        report.evicted_hot_entries = self.entries.sweep_hot(now_millis());

        info!(
            expired = report.expired_entries,
            orphaned = report.orphaned_entries,
            invalid_sessions = report.invalid_sessions,
            stale_metadata = report.stale_project_metadata,
            pruned_metrics = report.pruned_metrics,
            compacted_bytes = report.compacted_size,
            failures = report.failures.len(),
            "cache maintenance complete"
        );
        Ok(report)
    }

    fn retire_sessions(&self, report: &mut MaintenanceReport) -> usize {
        let scanned = match self.sessions.scan_headers() {
            Ok(s) => s,
            Err(e) => {
                report.fail("retire_sessions", &e);
                return 0;
            }
        };
        let mut sessions = Vec::with_capacity(scanned.len());
        for (label, row) in scanned {
            match row {
                Ok(header) => sessions.push(header),
                Err(e) => report.fail_record("retire_sessions", &label, &e),
            }
        }

        let verdicts: Vec<(&SessionHeader, bool)> = sessions
            .par_iter()
            .map(|s| {
                let root = Path::new(&s.project_path);
                let keep = root.is_dir()
                    && fingerprint::compute_project_hash(root) == s.project_hash;
                (s, keep)
            })
            .collect();

        let mut retired = 0;
        for (session, keep) in verdicts {
            let res = if keep {
                self.sessions.mark_validated(&session.id).map(|_| false)
            } else {
                self.sessions.delete(&session.id)
            };
            match res {
                Ok(true) => retired += 1,
                Ok(false) => {}
                Err(e) => report.fail_record("retire_sessions", &session.id, &e),
            }
        }
        retired
    }

    fn sweep_metadata(&self, now: i64, report: &mut MaintenanceReport) -> usize {
        let scanned = match self.sessions.scan_metadata_ages() {
            Ok(s) => s,
            Err(e) => {
                report.fail("stale_metadata", &e);
                return 0;
            }
        };
        let cutoff = now - duration_millis(self.metadata_staleness);
        let mut removed = 0;
        for (label, row) in scanned {
            let (path, last_analyzed) = match row {
                Ok(age) => age,
                Err(e) => {
                    report.fail_record("stale_metadata", &label, &e);
                    continue;
                }
            };
            if Path::new(&path).exists() || last_analyzed >= cutoff {
                continue;
            }
            match self.sessions.delete_metadata(&path) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => report.fail_record("stale_metadata", &path, &e),
            }
        }
        removed
    }

    /// Classify every foundation session without mutating anything.
    /// Unreadable rows are listed in the report, not fatal.
    pub fn validate(&self) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();
        let mut sessions = Vec::new();
        for (label, row) in self.sessions.scan_headers()? {
            match row {
                Ok(header) => sessions.push(header),
                Err(e) => {
                    warn!(record = %label, error = %e, "validation skipped an unreadable session");
                    report.unreadable.push(label);
                }
            }
        }

        let checks: Vec<SessionValidation> = sessions
            .par_iter()
            .map(|s| self.classify(s))
            .collect();
        for check in checks {
            report.push(check);
        }
        Ok(report)
    }

    fn classify(&self, session: &SessionHeader) -> SessionValidation {
        let root = Path::new(&session.project_path);
        let (status, current_hash) = if !root.is_dir() {
            (SessionHealth::Missing, None)
        } else {
            let hash = fingerprint::compute_project_hash(root);
            let status = if hash != session.project_hash {
                SessionHealth::Invalid
            } else if self.sessions.is_fresh(session.last_validated) {
                SessionHealth::Valid
            } else {
                SessionHealth::Stale
            };
            (status, Some(hash))
        };
        SessionValidation {
            session_id: session.id.clone(),
            project_path: session.project_path.clone(),
            status,
            current_hash,
        }
    }

    pub fn invalidate(&self, criteria: &InvalidationCriteria) -> Result<usize> {
        if criteria.is_empty() {
            return Err(CacheError::InvalidInvocation(
                "invalidate_cache requires at least one criterion".into(),
            ));
        }
        let (clause, args) = criteria.to_sql();
        let refs: Vec<&dyn ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let removed = self.entries.delete_where(&clause, &refs)?;
        info!(removed, "cache entries invalidated");
        Ok(removed)
    }

    #[instrument(skip(self), fields(project = %project_path.display()))]
    pub fn invalidate_project(&self, project_path: &Path) -> Result<ProjectInvalidation> {
        let root = fingerprint::canonicalize_lossy(project_path);
        let mut out = ProjectInvalidation::default();

        for id in self.sessions.ids_for_path(&root)? {
            out.entries += self.entries.delete_where(
                "foundation_session_id = ?1 OR session_id = ?1",
                params![id],
            )?;
            if self.sessions.delete(&id)? {
                out.sessions += 1;
            }
        }
        out.metadata_removed = self
            .sessions
            .delete_metadata(&root.to_string_lossy())?;

        info!(
            entries = out.entries,
            sessions = out.sessions,
            "project cache invalidated"
        );
        Ok(out)
    }

    #[cfg(test)]
    fn force_running(&self) {
        self.running.store(true, Ordering::Release);
    }
}
