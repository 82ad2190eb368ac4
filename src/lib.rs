//! Project-scoped, content-addressable cache for analysis results.
//!
//! Results are keyed by `(content hash, template id, session)`. Sessions can be
//! *foundation* sessions, bound to one fingerprinted state of a project, or
//! *derived* sessions that read through to a foundation's entries. A pair of
//! background timers sweeps expired/orphaned state and validates sessions.
//!
//! ```no_run
//! use foundation_cache::{AnalysisCache, AnalysisKey, CacheConfig};
//! use std::path::Path;
//!
//! let cache = AnalysisCache::open(CacheConfig::default())?;
//! let key = AnalysisKey::new(Path::new("src/lib.rs"), "fn main() {}", "symbols");
//! if cache.get_cached_analysis(&key)?.is_none() {
//!     cache.cache_analysis_result(&key, &serde_json::json!(["main"]), 120)?;
//! }
//! cache.close();
//! # Ok::<(), foundation_cache::CacheError>(())
//! ```

pub mod config;
mod entries;
mod error;
mod estimate;
pub mod fingerprint;
mod hot_cache;
mod maintenance;
pub mod manifest;
mod metrics;
mod scheduler;
mod sessions;
mod store;

pub use config::{CacheConfig, Config};
pub use entries::{content_hash, AnalysisKey, CacheEntry, SessionRef};
pub use error::{CacheError, Result};
pub use estimate::{CharRatioEstimator, TokenEstimator};
pub use fingerprint::{
    compute_file_hashes, compute_fingerprint, compute_project_hash, empty_input_hash,
    find_project_root, KeyFileInfo, ProjectFingerprint,
};
pub use maintenance::{
    InvalidationCriteria, MaintenanceReport, ProjectInvalidation, SessionHealth,
    SessionValidation, StepFailure, ValidationReport,
};
pub use metrics::{CacheStatistics, TemplateUsage};
pub use sessions::{default_base_context, FoundationSession, ProjectMetadata};
pub use store::Database;

use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use entries::EntryStore;
use hot_cache::HotCache;
use maintenance::Maintenance;
use metrics::{MetricsRecorder, FOUNDATION_VALIDATION};
use scheduler::{Scheduler, Task};
use sessions::SessionManager;

/// Shared state behind the facade and the background timers.
struct Engine {
    config: CacheConfig,
    db: Database,
    sessions: Arc<SessionManager>,
    entries: Arc<EntryStore>,
    metrics: MetricsRecorder,
    maintenance: Maintenance,
}

impl Engine {
    fn new(config: CacheConfig, db: Database, estimator: Arc<dyn TokenEstimator>) -> Self {
        let sessions = Arc::new(SessionManager::new(
            db.clone(),
            config.project_hash_validity(),
        ));
        let metrics = MetricsRecorder::new(db.clone(), config.enable_metrics);
        let entries = Arc::new(EntryStore::new(
            db.clone(),
            HotCache::new(config.max_cache_size, config.memory_limit_bytes()),
            Arc::clone(&sessions),
            metrics.clone(),
            estimator,
            config.ttl(),
            config.auto_foundation_sessions,
        ));
        let maintenance = Maintenance::new(
            db.clone(),
            Arc::clone(&sessions),
            Arc::clone(&entries),
            metrics.clone(),
            config.metrics_retention(),
            config.metadata_staleness(),
        );
        Self {
            config,
            db,
            sessions,
            entries,
            metrics,
            maintenance,
        }
    }

    fn maintenance_tick(&self) {
        match self.maintenance.perform() {
            Ok(_) => {}
            Err(CacheError::MaintenanceInProgress) => {
                debug!("scheduled maintenance skipped, previous pass still running")
            }
            Err(e) => warn!(error = %e, "scheduled maintenance failed"),
        }
    }

    fn validation_tick(&self) {
        let report = match self.maintenance.validate() {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "scheduled session validation failed");
                return;
            }
        };
        for (status, count) in [
            (SessionHealth::Valid, report.valid),
            (SessionHealth::Stale, report.stale),
            (SessionHealth::Invalid, report.invalid),
            (SessionHealth::Missing, report.missing),
        ] {
            self.metrics
                .record(FOUNDATION_VALIDATION, status.as_str(), count as f64);
        }
        info!(
            valid = report.valid,
            stale = report.stale,
            invalid = report.invalid,
            missing = report.missing,
            unreadable = report.unreadable.len(),
            "foundation sessions validated"
        );
    }
}

/// The cache facade. Dropping it performs the same shutdown as [`close`](Self::close).
pub struct AnalysisCache {
    engine: Arc<Engine>,
    scheduler: Option<Scheduler>,
    closed: bool,
}

impl AnalysisCache {
    /// Open the store at the configured location and start the background timers.
    pub fn open(config: CacheConfig) -> Result<Self> {
        Self::with_estimator(config, CharRatioEstimator::default())
    }

    /// Like [`open`](Self::open) with a custom token-savings model.
    pub fn with_estimator(
        config: CacheConfig,
        estimator: impl TokenEstimator + 'static,
    ) -> Result<Self> {
        let db = Database::open(&config.resolve_db_path())?;
        Self::from_parts(config, db, Arc::new(estimator))
    }

    /// Throwaway cache backed by an in-memory store.
    pub fn in_memory(config: CacheConfig) -> Result<Self> {
        Self::from_parts(
            config,
            Database::in_memory()?,
            Arc::new(CharRatioEstimator::default()),
        )
    }

    pub fn from_parts(
        config: CacheConfig,
        db: Database,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Result<Self> {
        let engine = Arc::new(Engine::new(config, db, estimator));

        let maint = Arc::clone(&engine);
        let valid = Arc::clone(&engine);
        let scheduler = Scheduler::start(vec![
            Task::new(
                "maintenance",
                engine.config.cleanup_interval(),
                move || maint.maintenance_tick(),
            ),
            Task::new(
                "validation",
                engine.config.validation_interval(),
                move || valid.validation_tick(),
            ),
        ])?;

        info!(db = %engine.db.path().display(), "analysis cache ready");
        Ok(Self {
            engine,
            scheduler: Some(scheduler),
            closed: false,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.engine.config
    }

    /// Direct handle to the backing store.
    pub fn database(&self) -> &Database {
        &self.engine.db
    }

    // ── Foundation sessions ─────────────────────────────────────────────────

    /// Most recently used valid session for the project's current state,
    /// created on first sight.
    pub fn get_or_create_foundation_session(
        &self,
        project_path: impl AsRef<Path>,
        base_context: Option<&str>,
    ) -> Result<String> {
        self.engine
            .sessions
            .get_or_create(project_path.as_ref(), base_context)
    }

    /// Create a session for exactly this path, skipping the reuse lookup.
    pub fn create_foundation_session(
        &self,
        project_path: impl AsRef<Path>,
        base_context: Option<&str>,
    ) -> Result<String> {
        self.engine.sessions.create(project_path.as_ref(), base_context)
    }

    pub fn derive_session_from_foundation(
        &self,
        foundation_id: &str,
        derived_id: &str,
    ) -> Result<bool> {
        self.engine.sessions.derive(foundation_id, derived_id)
    }

    pub fn find_foundation_session_id(&self, session_id: &str) -> Result<Option<String>> {
        self.engine.sessions.find_foundation_id(session_id)
    }

    pub fn is_foundation_session_valid(
        &self,
        session_id: &str,
        project_path: impl AsRef<Path>,
    ) -> Result<bool> {
        self.engine
            .sessions
            .is_valid(session_id, project_path.as_ref())
    }

    pub fn get_foundation_session(&self, session_id: &str) -> Result<Option<FoundationSession>> {
        self.engine.sessions.get(session_id)
    }

    pub fn list_foundation_sessions(&self) -> Result<Vec<FoundationSession>> {
        self.engine.sessions.list()
    }

    pub fn project_metadata(&self, project_path: impl AsRef<Path>) -> Result<Option<ProjectMetadata>> {
        let root = fingerprint::canonicalize_lossy(project_path.as_ref());
        self.engine.sessions.get_metadata(&root)
    }

    // ── Entries ─────────────────────────────────────────────────────────────

    /// Cached result for this key, or None on a miss.
    pub fn get_cached_analysis(&self, key: &AnalysisKey<'_>) -> Result<Option<Value>> {
        self.engine.entries.get(key)
    }

    /// Store `result` for this key. Returns the new entry id.
    pub fn cache_analysis_result(
        &self,
        key: &AnalysisKey<'_>,
        result: &Value,
        tokens_used: u64,
    ) -> Result<String> {
        self.engine.entries.put(key, result, tokens_used)
    }

    pub fn cache_entry(&self, entry_id: &str) -> Result<Option<CacheEntry>> {
        self.engine.entries.get_by_id(entry_id)
    }

    // ── Maintenance ─────────────────────────────────────────────────────────

    pub fn get_cache_statistics(&self) -> Result<CacheStatistics> {
        self.engine.metrics.statistics()
    }

    /// Run a sweep now. Fails with [`CacheError::MaintenanceInProgress`] if
    /// another pass (scheduled or manual) is running.
    pub fn perform_maintenance(&self) -> Result<MaintenanceReport> {
        self.engine.maintenance.perform()
    }

    pub fn validate_foundation_sessions(&self) -> Result<ValidationReport> {
        self.engine.maintenance.validate()
    }

    pub fn invalidate_cache(&self, criteria: &InvalidationCriteria) -> Result<usize> {
        self.engine.maintenance.invalidate(criteria)
    }

    pub fn invalidate_project_cache(
        &self,
        project_path: impl AsRef<Path>,
    ) -> Result<ProjectInvalidation> {
        self.engine
            .maintenance
            .invalidate_project(project_path.as_ref())
    }

    /// Stop the timers, clear the hot tier and release the store.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.stop();
        }
        self.engine.entries.clear_hot();
        info!("analysis cache closed");
    }
}

impl Drop for AnalysisCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}
