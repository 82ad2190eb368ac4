use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DB_PATH_ENV: &str = "FOUNDATION_CACHE_DB_PATH";

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Analysis cache configuration. Every field is optional in the TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Hot-cache entry ceiling (default: 10000).
    #[serde(default = "CacheConfig::default_max_cache_size")]
    pub max_cache_size: usize,
    /// Entry lifetime in hours; 0 expires entries immediately (default: 168).
    #[serde(default = "CacheConfig::default_ttl_hours")]
    pub default_ttl_hours: u64,
    /// Maintenance sweep cadence (default: 6).
    #[serde(default = "CacheConfig::default_cleanup_interval_hours")]
    pub cleanup_interval_hours: u64,
    /// Hot-cache memory budget (default: 100).
    #[serde(default = "CacheConfig::default_memory_limit_mb")]
    pub memory_limit_mb: u64,
    #[serde(default = "bool_true")]
    pub enable_metrics: bool,
    /// Create foundation sessions from a file path when no session id is given.
    #[serde(default = "bool_true")]
    pub auto_foundation_sessions: bool,
    /// Freshness window before a session's project hash is recomputed (default: 24).
    #[serde(default = "CacheConfig::default_project_hash_validity_hours")]
    pub project_hash_validity_hours: u64,
    /// Cadence of the read-only validation sweep (default: 24).
    #[serde(default = "CacheConfig::default_validation_interval_hours")]
    pub validation_interval_hours: u64,
    #[serde(default = "CacheConfig::default_metrics_retention_days")]
    pub metrics_retention_days: u64,
    /// Metadata rows for vanished projects survive this long (default: 7).
    #[serde(default = "CacheConfig::default_metadata_stale_days")]
    pub metadata_stale_days: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
}

fn bool_true() -> bool {
    true
}

impl CacheConfig {
    fn default_max_cache_size() -> usize {
        10_000
    }
    fn default_ttl_hours() -> u64 {
        168
    }
    fn default_cleanup_interval_hours() -> u64 {
        6
    }
    fn default_memory_limit_mb() -> u64 {
        100
    }
    fn default_project_hash_validity_hours() -> u64 {
        24
    }
    fn default_validation_interval_hours() -> u64 {
        24
    }
    fn default_metrics_retention_days() -> u64 {
        30
    }
    fn default_metadata_stale_days() -> u64 {
        7
    }

    pub fn ttl(&self) -> Duration {
        hours(self.default_ttl_hours)
    }

    pub fn cleanup_interval(&self) -> Duration {
        hours(self.cleanup_interval_hours)
    }

    pub fn validation_interval(&self) -> Duration {
        hours(self.validation_interval_hours)
    }

    pub fn project_hash_validity(&self) -> Duration {
        hours(self.project_hash_validity_hours)
    }

    pub fn metrics_retention(&self) -> Duration {
        hours(self.metrics_retention_days * 24)
    }

    pub fn metadata_staleness(&self) -> Duration {
        hours(self.metadata_stale_days * 24)
    }

    pub fn memory_limit_bytes(&self) -> usize {
        (self.memory_limit_mb as usize).saturating_mul(1024 * 1024)
    }

    /// Priority: explicit `db_path` > FOUNDATION_CACHE_DB_PATH > default location.
    pub fn resolve_db_path(&self) -> PathBuf {
        if let Some(path) = &self.db_path {
            return path.clone();
        }
        if let Ok(p) = std::env::var(DB_PATH_ENV) {
            return PathBuf::from(p);
        }
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("foundation-cache")
            .join("cache.db")
    }
}

fn hours(h: u64) -> Duration {
    Duration::from_secs(h.saturating_mul(3600))
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_size: Self::default_max_cache_size(),
            default_ttl_hours: Self::default_ttl_hours(),
            cleanup_interval_hours: Self::default_cleanup_interval_hours(),
            memory_limit_mb: Self::default_memory_limit_mb(),
            enable_metrics: true,
            auto_foundation_sessions: true,
            project_hash_validity_hours: Self::default_project_hash_validity_hours(),
            validation_interval_hours: Self::default_validation_interval_hours(),
            metrics_retention_days: Self::default_metrics_retention_days(),
            metadata_stale_days: Self::default_metadata_stale_days(),
            db_path: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = get_config_path();

        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            Self::from_toml(&content)
        } else {
            Ok(Config::default())
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse cache config")
    }

    pub fn save(&self) -> Result<()> {
        let path = get_config_path();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }
}

fn get_config_path() -> PathBuf {
    let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    config_dir.join("foundation-cache").join("config.toml")
}
