//! Append-only metric event log and the statistics derived from it.

use rusqlite::params;
use serde::Serialize;
use std::time::Duration;
use tracing::warn;

use crate::error::Result;
use crate::store::{duration_millis, now_millis, Database};

pub const CACHE_HIT: &str = "cache_hit";
pub const CACHE_MISS: &str = "cache_miss";
pub const CACHE_STORE: &str = "cache_store";
pub const FOUNDATION_VALIDATION: &str = "foundation_validation";

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const TOP_TEMPLATES: i64 = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateUsage {
    pub template_id: String,
    pub hits: u64,
    pub tokens_saved: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStatistics {
    pub total_entries: u64,
    pub total_foundation_sessions: u64,
    pub total_derived_sessions: u64,
    /// Sum of `tokens_saved * access_count` across entries.
    pub total_tokens_saved: u64,
    /// Hits / (hits + misses) over the trailing 7 days, in [0, 1].
    pub hit_rate: f64,
    pub average_tokens_saved_per_hit: f64,
    pub hits_last_24h: u64,
    pub misses_last_24h: u64,
    pub top_templates: Vec<TemplateUsage>,
    /// Last-24h hit rate.
    pub cache_efficiency: f64,
}

#[derive(Clone)]
pub(crate) struct MetricsRecorder {
    db: Database,
    enabled: bool,
}

impl MetricsRecorder {
    pub fn new(db: Database, enabled: bool) -> Self {
        Self { db, enabled }
    }

    /// Append one event. Failures are logged and swallowed.
    pub fn record(&self, metric_type: &str, metric_key: &str, value: f64) {
        if !self.enabled {
            return;
        }
        let res = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cache_metrics (metric_type, metric_key, value, timestamp)
                 VALUES (?1, ?2, ?3, ?4)",
                params![metric_type, metric_key, value, now_millis()],
            )?;
            Ok(())
        });
        if let Err(e) = res {
            warn!(metric_type, metric_key, error = %e, "failed to record cache metric");
        }
    }

    /// Delete events older than `retention`. Returns the number pruned.
    pub fn prune(&self, retention: Duration) -> Result<usize> {
        let cutoff = now_millis() - duration_millis(retention);
        self.db.with_conn_retry(|conn| {
            Ok(conn.execute(
                "DELETE FROM cache_metrics WHERE timestamp < ?1",
                params![cutoff],
            )?)
        })
    }

    pub fn statistics(&self) -> Result<CacheStatistics> {
        let now = now_millis();
        let week_ago = now - duration_millis(DAY * 7);
        let day_ago = now - duration_millis(DAY);

        self.db.with_conn(|conn| {
            let total_entries: i64 =
                conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |r| r.get(0))?;
            let total_foundation_sessions: i64 =
                conn.query_row("SELECT COUNT(*) FROM foundation_sessions", [], |r| r.get(0))?;
            let total_derived_sessions: i64 = conn.query_row(
                "SELECT COALESCE(SUM(json_array_length(derived_sessions)), 0)
                 FROM foundation_sessions",
                [],
                |r| r.get(0),
            )?;
            let total_tokens_saved: i64 = conn.query_row(
                "SELECT COALESCE(SUM(tokens_saved * access_count), 0) FROM cache_entries",
                [],
                |r| r.get(0),
            )?;

            let window = |since: i64| -> rusqlite::Result<(i64, i64, f64)> {
                conn.query_row(
                    "SELECT
                        COALESCE(SUM(CASE WHEN metric_type = ?1 THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN metric_type = ?2 THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN metric_type = ?1 THEN value ELSE 0 END), 0.0)
                     FROM cache_metrics
                     WHERE timestamp >= ?3 AND metric_type IN (?1, ?2)",
                    params![CACHE_HIT, CACHE_MISS, since],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
            };
            let (week_hits, week_misses, week_saved) = window(week_ago)?;
            let (day_hits, day_misses, _) = window(day_ago)?;

            let mut stmt = conn.prepare(
                "SELECT template_id,
                        SUM(access_count) AS hits,
                        SUM(tokens_saved * access_count) AS saved
                 FROM cache_entries
                 GROUP BY template_id
                 HAVING hits > 0
                 ORDER BY hits DESC, saved DESC, template_id ASC
                 LIMIT ?1",
            )?;
            let top_templates = stmt
                .query_map(params![TOP_TEMPLATES], |r| {
                    Ok(TemplateUsage {
                        template_id: r.get(0)?,
                        hits: non_negative(r.get(1)?),
                        tokens_saved: non_negative(r.get(2)?),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(CacheStatistics {
                total_entries: non_negative(total_entries),
                total_foundation_sessions: non_negative(total_foundation_sessions),
                total_derived_sessions: non_negative(total_derived_sessions),
                total_tokens_saved: non_negative(total_tokens_saved),
                hit_rate: ratio(week_hits, week_hits + week_misses),
                average_tokens_saved_per_hit: if week_hits > 0 {
                    (week_saved / week_hits as f64).max(0.0)
                } else {
                    0.0
                },
                hits_last_24h: non_negative(day_hits),
                misses_last_24h: non_negative(day_misses),
                top_templates,
                cache_efficiency: ratio(day_hits, day_hits + day_misses),
            })
        })
    }
}

fn non_negative(v: i64) -> u64 {
    v.max(0) as u64
}

fn ratio(num: i64, den: i64) -> f64 {
    if den <= 0 {
        return 0.0;
    }
    (num as f64 / den as f64).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> MetricsRecorder {
        MetricsRecorder::new(Database::in_memory().unwrap(), true)
    }

    #[test]
    fn empty_store_reports_zeros() {
        let stats = recorder().statistics().unwrap();
        assert_eq!(stats.total_entries, 0);
        assert_eq!(stats.total_tokens_saved, 0);
        assert_eq!(stats.hit_rate, 0.0);
        assert_eq!(stats.cache_efficiency, 0.0);
        assert_eq!(stats.average_tokens_saved_per_hit, 0.0);
        assert!(stats.top_templates.is_empty());
    }

    #[test]
    fn hit_rate_from_event_log() {
        let m = recorder();
        m.record(CACHE_HIT, "memory", 100.0);
        m.record(CACHE_HIT, "persistent", 50.0);
        m.record(CACHE_MISS, "symbols", 0.0);
        m.record(CACHE_STORE, "symbols", 10.0);
        let stats = m.statistics().unwrap();
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.hits_last_24h, 2);
        assert_eq!(stats.misses_last_24h, 1);
        assert!((stats.average_tokens_saved_per_hit - 75.0).abs() < 1e-9);
        assert_eq!(stats.cache_efficiency, stats.hit_rate);
    }

    #[test]
    fn disabled_recorder_writes_nothing() {
        let db = Database::in_memory().unwrap();
        let m = MetricsRecorder::new(db.clone(), false);
        m.record(CACHE_HIT, "memory", 1.0);
        let count: i64 = db
            .with_conn(|c| Ok(c.query_row("SELECT COUNT(*) FROM cache_metrics", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn prune_removes_only_old_events() {
        let db = Database::in_memory().unwrap();
        let m = MetricsRecorder::new(db.clone(), true);
        m.record(CACHE_HIT, "memory", 1.0);
        db.with_conn(|c| {
            c.execute(
                "INSERT INTO cache_metrics (metric_type, metric_key, value, timestamp)
                 VALUES ('cache_hit', 'memory', 1.0, 0)",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        assert_eq!(m.prune(Duration::from_secs(3600)).unwrap(), 1);
        assert_eq!(m.prune(Duration::from_secs(3600)).unwrap(), 0);
    }

    #[test]
    fn ratio_is_bounded() {
        assert_eq!(ratio(0, 0), 0.0);
        assert_eq!(ratio(5, 5), 1.0);
        assert_eq!(ratio(-1, 2), 0.0);
    }
}
