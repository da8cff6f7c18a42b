//! Alert engine statistics, caching, aggregation and DB sync
//!
//! The aggregation map is process-global: alerts sharing `(rule, level)`
//! within the window collapse into one counted record. It is built lazily
//! and cleaned of entries idle for over an hour on every engine tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::SqlitePool;

use crate::alerts::Alert;
use crate::error::Result;

/// Aggregation entries idle longer than this are dropped
const AGGREGATION_IDLE: i64 = 3600;

/// An alert collapsed with its repeats
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedAlert {
    #[serde(flatten)]
    pub alert: Alert,
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

static AGGREGATIONS: LazyLock<Mutex<HashMap<String, AggregatedAlert>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn aggregation_key(alert: &Alert) -> String {
    format!("{}:{}", alert.rule, alert.level)
}

/// Fold an alert into the aggregation map; returns the updated record
pub fn aggregate_alert(alert: &Alert) -> AggregatedAlert {
    let mut map = AGGREGATIONS.lock().unwrap();
    let key = aggregation_key(alert);

    match map.get_mut(&key) {
        Some(existing) => {
            existing.count += 1;
            existing.last_seen = alert.timestamp;
            existing.alert.message = alert.message.clone();
            existing.clone()
        }
        None => {
            let agg = AggregatedAlert {
                alert: alert.clone(),
                count: 1,
                first_seen: alert.timestamp,
                last_seen: alert.timestamp,
            };
            map.insert(key, agg.clone());
            agg
        }
    }
}

/// Drop aggregations idle for over an hour
pub fn clean_old_aggregations() {
    let cutoff = Utc::now() - Duration::seconds(AGGREGATION_IDLE);
    AGGREGATIONS.lock().unwrap().retain(|_, agg| agg.last_seen > cutoff);
}

/// Current aggregation snapshot
pub fn aggregated_alerts() -> Vec<AggregatedAlert> {
    AGGREGATIONS.lock().unwrap().values().cloned().collect()
}

#[cfg(test)]
pub(crate) fn reset_aggregations() {
    AGGREGATIONS.lock().unwrap().clear();
}

#[derive(Debug, Default, Clone)]
struct RuleStatsInner {
    total_fired: i64,
    last_fired_at: Option<DateTime<Utc>>,
    total_checks: i64,
    avg_check_duration: StdDuration,
}

/// Engine-wide and per-rule counters
#[derive(Debug, Default)]
pub struct EngineStats {
    total_checks: AtomicI64,
    total_fired: AtomicI64,
    notify_success: AtomicI64,
    notify_failed: AtomicI64,
    per_rule: Mutex<HashMap<String, RuleStatsInner>>,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_check(&self, rule_id: &str, duration: StdDuration) {
        self.total_checks.fetch_add(1, Ordering::Relaxed);
        let mut per_rule = self.per_rule.lock().unwrap();
        let stats = per_rule.entry(rule_id.to_string()).or_default();
        stats.total_checks += 1;
        // Running average, same smoothing as a two-point moving mean
        stats.avg_check_duration = if stats.avg_check_duration.is_zero() {
            duration
        } else {
            (stats.avg_check_duration + duration) / 2
        };
    }

    pub fn record_fire(&self, rule_id: &str) {
        self.total_fired.fetch_add(1, Ordering::Relaxed);
        let mut per_rule = self.per_rule.lock().unwrap();
        let stats = per_rule.entry(rule_id.to_string()).or_default();
        stats.total_fired += 1;
        stats.last_fired_at = Some(Utc::now());
    }

    pub fn record_notify(&self, success: bool) {
        if success {
            self.notify_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.notify_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Fired count for one rule
    pub fn rule_fired(&self, rule_id: &str) -> i64 {
        self.per_rule
            .lock()
            .unwrap()
            .get(rule_id)
            .map(|s| s.total_fired)
            .unwrap_or(0)
    }

    /// Serializable per-rule stats
    pub fn rule_snapshot(&self, rule_id: &str) -> Value {
        let per_rule = self.per_rule.lock().unwrap();
        let stats = per_rule.get(rule_id).cloned().unwrap_or_default();
        json!({
            "total_fired": stats.total_fired,
            "last_fired_at": stats.last_fired_at.map(|t| t.to_rfc3339()),
            "total_checks": stats.total_checks,
            "avg_check_duration_ms": stats.avg_check_duration.as_secs_f64() * 1000.0,
        })
    }

    /// Serializable engine-wide stats
    pub fn snapshot(&self) -> Value {
        let per_rule = self.per_rule.lock().unwrap();
        let rules: HashMap<&String, Value> = per_rule
            .iter()
            .map(|(id, stats)| {
                (
                    id,
                    json!({
                        "total_fired": stats.total_fired,
                        "last_fired_at": stats.last_fired_at.map(|t| t.to_rfc3339()),
                        "total_checks": stats.total_checks,
                        "avg_check_duration_ms": stats.avg_check_duration.as_secs_f64() * 1000.0,
                    }),
                )
            })
            .collect();

        json!({
            "total_checks": self.total_checks.load(Ordering::Relaxed),
            "total_fired": self.total_fired.load(Ordering::Relaxed),
            "notify_success": self.notify_success.load(Ordering::Relaxed),
            "notify_failed": self.notify_failed.load(Ordering::Relaxed),
            "rule_stats": rules,
        })
    }
}

/// 30-second cache over the stats snapshot, invalidated on every fire
#[derive(Debug)]
pub struct StatsCache {
    inner: Mutex<Option<(Value, DateTime<Utc>)>>,
    ttl: Duration,
    invalidations: AtomicI64,
}

impl StatsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(None),
            ttl,
            invalidations: AtomicI64::new(0),
        }
    }

    pub fn get(&self) -> Option<Value> {
        let inner = self.inner.lock().unwrap();
        match inner.as_ref() {
            Some((value, stored_at)) if Utc::now() - *stored_at < self.ttl => Some(value.clone()),
            _ => None,
        }
    }

    pub fn put(&self, value: Value) {
        *self.inner.lock().unwrap() = Some((value, Utc::now()));
    }

    pub fn invalidate(&self) {
        *self.inner.lock().unwrap() = None;
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invalidations(&self) -> i64 {
        self.invalidations.load(Ordering::Relaxed)
    }
}

/// Accumulates check/notify deltas and flushes them into the `alert_stats`
/// singleton row
pub struct AlertStatsSync {
    stats: Arc<EngineStats>,
    pending: Mutex<PendingDeltas>,
    pool: Mutex<Option<SqlitePool>>,
}

#[derive(Debug, Default)]
struct PendingDeltas {
    checks: i64,
    notify_success: i64,
    notify_failed: i64,
}

impl AlertStatsSync {
    pub fn new(stats: Arc<EngineStats>) -> Self {
        Self {
            stats,
            pending: Mutex::new(PendingDeltas::default()),
            pool: Mutex::new(None),
        }
    }

    /// Attach the database; sync is a no-op without it
    pub fn attach_pool(&self, pool: SqlitePool) {
        *self.pool.lock().unwrap() = Some(pool);
    }

    pub fn record_check(&self) {
        self.pending.lock().unwrap().checks += 1;
    }

    pub fn record_notify(&self, success: bool) {
        let mut pending = self.pending.lock().unwrap();
        if success {
            pending.notify_success += 1;
        } else {
            pending.notify_failed += 1;
        }
    }

    /// Push accumulated deltas into the singleton row
    pub async fn flush(&self) -> Result<()> {
        let Some(pool) = self.pool.lock().unwrap().clone() else {
            return Ok(());
        };

        let deltas = {
            let mut pending = self.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        if deltas.checks == 0 && deltas.notify_success == 0 && deltas.notify_failed == 0 {
            return Ok(());
        }

        sqlx::query(
            "UPDATE alert_stats SET
                total_checks = total_checks + ?1,
                notify_success = notify_success + ?2,
                notify_failed = notify_failed + ?3
             WHERE id = 1",
        )
        .bind(deltas.checks)
        .bind(deltas.notify_success)
        .bind(deltas.notify_failed)
        .execute(&pool)
        .await?;
        Ok(())
    }

    /// Restore lifetime totals into the live counters at startup
    pub async fn load(&self) -> Result<()> {
        let Some(pool) = self.pool.lock().unwrap().clone() else {
            return Ok(());
        };

        let row: (i64, i64, i64) = sqlx::query_as(
            "SELECT total_checks, notify_success, notify_failed FROM alert_stats WHERE id = 1",
        )
        .fetch_one(&pool)
        .await?;

        self.stats.total_checks.store(row.0, Ordering::Relaxed);
        self.stats.notify_success.store(row.1, Ordering::Relaxed);
        self.stats.notify_failed.store(row.2, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertLevel;
    use serde_json::Map;

    fn alert(rule: &str, level: AlertLevel) -> Alert {
        Alert {
            id: format!("{rule}_test"),
            level,
            rule: rule.to_string(),
            message: "m".to_string(),
            timestamp: Utc::now(),
            metadata: Map::new(),
        }
    }

    #[test]
    fn test_aggregation_counts_same_rule_level() {
        reset_aggregations();
        let first = aggregate_alert(&alert("agg_rule_a", AlertLevel::Warning));
        assert_eq!(first.count, 1);

        let second = aggregate_alert(&alert("agg_rule_a", AlertLevel::Warning));
        assert_eq!(second.count, 2);
        assert!(second.last_seen >= first.last_seen);

        // Different level aggregates separately
        let other = aggregate_alert(&alert("agg_rule_a", AlertLevel::Error));
        assert_eq!(other.count, 1);
    }

    #[test]
    fn test_engine_stats_rule_counters() {
        let stats = EngineStats::new();
        stats.record_check("r1", StdDuration::from_millis(4));
        stats.record_check("r1", StdDuration::from_millis(8));
        stats.record_fire("r1");

        assert_eq!(stats.rule_fired("r1"), 1);
        let snap = stats.rule_snapshot("r1");
        assert_eq!(snap["total_checks"], 2);
        assert_eq!(snap["total_fired"], 1);
        assert!(snap["avg_check_duration_ms"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn test_stats_cache_ttl_and_invalidation() {
        let cache = StatsCache::new(Duration::seconds(30));
        assert!(cache.get().is_none());

        cache.put(json!({"x": 1}));
        assert_eq!(cache.get().unwrap()["x"], 1);

        cache.invalidate();
        assert!(cache.get().is_none());
        assert_eq!(cache.invalidations(), 1);
    }
}
