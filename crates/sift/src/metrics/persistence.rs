//! Metrics persistence side-car
//!
//! Periodically mirrors the in-memory collector into SQLite: a singleton
//! cumulative row plus an append-only time-series table. Only points newer
//! than the last flush are inserted, and queue-length samples are skipped
//! when the value has not changed. A daily cleanup drops rows past the
//! retention window.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};
use tokio::sync::{watch, Mutex};
use tracing::{error, info};

use crate::error::Result;
use crate::metrics::{MetricsCollector, MetricsSnapshot, TimeSeriesPoint};

/// Create every relational table the service uses and seed singleton rows.
/// Idempotent; runs at startup.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            created_at TIMESTAMP NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS end_users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_identifier TEXT NOT NULL UNIQUE,
            last_active TIMESTAMP NOT NULL,
            created_at TIMESTAMP NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS alerts (
            id TEXT PRIMARY KEY,
            level TEXT NOT NULL,
            rule TEXT NOT NULL,
            message TEXT NOT NULL,
            timestamp TIMESTAMP NOT NULL,
            metadata TEXT
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_alerts_time ON alerts (timestamp)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS alert_rule_configs (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            enabled INTEGER NOT NULL DEFAULT 1,
            cooldown_seconds INTEGER NOT NULL DEFAULT 600,
            config_json TEXT NOT NULL DEFAULT '',
            updated_at TIMESTAMP NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS alert_stats (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            total_checks INTEGER NOT NULL DEFAULT 0,
            notify_success INTEGER NOT NULL DEFAULT 0,
            notify_failed INTEGER NOT NULL DEFAULT 0
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("INSERT OR IGNORE INTO alert_stats (id) VALUES (1)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS metrics_cumulative (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            total_promotions INTEGER NOT NULL DEFAULT 0,
            total_rejections INTEGER NOT NULL DEFAULT 0,
            total_forgotten INTEGER NOT NULL DEFAULT 0,
            cache_hits INTEGER NOT NULL DEFAULT 0,
            cache_misses INTEGER NOT NULL DEFAULT 0
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("INSERT OR IGNORE INTO metrics_cumulative (id) VALUES (1)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS metrics_timeseries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            metric_type TEXT NOT NULL,
            value REAL NOT NULL,
            category TEXT,
            timestamp TIMESTAMP NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_type_time ON metrics_timeseries (metric_type, timestamp)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Periodic flush of the collector into SQLite
pub struct MetricsPersistence {
    pool: SqlitePool,
    persist_interval: Duration,
    memory_retention: Duration,
    state: Mutex<FlushState>,
}

struct FlushState {
    last_persisted: DateTime<Utc>,
    // Queue samples are only written when the value changed
    last_queue_value: f64,
}

impl MetricsPersistence {
    pub fn new(pool: SqlitePool, persist_interval_minutes: i64, memory_retention_hours: i64) -> Self {
        Self {
            pool,
            persist_interval: Duration::minutes(persist_interval_minutes.max(1)),
            memory_retention: Duration::hours(memory_retention_hours.max(1)),
            state: Mutex::new(FlushState {
                last_persisted: DateTime::<Utc>::MIN_UTC,
                last_queue_value: -1.0,
            }),
        }
    }

    /// Flush counters and new time-series points
    pub async fn persist(&self, collector: &MetricsCollector) -> Result<()> {
        let mut state = self.state.lock().await;

        let snapshot = collector.snapshot();
        sqlx::query(
            "UPDATE metrics_cumulative SET
                total_promotions = ?1, total_rejections = ?2, total_forgotten = ?3,
                cache_hits = ?4, cache_misses = ?5
             WHERE id = 1",
        )
        .bind(snapshot.total_promotions)
        .bind(snapshot.total_rejections)
        .bind(snapshot.total_forgotten)
        .bind(snapshot.cache_hits)
        .bind(snapshot.cache_misses)
        .execute(&self.pool)
        .await?;

        let (promotions, queues) = collector.points_after(state.last_persisted);
        let mut max_time = state.last_persisted;

        let mut tx = self.pool.begin().await?;
        for point in &promotions {
            sqlx::query(
                "INSERT INTO metrics_timeseries (metric_type, value, category, timestamp)
                 VALUES ('promotion', ?1, ?2, ?3)",
            )
            .bind(point.value)
            .bind(point.label.as_deref())
            .bind(point.timestamp)
            .execute(&mut *tx)
            .await?;
            max_time = max_time.max(point.timestamp);
        }
        for point in &queues {
            if point.value != state.last_queue_value {
                sqlx::query(
                    "INSERT INTO metrics_timeseries (metric_type, value, category, timestamp)
                     VALUES ('queue_length', ?1, NULL, ?2)",
                )
                .bind(point.value)
                .bind(point.timestamp)
                .execute(&mut *tx)
                .await?;
                state.last_queue_value = point.value;
            }
            max_time = max_time.max(point.timestamp);
        }
        tx.commit().await?;

        state.last_persisted = max_time;

        // Keep a short in-memory tail for dashboard continuity
        collector.retain_points_after(Utc::now() - self.memory_retention);
        Ok(())
    }

    /// Restore cumulative counters at startup
    pub async fn load_cumulative(&self, collector: &MetricsCollector) -> Result<()> {
        let row = sqlx::query(
            "SELECT total_promotions, total_rejections, total_forgotten, cache_hits, cache_misses
             FROM metrics_cumulative WHERE id = 1",
        )
        .fetch_one(&self.pool)
        .await?;

        collector.restore(MetricsSnapshot {
            total_promotions: row.get(0),
            total_rejections: row.get(1),
            total_forgotten: row.get(2),
            cache_hits: row.get(3),
            cache_misses: row.get(4),
        });
        Ok(())
    }

    /// Reload recent time-series into the collector at startup
    pub async fn load_recent(&self, collector: &MetricsCollector, hours: i64) -> Result<()> {
        let since = Utc::now() - Duration::hours(hours);
        let rows = sqlx::query(
            "SELECT metric_type, value, category, timestamp FROM metrics_timeseries
             WHERE timestamp >= ?1 ORDER BY timestamp ASC",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut promotions = Vec::new();
        let mut queues = Vec::new();
        let mut max_time = DateTime::<Utc>::MIN_UTC;
        for row in rows {
            let metric_type: String = row.get(0);
            let point = TimeSeriesPoint {
                timestamp: row.get::<DateTime<Utc>, _>(3),
                value: row.get(1),
                label: row.get::<Option<String>, _>(2),
            };
            max_time = max_time.max(point.timestamp);
            match metric_type.as_str() {
                "promotion" => promotions.push(point),
                "queue_length" => queues.push(point),
                _ => {}
            }
        }

        info!(
            promotions = promotions.len(),
            queue_points = queues.len(),
            hours,
            "reloaded metrics history"
        );
        collector.load_points(promotions, queues);

        // Reloaded points must not be re-persisted on the next flush
        self.state.lock().await.last_persisted = max_time;
        Ok(())
    }

    /// Drop persisted time-series older than the retention window
    pub async fn cleanup_old(&self, retention_days: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(retention_days);
        let result = sqlx::query("DELETE FROM metrics_timeseries WHERE timestamp < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            info!(
                deleted = result.rows_affected(),
                retention_days, "trimmed persisted metrics"
            );
        }
        Ok(result.rows_affected())
    }

    /// Run the flush loop (plus daily cleanup) until shutdown
    pub fn spawn(
        self: Arc<Self>,
        collector: Arc<MetricsCollector>,
        retention_days: i64,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let persist_every = self
            .persist_interval
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(60));

        tokio::spawn(async move {
            if let Err(e) = self.cleanup_old(retention_days).await {
                error!(error = %e, "startup metrics cleanup failed");
            }

            let mut persist_tick = tokio::time::interval(persist_every);
            persist_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            persist_tick.tick().await; // immediate first tick

            let mut cleanup_tick =
                tokio::time::interval(std::time::Duration::from_secs(24 * 3600));
            cleanup_tick.tick().await;

            loop {
                tokio::select! {
                    _ = persist_tick.tick() => {
                        if let Err(e) = self.persist(&collector).await {
                            error!(error = %e, "metrics persistence failed");
                        }
                    }
                    _ = cleanup_tick.tick() => {
                        if let Err(e) = self.cleanup_old(retention_days).await {
                            error!(error = %e, "metrics cleanup failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        // Final flush so restarts lose nothing
                        if let Err(e) = self.persist(&collector).await {
                            error!(error = %e, "final metrics flush failed");
                        }
                        info!("metrics persistence stopped");
                        return;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        init_schema(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_persist_and_restore_counters() {
        let pool = test_pool().await;
        let persistence = MetricsPersistence::new(pool.clone(), 1, 1);
        let collector = MetricsCollector::new();

        collector.record_promotion("fact", true);
        collector.record_promotion("fact", false);
        collector.record_cache_hit();
        persistence.persist(&collector).await.unwrap();

        let restored = MetricsCollector::new();
        persistence.load_cumulative(&restored).await.unwrap();
        let snap = restored.snapshot();
        assert_eq!(snap.total_promotions, 1);
        assert_eq!(snap.total_rejections, 1);
        assert_eq!(snap.cache_hits, 1);
    }

    #[tokio::test]
    async fn test_persist_inserts_only_new_points() {
        let pool = test_pool().await;
        let persistence = MetricsPersistence::new(pool.clone(), 1, 1);
        let collector = MetricsCollector::new();

        collector.record_promotion("fact", true);
        persistence.persist(&collector).await.unwrap();
        // Second flush without new points must not duplicate rows
        persistence.persist(&collector).await.unwrap();

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM metrics_timeseries WHERE metric_type = 'promotion'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_queue_points_skip_unchanged_values() {
        let pool = test_pool().await;
        let persistence = MetricsPersistence::new(pool.clone(), 1, 1);
        let collector = MetricsCollector::new();

        collector.record_queue_length(5);
        collector.record_queue_length(5);
        collector.record_queue_length(9);
        persistence.persist(&collector).await.unwrap();

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM metrics_timeseries WHERE metric_type = 'queue_length'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_load_recent_marks_points_persisted() {
        let pool = test_pool().await;
        let persistence = MetricsPersistence::new(pool.clone(), 1, 1);
        let collector = MetricsCollector::new();

        collector.record_promotion("goal", true);
        persistence.persist(&collector).await.unwrap();

        // Simulate a restart
        let persistence2 = MetricsPersistence::new(pool.clone(), 1, 1);
        let collector2 = MetricsCollector::new();
        persistence2.load_recent(&collector2, 24).await.unwrap();
        assert_eq!(collector2.promotion_points().len(), 1);

        // Reloaded history must not be re-inserted
        persistence2.persist(&collector2).await.unwrap();
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM metrics_timeseries WHERE metric_type = 'promotion'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_cleanup_old() {
        let pool = test_pool().await;
        let persistence = MetricsPersistence::new(pool.clone(), 1, 1);

        let old = Utc::now() - Duration::days(40);
        sqlx::query(
            "INSERT INTO metrics_timeseries (metric_type, value, category, timestamp)
             VALUES ('promotion', 1.0, 'fact', ?1)",
        )
        .bind(old)
        .execute(&pool)
        .await
        .unwrap();

        let deleted = persistence.cleanup_old(30).await.unwrap();
        assert_eq!(deleted, 1);
    }
}
