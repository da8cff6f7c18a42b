//! Dashboard metrics assembly
//!
//! Merges persisted time-series with the in-memory tail, aggregates by
//! minute, hour or day depending on the requested range, and serves the
//! result through two independent 30-second caches (one per range, one for
//! the category rollup). Category distribution reads from persisted
//! time-series only.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde_json::{json, Value};
use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::metrics::{MetricsCollector, TimeSeriesPoint};
use crate::storage::StagingStore;

const CACHE_TTL_SECONDS: i64 = 30;

/// Parse a dashboard range string into hours; unknown ranges mean 24h
pub fn parse_range_hours(range: &str) -> i64 {
    match range {
        "1h" => 1,
        "24h" => 24,
        "7d" => 24 * 7,
        "30d" => 24 * 30,
        _ => 24,
    }
}

struct CachedValue {
    data: Value,
    expires_at: DateTime<Utc>,
}

/// Dashboard query layer over the collector, staging store and DB
pub struct Dashboard {
    pool: SqlitePool,
    collector: Arc<MetricsCollector>,
    staging: Arc<dyn StagingStore>,
    range_cache: RwLock<HashMap<String, CachedValue>>,
    category_cache: RwLock<Option<(HashMap<String, i64>, DateTime<Utc>)>>,
}

impl Dashboard {
    pub fn new(
        pool: SqlitePool,
        collector: Arc<MetricsCollector>,
        staging: Arc<dyn StagingStore>,
    ) -> Self {
        Self {
            pool,
            collector,
            staging,
            range_cache: RwLock::new(HashMap::new()),
            category_cache: RwLock::new(None),
        }
    }

    /// Assemble the full dashboard payload for a range
    pub async fn metrics(&self, range: &str) -> Result<Value> {
        {
            let cache = self.range_cache.read().await;
            if let Some(entry) = cache.get(range) {
                if entry.expires_at > Utc::now() {
                    return Ok(entry.data.clone());
                }
            }
        }

        let hours = parse_range_hours(range);
        let queue_length = self.staging.get_pending(1, 0).await?.len();
        self.collector.record_queue_length(queue_length);

        let (db_promotions, db_queues) = self.query_raw(hours).await?;
        let max_db_time = db_promotions
            .iter()
            .chain(db_queues.iter())
            .map(|p| p.timestamp)
            .max()
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        // Memory points only past the newest DB point, to avoid duplicates
        let cutoff = Utc::now() - Duration::hours(hours);
        let merge = |db: Vec<TimeSeriesPoint>, mem: Vec<TimeSeriesPoint>| {
            let mut all = db;
            all.extend(mem.into_iter().filter(|p| p.timestamp > max_db_time));
            all.retain(|p| p.timestamp > cutoff);
            all
        };
        let all_promotions = merge(db_promotions, self.collector.promotion_points());
        let all_queues = merge(db_queues, self.collector.queue_points());

        let (promotion_trend, queue_trend) = if hours <= 1 {
            (
                aggregate(&all_promotions, Bucket::Minute, false, hours * 60),
                aggregate(&all_queues, Bucket::Minute, true, hours * 60),
            )
        } else if hours <= 24 {
            (
                aggregate(&all_promotions, Bucket::Hour, false, hours),
                aggregate(&all_queues, Bucket::Hour, true, hours),
            )
        } else {
            (
                aggregate(&all_promotions, Bucket::Day, false, hours / 24),
                aggregate(&all_queues, Bucket::Day, true, hours / 24),
            )
        };

        let categories = self.category_distribution().await?;
        let snapshot = self.collector.snapshot();

        let data = json!({
            "current_queue_length": queue_length,
            "total_promotions": snapshot.total_promotions,
            "total_rejections": snapshot.total_rejections,
            "total_forgotten": snapshot.total_forgotten,
            "promotion_success_rate": snapshot.success_rate(),
            "cache_hit_rate": snapshot.cache_hit_rate(),
            "cache_hits": snapshot.cache_hits,
            "cache_misses": snapshot.cache_misses,
            "promotion_trend": promotion_trend,
            "queue_length_trend": queue_trend,
            "category_distribution": category_rollup(&categories),
            "timestamp": Utc::now().to_rfc3339(),
            "data_range_hours": hours,
        });

        self.range_cache.write().await.insert(
            range.to_string(),
            CachedValue {
                data: data.clone(),
                expires_at: Utc::now() + Duration::seconds(CACHE_TTL_SECONDS),
            },
        );
        Ok(data)
    }

    /// Promotion counts per category over the last 30 days, cached 30 s
    pub async fn category_distribution(&self) -> Result<HashMap<String, i64>> {
        {
            let cache = self.category_cache.read().await;
            if let Some((data, expires_at)) = cache.as_ref() {
                if *expires_at > Utc::now() {
                    return Ok(data.clone());
                }
            }
        }

        let since = Utc::now() - Duration::hours(24 * 30);
        let rows = sqlx::query(
            "SELECT category, COUNT(*) as cnt FROM metrics_timeseries
             WHERE metric_type = 'promotion' AND category IS NOT NULL AND timestamp >= ?1
             GROUP BY category",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let map: HashMap<String, i64> = rows
            .into_iter()
            .map(|row| (row.get::<String, _>(0), row.get::<i64, _>(1)))
            .collect();

        *self.category_cache.write().await = Some((
            map.clone(),
            Utc::now() + Duration::seconds(CACHE_TTL_SECONDS),
        ));
        Ok(map)
    }

    async fn query_raw(&self, hours: i64) -> Result<(Vec<TimeSeriesPoint>, Vec<TimeSeriesPoint>)> {
        let since = Utc::now() - Duration::hours(hours);
        let rows = sqlx::query(
            "SELECT metric_type, value, timestamp FROM metrics_timeseries
             WHERE timestamp >= ?1 ORDER BY timestamp ASC",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut promotions = Vec::new();
        let mut queues = Vec::new();
        for row in rows {
            let metric_type: String = row.get(0);
            let point = TimeSeriesPoint {
                timestamp: row.get::<DateTime<Utc>, _>(2),
                value: row.get(1),
                label: None,
            };
            match metric_type.as_str() {
                "promotion" => promotions.push(point),
                "queue_length" => queues.push(point),
                _ => {}
            }
        }
        Ok((promotions, queues))
    }
}

fn category_rollup(categories: &HashMap<String, i64>) -> Value {
    let total: i64 = categories.values().sum();
    let mut entries: Vec<Value> = categories
        .iter()
        .map(|(category, count)| {
            let percent = if total > 0 {
                *count as f64 / total as f64 * 100.0
            } else {
                0.0
            };
            json!({"category": category, "count": count, "percent": percent})
        })
        .collect();
    entries.sort_by(|a, b| {
        b["count"]
            .as_i64()
            .unwrap_or(0)
            .cmp(&a["count"].as_i64().unwrap_or(0))
    });
    Value::Array(entries)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Minute,
    Hour,
    Day,
}

impl Bucket {
    fn width(&self) -> Duration {
        match self {
            Bucket::Minute => Duration::minutes(1),
            Bucket::Hour => Duration::hours(1),
            Bucket::Day => Duration::days(1),
        }
    }
}

/// Aggregate points into fixed time slots ending now: sums for counters,
/// averages for gauges. Slots with no samples stay at zero.
fn aggregate(
    points: &[TimeSeriesPoint],
    bucket: Bucket,
    is_average: bool,
    slots: i64,
) -> Vec<TimeSeriesPoint> {
    let slots = slots.max(1);
    let width = bucket.width();
    let now_slot = Utc::now().duration_trunc(width).unwrap_or_else(|_| Utc::now());

    let mut sums: HashMap<i64, f64> = HashMap::new();
    let mut counts: HashMap<i64, i64> = HashMap::new();
    for point in points {
        let slot = point
            .timestamp
            .duration_trunc(width)
            .unwrap_or(point.timestamp);
        let index = (now_slot - slot).num_seconds() / width.num_seconds();
        if (0..slots).contains(&index) {
            *sums.entry(index).or_default() += point.value;
            *counts.entry(index).or_default() += 1;
        }
    }

    (0..slots)
        .rev()
        .map(|index| {
            let mut value = sums.get(&index).copied().unwrap_or(0.0);
            if is_average {
                let count = counts.get(&index).copied().unwrap_or(0);
                if count > 0 {
                    value /= count as f64;
                }
            }
            TimeSeriesPoint {
                timestamp: now_slot - width * (index as i32),
                value,
                label: None,
            }
        })
        .collect()
}
