//! Pipeline metrics
//!
//! A process-wide collector with atomic counters and bounded in-memory
//! time-series rings, a SQLite persistence side-car, and the dashboard
//! aggregation layer. Readers never block writers; the rings are trimmed to
//! the last 24 hours on every append.

pub mod dashboard;
pub mod persistence;

pub use dashboard::Dashboard;
pub use persistence::MetricsPersistence;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One sample in a metric time-series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Cheap copy of the counter state, taken for rule checks and dashboards
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub total_promotions: i64,
    pub total_rejections: i64,
    pub total_forgotten: i64,
    pub cache_hits: i64,
    pub cache_misses: i64,
}

impl MetricsSnapshot {
    /// Promotion success percentage over all attempts
    pub fn success_rate(&self) -> f64 {
        let attempts = self.total_promotions + self.total_rejections;
        if attempts == 0 {
            return 0.0;
        }
        self.total_promotions as f64 / attempts as f64 * 100.0
    }

    /// Judge-cache hit percentage over all accesses
    pub fn cache_hit_rate(&self) -> f64 {
        let accesses = self.cache_hits + self.cache_misses;
        if accesses == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / accesses as f64 * 100.0
    }
}

/// Concurrency-safe metrics collector
#[derive(Debug, Default)]
pub struct MetricsCollector {
    total_promotions: AtomicI64,
    total_rejections: AtomicI64,
    total_forgotten: AtomicI64,
    cache_hits: AtomicI64,
    cache_misses: AtomicI64,

    promotion_history: Mutex<Vec<TimeSeriesPoint>>,
    queue_history: Mutex<Vec<TimeSeriesPoint>>,
}

const RING_WINDOW_HOURS: i64 = 24;

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a promotion attempt. Successes also land in the time-series
    /// with their category as label.
    pub fn record_promotion(&self, category: &str, success: bool) {
        if success {
            self.total_promotions.fetch_add(1, Ordering::Relaxed);
            let mut ring = self.promotion_history.lock().unwrap();
            ring.push(TimeSeriesPoint {
                timestamp: Utc::now(),
                value: 1.0,
                label: Some(category.to_string()),
            });
            trim_ring(&mut ring);
        } else {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a staging queue-length sample
    pub fn record_queue_length(&self, length: usize) {
        let mut ring = self.queue_history.lock().unwrap();
        ring.push(TimeSeriesPoint {
            timestamp: Utc::now(),
            value: length as f64,
            label: None,
        });
        trim_ring(&mut ring);
    }

    /// Record evicted records from a decay scan
    pub fn record_forgotten(&self, count: i64) {
        self.total_forgotten.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_promotions: self.total_promotions.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            total_forgotten: self.total_forgotten.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }

    /// Restore counters from persistence at startup
    pub fn restore(&self, snapshot: MetricsSnapshot) {
        self.total_promotions
            .store(snapshot.total_promotions, Ordering::Relaxed);
        self.total_rejections
            .store(snapshot.total_rejections, Ordering::Relaxed);
        self.total_forgotten
            .store(snapshot.total_forgotten, Ordering::Relaxed);
        self.cache_hits.store(snapshot.cache_hits, Ordering::Relaxed);
        self.cache_misses
            .store(snapshot.cache_misses, Ordering::Relaxed);
    }

    /// Replace the in-memory rings with reloaded history
    pub fn load_points(
        &self,
        promotions: Vec<TimeSeriesPoint>,
        queue_lengths: Vec<TimeSeriesPoint>,
    ) {
        *self.promotion_history.lock().unwrap() = promotions;
        *self.queue_history.lock().unwrap() = queue_lengths;
    }

    pub fn promotion_points(&self) -> Vec<TimeSeriesPoint> {
        self.promotion_history.lock().unwrap().clone()
    }

    pub fn queue_points(&self) -> Vec<TimeSeriesPoint> {
        self.queue_history.lock().unwrap().clone()
    }

    /// Points newer than `after`, for incremental persistence
    pub fn points_after(
        &self,
        after: DateTime<Utc>,
    ) -> (Vec<TimeSeriesPoint>, Vec<TimeSeriesPoint>) {
        let promos = self
            .promotion_history
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.timestamp > after)
            .cloned()
            .collect();
        let queues = self
            .queue_history
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.timestamp > after)
            .cloned()
            .collect();
        (promos, queues)
    }

    /// Drop in-memory points older than the cutoff (after a flush)
    pub fn retain_points_after(&self, cutoff: DateTime<Utc>) {
        self.promotion_history
            .lock()
            .unwrap()
            .retain(|p| p.timestamp > cutoff);
        self.queue_history
            .lock()
            .unwrap()
            .retain(|p| p.timestamp > cutoff);
    }
}

fn trim_ring(ring: &mut Vec<TimeSeriesPoint>) {
    let cutoff = Utc::now() - Duration::hours(RING_WINDOW_HOURS);
    if ring.first().map(|p| p.timestamp < cutoff).unwrap_or(false) {
        ring.retain(|p| p.timestamp >= cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_rates() {
        let metrics = MetricsCollector::new();
        metrics.record_promotion("fact", true);
        metrics.record_promotion("preference", true);
        metrics.record_promotion("noise", false);
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.record_forgotten(5);

        let snap = metrics.snapshot();
        assert_eq!(snap.total_promotions, 2);
        assert_eq!(snap.total_rejections, 1);
        assert_eq!(snap.total_forgotten, 5);
        assert!((snap.success_rate() - 200.0 / 3.0).abs() < 1e-9);
        assert!((snap.cache_hit_rate() - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_rates_are_zero() {
        let snap = MetricsCollector::new().snapshot();
        assert_eq!(snap.success_rate(), 0.0);
        assert_eq!(snap.cache_hit_rate(), 0.0);
    }

    #[test]
    fn test_promotion_points_carry_category() {
        let metrics = MetricsCollector::new();
        metrics.record_promotion("goal", true);

        let points = metrics.promotion_points();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].label.as_deref(), Some("goal"));
        assert_eq!(points[0].value, 1.0);

        // Rejections do not produce points
        metrics.record_promotion("goal", false);
        assert_eq!(metrics.promotion_points().len(), 1);
    }

    #[test]
    fn test_points_after_and_retain() {
        let metrics = MetricsCollector::new();
        metrics.record_queue_length(3);
        let mark = Utc::now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        metrics.record_queue_length(7);

        let (_, queues) = metrics.points_after(mark);
        assert_eq!(queues.len(), 1);
        assert_eq!(queues[0].value, 7.0);

        metrics.retain_points_after(mark);
        assert_eq!(metrics.queue_points().len(), 1);
    }

    #[test]
    fn test_restore() {
        let metrics = MetricsCollector::new();
        metrics.restore(MetricsSnapshot {
            total_promotions: 10,
            total_rejections: 2,
            total_forgotten: 1,
            cache_hits: 50,
            cache_misses: 5,
        });
        let snap = metrics.snapshot();
        assert_eq!(snap.total_promotions, 10);
        assert_eq!(snap.cache_hits, 50);
    }
}
