//! Dashboard assembly over live collector + persisted series

use std::sync::Arc;

use sqlx::SqlitePool;

use sift::metrics::persistence::init_schema;
use sift::metrics::{Dashboard, MetricsCollector, MetricsPersistence};
use sift::storage::{InMemoryStagingStore, StagingStore};
use sift::types::{JudgeResult, MemoryCategory};

async fn test_pool() -> SqlitePool {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    init_schema(&pool).await.unwrap();
    pool
}

fn stageable() -> JudgeResult {
    JudgeResult {
        value_score: 0.8,
        confidence_score: 0.6,
        category: MemoryCategory::Fact,
        reason: String::new(),
        tags: Vec::new(),
        entities: Default::default(),
        should_stage: true,
        is_critical: false,
    }
}

#[tokio::test]
async fn test_dashboard_merges_db_and_memory() {
    let pool = test_pool().await;
    let collector = Arc::new(MetricsCollector::new());
    let staging = Arc::new(InMemoryStagingStore::new(30));

    staging
        .add_or_increment("u", "s", "queued fact", &stageable(), None)
        .await
        .unwrap();

    // One point persisted, one only in memory
    collector.record_promotion("fact", true);
    let persistence = MetricsPersistence::new(pool.clone(), 1, 24);
    persistence.persist(&collector).await.unwrap();
    collector.record_promotion("preference", true);

    let dashboard = Dashboard::new(pool, collector.clone(), staging as Arc<dyn StagingStore>);
    let data = dashboard.metrics("24h").await.unwrap();

    assert_eq!(data["current_queue_length"], 1);
    assert_eq!(data["total_promotions"], 2);
    assert_eq!(data["data_range_hours"], 24);

    // Both points land in the newest hourly bucket, not double-counted
    let trend = data["promotion_trend"].as_array().unwrap();
    assert_eq!(trend.len(), 24);
    let total: f64 = trend.iter().map(|p| p["value"].as_f64().unwrap()).sum();
    assert_eq!(total, 2.0);
}

#[tokio::test]
async fn test_dashboard_category_distribution_from_persisted_series() {
    let pool = test_pool().await;
    let collector = Arc::new(MetricsCollector::new());
    let staging = Arc::new(InMemoryStagingStore::new(30));

    collector.record_promotion("fact", true);
    collector.record_promotion("fact", true);
    collector.record_promotion("goal", true);
    let persistence = MetricsPersistence::new(pool.clone(), 1, 24);
    persistence.persist(&collector).await.unwrap();

    let dashboard = Dashboard::new(pool, collector, staging as Arc<dyn StagingStore>);
    let categories = dashboard.category_distribution().await.unwrap();
    assert_eq!(categories.get("fact"), Some(&2));
    assert_eq!(categories.get("goal"), Some(&1));
}

#[tokio::test]
async fn test_dashboard_range_cache_serves_stable_payload() {
    let pool = test_pool().await;
    let collector = Arc::new(MetricsCollector::new());
    let staging = Arc::new(InMemoryStagingStore::new(30));
    let dashboard = Dashboard::new(pool, collector.clone(), staging as Arc<dyn StagingStore>);

    let first = dashboard.metrics("1h").await.unwrap();
    // New activity is invisible until the 30 s cache expires
    collector.record_promotion("fact", true);
    let second = dashboard.metrics("1h").await.unwrap();
    assert_eq!(first["total_promotions"], second["total_promotions"]);
}
