//! Alert engine: cooldowns, aggregation, persistence, notification

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use serde_json::Map;
use sqlx::SqlitePool;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use sift::alerts::{
    aggregated_alerts, Alert, AlertEngine, AlertLevel, AlertNotifier, SqliteAlertRepository,
    SqliteRuleConfigStore,
};
use sift::config::{AlertsConfig, NotifyConfig};
use sift::metrics::persistence::init_schema;
use sift::metrics::MetricsCollector;
use sift::storage::{InMemoryStagingStore, StagingStore};
use sift::types::{JudgeResult, MemoryCategory};

async fn test_pool() -> SqlitePool {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    init_schema(&pool).await.unwrap();
    pool
}

fn alerts_config() -> AlertsConfig {
    AlertsConfig {
        queue_backlog_threshold: 1,
        queue_backlog_cooldown_minutes: 10,
        history_max_size: 10,
        ..AlertsConfig::default()
    }
}

async fn engine_with(
    pool: &SqlitePool,
    config: &AlertsConfig,
    staging: Arc<InMemoryStagingStore>,
    metrics: Arc<MetricsCollector>,
) -> Arc<AlertEngine> {
    let engine = Arc::new(AlertEngine::new(
        config,
        Arc::new(SqliteAlertRepository::new(pool.clone())),
        Arc::new(SqliteRuleConfigStore::new(pool.clone())),
        staging,
        metrics,
    ));
    engine.init_rule_configs(config).await.unwrap();
    engine
}

fn stageable(confidence: f64) -> JudgeResult {
    JudgeResult {
        value_score: 0.8,
        confidence_score: confidence,
        category: MemoryCategory::Fact,
        reason: String::new(),
        tags: Vec::new(),
        entities: Default::default(),
        should_stage: true,
        is_critical: false,
    }
}

/// Cooldown: a backed-up queue fires exactly once across two ticks inside
/// the cooldown window, persisting one alert and invalidating the stats
/// cache once.
#[tokio::test]
async fn test_queue_backlog_fires_once_within_cooldown() {
    let pool = test_pool().await;
    let staging = Arc::new(InMemoryStagingStore::new(30));
    for i in 0..5 {
        staging
            .add_or_increment("u", "s", &format!("pending fact {i}"), &stageable(0.6), None)
            .await
            .unwrap();
    }

    let metrics = Arc::new(MetricsCollector::new());
    let engine = engine_with(&pool, &alerts_config(), staging, metrics).await;

    engine.check_all_rules().await;
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    engine.check_all_rules().await;

    let (alerts, total) = engine.query_alerts(None, Some("queue_backlog"), 10, 0).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(alerts[0].level, AlertLevel::Warning);
    assert_eq!(engine.stats_cache_invalidations(), 1);

    let rules = engine.rule_infos().await.unwrap();
    let backlog = rules
        .iter()
        .find(|r| r["id"] == "queue_backlog")
        .unwrap();
    assert_eq!(backlog["stats"]["total_fired"], 1);
}

/// A healthy queue fires nothing.
#[tokio::test]
async fn test_no_alert_below_threshold() {
    let pool = test_pool().await;
    let staging = Arc::new(InMemoryStagingStore::new(30));
    staging
        .add_or_increment("u", "s", "single fact", &stageable(0.6), None)
        .await
        .unwrap();

    let metrics = Arc::new(MetricsCollector::new());
    let engine = engine_with(&pool, &alerts_config(), staging, metrics).await;
    engine.check_all_rules().await;

    let (_, total) = engine.query_alerts(None, None, 10, 0).await.unwrap();
    assert_eq!(total, 0);
}

/// Disabled rules are skipped entirely.
#[tokio::test]
async fn test_disabled_rule_is_skipped() {
    let pool = test_pool().await;
    let staging = Arc::new(InMemoryStagingStore::new(30));
    for i in 0..5 {
        staging
            .add_or_increment("u", "s", &format!("fact {i}"), &stageable(0.6), None)
            .await
            .unwrap();
    }

    let metrics = Arc::new(MetricsCollector::new());
    let engine = engine_with(&pool, &alerts_config(), staging, metrics).await;
    engine.toggle_rule("queue_backlog", false).await.unwrap();
    engine.check_all_rules().await;

    let (_, total) = engine.query_alerts(None, None, 10, 0).await.unwrap();
    assert_eq!(total, 0);
}

/// Aggregation: two alerts sharing (rule, level) within the window become
/// one counted record with an updated last_seen.
#[tokio::test]
async fn test_aggregation_counts_duplicates() {
    let pool = test_pool().await;
    let staging = Arc::new(InMemoryStagingStore::new(30));
    let metrics = Arc::new(MetricsCollector::new());
    let engine = engine_with(&pool, &alerts_config(), staging, metrics).await;

    let make = |id: &str| Alert {
        id: id.to_string(),
        level: AlertLevel::Warning,
        rule: "aggregation_probe".to_string(),
        message: "m".to_string(),
        timestamp: Utc::now(),
        metadata: Map::new(),
    };

    engine.fire_alert(make("agg_1")).await;
    engine.fire_alert(make("agg_2")).await;

    let aggregated: Vec<_> = aggregated_alerts()
        .into_iter()
        .filter(|a| a.alert.rule == "aggregation_probe")
        .collect();
    assert_eq!(aggregated.len(), 1);
    assert_eq!(aggregated[0].count, 2);
    assert!(aggregated[0].last_seen >= aggregated[0].first_seen);
}

/// The in-memory ring serves newest-first and stays bounded.
#[tokio::test]
async fn test_recent_ring_newest_first_and_bounded() {
    let pool = test_pool().await;
    let staging = Arc::new(InMemoryStagingStore::new(30));
    let metrics = Arc::new(MetricsCollector::new());
    let mut config = alerts_config();
    config.history_max_size = 3;
    let engine = engine_with(&pool, &config, staging, metrics).await;

    for i in 0..5 {
        engine
            .fire_alert(Alert {
                id: format!("ring_{i}"),
                level: AlertLevel::Info,
                rule: "ring_probe".to_string(),
                message: format!("message {i}"),
                timestamp: Utc::now(),
                metadata: Map::new(),
            })
            .await;
    }

    let recent = engine.recent_alerts(0);
    assert_eq!(recent.len(), 3);
    assert_eq!(recent[0].id, "ring_4");
    assert_eq!(recent[2].id, "ring_2");
}

/// Manual creation rejects a duplicate id with a conflict.
#[tokio::test]
async fn test_manual_create_conflicts_on_duplicate_id() {
    let pool = test_pool().await;
    let staging = Arc::new(InMemoryStagingStore::new(30));
    let metrics = Arc::new(MetricsCollector::new());
    let engine = engine_with(&pool, &alerts_config(), staging, metrics).await;

    let alert = Alert {
        id: "manual_1".to_string(),
        level: AlertLevel::Info,
        rule: "manual".to_string(),
        message: "m".to_string(),
        timestamp: Utc::now(),
        metadata: Map::new(),
    };
    engine.create_alert(alert.clone()).await.unwrap();
    let err = engine.create_alert(alert).await.unwrap_err();
    assert!(matches!(err, sift::SiftError::Conflict(_)));
}

/// Notifier delivery: a fired WARNING reaches the webhook; failures are
/// counted as failed notifications.
#[tokio::test]
async fn test_webhook_notification_and_failure_counting() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let pool = test_pool().await;
    let staging = Arc::new(InMemoryStagingStore::new(30));
    let metrics = Arc::new(MetricsCollector::new());

    let notify = NotifyConfig {
        webhook_enabled: true,
        webhook_url: server.uri(),
        levels: vec!["WARNING".into()],
        ..NotifyConfig::default()
    };
    let engine = Arc::new(
        AlertEngine::new(
            &alerts_config(),
            Arc::new(SqliteAlertRepository::new(pool.clone())),
            Arc::new(SqliteRuleConfigStore::new(pool.clone())),
            staging,
            metrics,
        )
        .with_notifier(Arc::new(AlertNotifier::new(notify).unwrap())),
    );

    let make = |id: &str| Alert {
        id: id.to_string(),
        level: AlertLevel::Warning,
        rule: "notify_probe".to_string(),
        message: "m".to_string(),
        timestamp: Utc::now(),
        metadata: Map::new(),
    };

    engine.fire_alert(make("notify_1")).await;
    engine.fire_alert(make("notify_2")).await;
    // Delivery happens off the firing path
    tokio::time::sleep(StdDuration::from_millis(300)).await;

    let stats = engine.get_stats().await.unwrap();
    assert_eq!(stats["notify_success"], 1);
    assert_eq!(stats["notify_failed"], 1);
}

/// Trend buckets count alerts per level per hour.
#[tokio::test]
async fn test_alert_trend_buckets() {
    let pool = test_pool().await;
    let staging = Arc::new(InMemoryStagingStore::new(30));
    let metrics = Arc::new(MetricsCollector::new());
    let engine = engine_with(&pool, &alerts_config(), staging, metrics).await;

    engine
        .fire_alert(Alert {
            id: "trend_1".into(),
            level: AlertLevel::Error,
            rule: "trend_probe".into(),
            message: "m".into(),
            timestamp: Utc::now(),
            metadata: Map::new(),
        })
        .await;

    let trend = engine.alert_trend(6).await.unwrap();
    let errors: i64 = trend["error"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_i64().unwrap())
        .sum();
    assert_eq!(errors, 1);
    assert_eq!(trend["timestamps"].as_array().unwrap().len(), 7);
}
