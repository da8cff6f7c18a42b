//! Admin façade: routing, status codes, error mapping

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tower::ServiceExt;

use common::{build, funnel_config, preference_verdict};
use sift::admin::{router, AppState};
use sift::alerts::{AlertEngine, SqliteAlertRepository, SqliteRuleConfigStore};
use sift::config::AlertsConfig;
use sift::metrics::persistence::init_schema;
use sift::metrics::Dashboard;
use sift::storage::StagingStore;
use sift::testing::MockLlm;

async fn app() -> Router {
    let llm = MockLlm::scripted_then(
        &[&preference_verdict(0.8, 0.7)],
        "The user prefers Python.",
    );
    let h = build(funnel_config(), llm);

    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    init_schema(&pool).await.unwrap();

    let alerts_config = AlertsConfig::default();
    let alerts = Arc::new(AlertEngine::new(
        &alerts_config,
        Arc::new(SqliteAlertRepository::new(pool.clone())),
        Arc::new(SqliteRuleConfigStore::new(pool.clone())),
        h.staging.clone() as Arc<dyn StagingStore>,
        h.metrics.clone(),
    ));
    alerts.init_rule_configs(&alerts_config).await.unwrap();

    let dashboard = Arc::new(Dashboard::new(
        pool,
        h.metrics.clone(),
        h.staging.clone() as Arc<dyn StagingStore>,
    ));

    router(AppState {
        engine: h.engine.clone(),
        alerts,
        dashboard,
    })
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let app = app().await;
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_add_then_retrieve_roundtrip() {
    let app = app().await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/memories",
            json!({
                "user_id": "u", "session_id": "s",
                "input": "I prefer Python", "output": "noted"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(post_json(
            "/api/retrieve",
            json!({"user_id": "u", "session_id": "s", "query": "preferences"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let memories = body["memories"].as_array().unwrap();
    assert_eq!(memories.len(), 1);
    assert!(memories[0]["content"]
        .as_str()
        .unwrap()
        .contains("I prefer Python"));
}

#[tokio::test]
async fn test_validation_maps_to_400() {
    let app = app().await;
    let response = app
        .oneshot(post_json(
            "/api/memories",
            json!({"user_id": "", "session_id": "", "input": "x", "output": "y"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("required"));
}

#[tokio::test]
async fn test_missing_record_maps_to_404() {
    let app = app().await;
    let response = app
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/api/memories/nope")
                .header("content-type", "application/json")
                .body(Body::from(json!({"content": "new"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_manual_judge_trigger_and_staging_listing() {
    let app = app().await;

    app.clone()
        .oneshot(post_json(
            "/api/memories",
            json!({
                "user_id": "u", "session_id": "s",
                "input": "I prefer Python", "output": "ok"
            }),
        ))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/admin/trigger-judge",
            json!({"user_id": "u", "session_id": "s"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::get("/api/staging?user_id=u")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    let entries = body["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["content"], "The user prefers Python.");
}

#[tokio::test]
async fn test_alert_rules_listing_and_dashboard() {
    let app = app().await;

    let response = app
        .clone()
        .oneshot(Request::get("/api/alerts/rules").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let rules = body["rules"].as_array().unwrap();
    assert_eq!(rules.len(), 4);

    let response = app
        .oneshot(
            Request::get("/api/dashboard/metrics?range=1h")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data_range_hours"], 1);
}
