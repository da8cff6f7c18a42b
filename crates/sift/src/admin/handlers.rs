//! Admin API handlers

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::admin::{ApiError, AppState};
use crate::alerts::{rules::alert_id, Alert, AlertLevel};
use crate::engine::ListFilter;
use crate::engine::schedulers::judge_sweep;
use crate::error::SiftError;

type ApiResult = Result<Json<Value>, ApiError>;

pub async fn health(State(state): State<AppState>) -> ApiResult {
    let status = state.engine.system_status().await;
    Ok(Json(json!({"status": "ok", "components": status})))
}

#[derive(Deserialize)]
pub struct AddMemoryRequest {
    pub user_id: String,
    pub session_id: String,
    pub input: String,
    pub output: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

pub async fn add_memory(
    State(state): State<AppState>,
    Json(req): Json<AddMemoryRequest>,
) -> ApiResult {
    state
        .engine
        .add(
            &req.user_id,
            &req.session_id,
            &req.input,
            &req.output,
            req.metadata,
        )
        .await?;
    Ok(Json(json!({"status": "stored"})))
}

#[derive(Deserialize, Default)]
pub struct ListMemoriesQuery {
    pub user_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub page: usize,
}

pub async fn list_memories(
    State(state): State<AppState>,
    Query(query): Query<ListMemoriesQuery>,
) -> ApiResult {
    let records = state
        .engine
        .list(ListFilter {
            user_id: query.user_id,
            kind: query.kind,
            limit: query.limit,
            page: query.page,
        })
        .await?;
    let count = records.len();
    Ok(Json(json!({"memories": records, "count": count})))
}

#[derive(Deserialize)]
pub struct UpdateMemoryRequest {
    pub content: String,
}

pub async fn update_memory(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateMemoryRequest>,
) -> ApiResult {
    if req.content.trim().is_empty() {
        return Err(SiftError::Validation("content must not be empty".into()).into());
    }
    state.engine.update(&id, &req.content).await?;
    Ok(Json(json!({"status": "updated"})))
}

pub async fn delete_memory(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    state.engine.delete(&id).await?;
    Ok(Json(json!({"status": "deleted"})))
}

#[derive(Deserialize)]
pub struct RetrieveRequest {
    pub user_id: String,
    pub session_id: String,
    pub query: String,
    #[serde(default = "default_retrieve_limit")]
    pub limit: usize,
}

fn default_retrieve_limit() -> usize {
    10
}

pub async fn retrieve(
    State(state): State<AppState>,
    Json(req): Json<RetrieveRequest>,
) -> ApiResult {
    let records = state
        .engine
        .retrieve(&req.user_id, &req.session_id, &req.query, req.limit)
        .await?;
    Ok(Json(json!({"memories": records})))
}

#[derive(Deserialize)]
pub struct ClearSessionRequest {
    pub user_id: String,
    pub session_id: String,
}

pub async fn clear_session(
    State(state): State<AppState>,
    Json(req): Json<ClearSessionRequest>,
) -> ApiResult {
    state.engine.clear(&req.user_id, &req.session_id).await?;
    Ok(Json(json!({"status": "cleared"})))
}

pub async fn list_users(State(state): State<AppState>) -> ApiResult {
    let users = state.engine.get_users().await?;
    Ok(Json(json!({"users": users})))
}

#[derive(Deserialize, Default)]
pub struct StagingQuery {
    pub user_id: Option<String>,
}

pub async fn list_staging(
    State(state): State<AppState>,
    Query(query): Query<StagingQuery>,
) -> ApiResult {
    let entries = state
        .engine
        .staging_entries(query.user_id.as_deref())
        .await?;
    Ok(Json(json!({"entries": entries})))
}

pub async fn staging_stats(State(state): State<AppState>) -> ApiResult {
    Ok(Json(state.engine.staging_stats().await?))
}

pub async fn confirm_staging(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    state.engine.confirm_staging_entry(&id).await?;
    Ok(Json(json!({"status": "promoted"})))
}

pub async fn reject_staging(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    state.engine.reject_staging_entry(&id).await?;
    Ok(Json(json!({"status": "rejected"})))
}

#[derive(Deserialize, Default)]
pub struct AlertsQuery {
    pub level: Option<String>,
    pub rule: Option<String>,
    #[serde(default = "default_alerts_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_alerts_limit() -> usize {
    50
}

pub async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertsQuery>,
) -> ApiResult {
    let (alerts, total) = state
        .alerts
        .query_alerts(
            query.level.as_deref(),
            query.rule.as_deref(),
            query.limit,
            query.offset,
        )
        .await?;
    Ok(Json(json!({"alerts": alerts, "total": total})))
}

#[derive(Deserialize)]
pub struct CreateAlertRequest {
    pub level: String,
    pub rule: String,
    pub message: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

pub async fn create_alert(
    State(state): State<AppState>,
    Json(req): Json<CreateAlertRequest>,
) -> ApiResult {
    let level = AlertLevel::parse(&req.level)
        .ok_or_else(|| SiftError::Validation(format!("unknown level '{}'", req.level)))?;
    if req.rule.trim().is_empty() {
        return Err(SiftError::Validation("rule must not be empty".into()).into());
    }

    state
        .alerts
        .create_alert(Alert {
            id: alert_id(&req.rule),
            level,
            rule: req.rule,
            message: req.message,
            timestamp: Utc::now(),
            metadata: req.metadata,
        })
        .await?;
    Ok(Json(json!({"status": "created"})))
}

pub async fn delete_alert(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    state.alerts.delete_alert(&id).await?;
    Ok(Json(json!({"status": "deleted"})))
}

pub async fn list_rules(State(state): State<AppState>) -> ApiResult {
    let rules = state.alerts.rule_infos().await?;
    Ok(Json(json!({"rules": rules})))
}

#[derive(Deserialize)]
pub struct ToggleRuleRequest {
    pub enabled: bool,
}

pub async fn toggle_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ToggleRuleRequest>,
) -> ApiResult {
    state.alerts.toggle_rule(&id, req.enabled).await?;
    Ok(Json(json!({"status": "updated"})))
}

#[derive(Deserialize)]
pub struct CooldownRequest {
    pub cooldown_seconds: i64,
}

pub async fn update_rule_cooldown(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CooldownRequest>,
) -> ApiResult {
    if req.cooldown_seconds < 0 {
        return Err(SiftError::Validation("cooldown must be non-negative".into()).into());
    }
    state
        .alerts
        .update_rule_cooldown(&id, req.cooldown_seconds)
        .await?;
    Ok(Json(json!({"status": "updated"})))
}

#[derive(Deserialize)]
pub struct RuleConfigRequest {
    pub config_json: String,
}

pub async fn update_rule_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RuleConfigRequest>,
) -> ApiResult {
    state.alerts.update_rule_config(&id, &req.config_json).await?;
    Ok(Json(json!({"status": "updated"})))
}

pub async fn alert_stats(State(state): State<AppState>) -> ApiResult {
    Ok(Json(state.alerts.get_stats().await?))
}

#[derive(Deserialize, Default)]
pub struct TrendQuery {
    #[serde(default = "default_trend_hours")]
    pub hours: i64,
}

fn default_trend_hours() -> i64 {
    24
}

pub async fn alert_trend(
    State(state): State<AppState>,
    Query(query): Query<TrendQuery>,
) -> ApiResult {
    Ok(Json(state.alerts.alert_trend(query.hours).await?))
}

#[derive(Deserialize, Default)]
pub struct DashboardQuery {
    #[serde(default = "default_range")]
    pub range: String,
}

fn default_range() -> String {
    "24h".to_string()
}

pub async fn dashboard_metrics(
    State(state): State<AppState>,
    Query(query): Query<DashboardQuery>,
) -> ApiResult {
    Ok(Json(state.dashboard.metrics(&query.range).await?))
}

#[derive(Deserialize, Default)]
pub struct TriggerJudgeRequest {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

pub async fn trigger_judge(
    State(state): State<AppState>,
    Json(req): Json<TriggerJudgeRequest>,
) -> ApiResult {
    match (req.user_id, req.session_id) {
        (Some(user), Some(session)) => {
            state.engine.judge_and_stage(&user, &session).await?;
        }
        (None, None) => {
            judge_sweep(&state.engine).await?;
        }
        _ => {
            return Err(SiftError::Validation(
                "provide both user_id and session_id, or neither".into(),
            )
            .into())
        }
    }
    Ok(Json(json!({"status": "triggered"})))
}

pub async fn trigger_promotion(State(state): State<AppState>) -> ApiResult {
    state.engine.promote_staging().await?;
    Ok(Json(json!({"status": "triggered"})))
}

pub async fn trigger_decay(State(state): State<AppState>) -> ApiResult {
    state.engine.scan_and_evict_decayed().await?;
    Ok(Json(json!({"status": "triggered"})))
}
