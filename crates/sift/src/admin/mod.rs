//! Admin HTTP façade
//!
//! A thin axum layer proxying to the engine, the alert engine and the
//! dashboard. Validation errors map to 400, missing records to 404,
//! everything else to 500 with a short JSON message.

pub mod handlers;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use tokio::sync::watch;
use tracing::info;

use crate::alerts::AlertEngine;
use crate::engine::MemoryEngine;
use crate::error::{Result, SiftError};
use crate::metrics::Dashboard;

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MemoryEngine>,
    pub alerts: Arc<AlertEngine>,
    pub dashboard: Arc<Dashboard>,
}

/// JSON error envelope
pub struct ApiError(pub SiftError);

impl From<SiftError> for ApiError {
    fn from(e: SiftError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SiftError::Validation(_) => StatusCode::BAD_REQUEST,
            SiftError::NotFound(_) => StatusCode::NOT_FOUND,
            SiftError::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({"error": self.0.to_string()}));
        (status, body).into_response()
    }
}

/// Build the admin router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/api/memories",
            get(handlers::list_memories).post(handlers::add_memory),
        )
        .route(
            "/api/memories/{id}",
            put(handlers::update_memory).delete(handlers::delete_memory),
        )
        .route("/api/retrieve", post(handlers::retrieve))
        .route("/api/sessions/clear", post(handlers::clear_session))
        .route("/api/users", get(handlers::list_users))
        .route("/api/staging", get(handlers::list_staging))
        .route("/api/staging/stats", get(handlers::staging_stats))
        .route("/api/staging/{id}/confirm", post(handlers::confirm_staging))
        .route("/api/staging/{id}/reject", post(handlers::reject_staging))
        .route(
            "/api/alerts",
            get(handlers::list_alerts).post(handlers::create_alert),
        )
        .route("/api/alerts/{id}", delete(handlers::delete_alert))
        .route("/api/alerts/rules", get(handlers::list_rules))
        .route("/api/alerts/rules/{id}/toggle", post(handlers::toggle_rule))
        .route(
            "/api/alerts/rules/{id}/cooldown",
            post(handlers::update_rule_cooldown),
        )
        .route(
            "/api/alerts/rules/{id}/config",
            post(handlers::update_rule_config),
        )
        .route("/api/alerts/stats", get(handlers::alert_stats))
        .route("/api/alerts/trend", get(handlers::alert_trend))
        .route("/api/dashboard/metrics", get(handlers::dashboard_metrics))
        .route("/api/admin/trigger-judge", post(handlers::trigger_judge))
        .route(
            "/api/admin/trigger-promotion",
            post(handlers::trigger_promotion),
        )
        .route("/api/admin/trigger-decay", post(handlers::trigger_decay))
        .with_state(state)
}

/// Serve the admin API until the shutdown signal flips
pub async fn serve(
    state: AppState,
    listen_addr: &str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .map_err(|e| SiftError::Config(format!("cannot bind {listen_addr}: {e}")))?;
    info!(addr = listen_addr, "admin API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| SiftError::Store(format!("server error: {e}")))?;

    info!("admin API stopped");
    Ok(())
}
