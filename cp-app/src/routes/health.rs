use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use cp_engine::EngineStatus;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/health", get(get_health))
        .route("/status", get(get_status))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let running = state.engine.is_running();
    Json(serde_json::json!({
        "status": if running { "ok" } else { "stopping" },
        "ready": running,
        "model": state.model,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "checked_at": Utc::now(),
    }))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_status(Extension(state): Extension<Arc<AppState>>) -> Json<EngineStatus> {
    Json(state.engine.status().await)
}
