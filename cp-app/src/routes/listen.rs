use crate::routes::ApiError;
use crate::server::AppState;
use axum::extract::Path;
use axum::routing::{delete, get, post};
use axum::{Extension, Json};
use cp_channels::{CaptureFlags, ConversationId, MessageRecord};
use cp_engine::ListenTargetInfo;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AddListenRequest {
    conversation_id: String,
    #[serde(default)]
    capture: CaptureFlags,
}

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/listen", get(list_targets).post(add_target))
        .route("/listen/{conversation_id}", delete(remove_target))
        .route("/poll", post(poll_now))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_targets(Extension(state): Extension<Arc<AppState>>) -> Json<Vec<ListenTargetInfo>> {
    Json(state.engine.listen_targets().await)
}

#[tracing::instrument(level = "info", skip_all)]
async fn add_target(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<AddListenRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = req.conversation_id.trim();
    if id.is_empty() {
        return Err(ApiError::bad_request("conversation_id must not be empty"));
    }
    let conversation = ConversationId::from(id);
    state
        .engine
        .add_listen_target(&conversation, req.capture)
        .await?;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "conversation_id": conversation,
        "capture": req.capture,
    })))
}

#[tracing::instrument(level = "info", skip_all)]
async fn remove_target(
    Extension(state): Extension<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conversation = ConversationId::from(conversation_id);
    if !state.engine.remove_listen_target(&conversation) {
        return Err(ApiError::not_found(format!(
            "not listening to {conversation}"
        )));
    }
    Ok(Json(serde_json::json!({ "status": "ok", "conversation_id": conversation })))
}

#[tracing::instrument(level = "info", skip_all)]
async fn poll_now(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<BTreeMap<String, Vec<MessageRecord>>>, ApiError> {
    let polled = state.engine.poll_once().await?;
    Ok(Json(
        polled
            .into_iter()
            .map(|(conversation, records)| (conversation.into_inner(), records))
            .collect(),
    ))
}
