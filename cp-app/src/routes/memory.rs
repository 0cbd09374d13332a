use crate::server::AppState;
use axum::extract::Path;
use axum::routing::post;
use axum::{Extension, Json};
use cp_channels::ConversationId;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/memory/{conversation_id}/reset", post(reset_memory))
}

#[tracing::instrument(level = "info", skip_all)]
async fn reset_memory(
    Extension(state): Extension<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> Json<serde_json::Value> {
    let conversation = ConversationId::from(conversation_id);
    let reset = state.engine.reset_memory(&conversation);
    tracing::info!(conversation = %conversation, reset, "conversation memory reset");
    Json(serde_json::json!({
        "status": "ok",
        "conversation_id": conversation,
        "reset": reset,
    }))
}
