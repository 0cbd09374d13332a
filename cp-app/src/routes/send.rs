use crate::routes::ApiError;
use crate::server::AppState;
use axum::routing::post;
use axum::{Extension, Json};
use cp_channels::ConversationId;
use cp_engine::SendReport;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Exactly one of `text` and `file` must be set.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SendRequest {
    conversation_id: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    file: Option<PathBuf>,
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/send", post(send))
}

#[tracing::instrument(level = "info", skip_all)]
async fn send(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<SendRequest>,
) -> Result<Json<SendReport>, ApiError> {
    let id = req.conversation_id.trim();
    if id.is_empty() {
        return Err(ApiError::bad_request("conversation_id must not be empty"));
    }
    let conversation = ConversationId::from(id);
    let report = match (req.text, req.file) {
        (Some(text), None) => state.engine.send_text(&conversation, &text).await?,
        (None, Some(path)) => state.engine.send_file(&conversation, path).await?,
        _ => {
            return Err(ApiError::bad_request(
                "exactly one of text or file is required",
            ));
        }
    };
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use crate::routes::test_support::{FixtureSurface, app_state, call};
    use axum::http::StatusCode;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn sends_text_and_files_through_the_engine() {
        let surface = Arc::new(FixtureSurface::default());
        let state = app_state(surface.clone());

        let (code, body) = call(
            &state,
            "POST",
            "/send",
            Some(json!({ "conversation_id": "Bob", "text": "see you at 8" })),
        )
        .await;
        assert_eq!(code, StatusCode::OK, "{body}");
        assert_eq!(body["delivered"], 1);

        let (code, _) = call(
            &state,
            "POST",
            "/send",
            Some(json!({ "conversation_id": "Bob", "file": "/tmp/menu.pdf" })),
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(
            surface.sent.lock().expect("sent lock").clone(),
            vec![
                ("Bob".to_string(), "see you at 8".to_string()),
                ("Bob".to_string(), "/tmp/menu.pdf".to_string()),
            ]
        );

        let (code, body) = call(
            &state,
            "POST",
            "/send",
            Some(json!({ "conversation_id": "Bob", "text": "x", "file": "/tmp/y" })),
        )
        .await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap_or_default().contains("exactly one"));

        let (code, _) = call(
            &state,
            "POST",
            "/send",
            Some(json!({ "conversation_id": "Bob", "text": "   " })),
        )
        .await;
        assert_eq!(code, StatusCode::BAD_REQUEST);

        state.engine.shutdown().await;
        let (code, _) = call(
            &state,
            "POST",
            "/send",
            Some(json!({ "conversation_id": "Bob", "text": "late" })),
        )
        .await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
    }
}
