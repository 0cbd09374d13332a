pub mod health;
pub mod listen;
pub mod memory;
pub mod send;

use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use cp_channels::ChannelError;
use cp_engine::EngineError;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(listen::router())
        .merge(send::router())
        .merge(memory::router())
}

/// JSON error body with a matching status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "status": "error", "error": self.message })),
        )
            .into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::InvalidRequest(_)
            | EngineError::InvalidConfig(_)
            | EngineError::Channel(ChannelError::InvalidInput(_)) => StatusCode::BAD_REQUEST,
            EngineError::UnknownConversation(_)
            | EngineError::ConversationUnavailable(_)
            | EngineError::Channel(ChannelError::Unavailable(_)) => StatusCode::NOT_FOUND,
            EngineError::ShuttingDown | EngineError::SendQueueClosed => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            EngineError::Channel(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "control request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}
