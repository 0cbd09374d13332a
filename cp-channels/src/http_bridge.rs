use crate::error::{ChannelError, Result};
use crate::traits::ChatSurface;
use crate::types::{ConversationId, MediaKind, MessageKind, MessageRecord, RawMessageItem};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSED_CONVERSATION: &str = "conversation_unavailable";

/// Chat surface backed by a UI-automation bridge process reachable over HTTP.
///
/// The bridge owns the accessibility-tree work (window lookup, clicks,
/// clipboard) and exposes one resource per conversation:
///
/// - `POST {base}/conversations/{id}/acquire`
/// - `GET  {base}/conversations/{id}/messages`
/// - `POST {base}/conversations/{id}/classify`
/// - `POST {base}/conversations/{id}/enrich`
/// - `POST {base}/conversations/{id}/send_text`
/// - `POST {base}/conversations/{id}/send_file`
/// - `GET  {base}/health`
#[derive(Clone)]
pub struct HttpBridgeSurface {
    http: reqwest::Client,
    base_url: Url,
    auth_token: Option<String>,
}

impl HttpBridgeSurface {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = normalize_base_url(base_url)?;
        Ok(Self {
            http: build_http_client(DEFAULT_REQUEST_TIMEOUT)?,
            base_url,
            auth_token: None,
        })
    }

    pub fn with_auth_token(mut self, auth_token: Option<String>) -> Self {
        self.auth_token = auth_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(ToOwned::to_owned);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.http = build_http_client(timeout)?;
        Ok(self)
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Reachability check used by `doctor`.
    pub async fn health(&self) -> Result<serde_json::Value> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ChannelError::InvalidInput(format!("bridge url cannot be a base: {}", self.base_url))
            })?
            .pop_if_empty()
            .push("health");
        self.get_json(url).await
    }

    fn authorized_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth_token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn conversation_url(&self, conversation: &ConversationId, action: &str) -> Result<Url> {
        let id = conversation.trim();
        if id.is_empty() {
            return Err(ChannelError::InvalidInput(
                "conversation id is required".to_string(),
            ));
        }
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ChannelError::InvalidInput(format!("bridge url cannot be a base: {}", self.base_url))
            })?
            .pop_if_empty()
            .extend(["conversations", id, action]);
        Ok(url)
    }

    async fn get_json(&self, url: Url) -> Result<serde_json::Value> {
        let response = self.authorized_request(self.http.get(url)).send().await?;
        read_json(response).await
    }

    async fn post_json(&self, url: Url, payload: serde_json::Value) -> Result<serde_json::Value> {
        let response = self
            .authorized_request(self.http.post(url))
            .json(&payload)
            .send()
            .await?;
        read_json(response).await
    }
}

#[async_trait::async_trait]
impl ChatSurface for HttpBridgeSurface {
    fn surface_id(&self) -> &str {
        "http-bridge"
    }

    #[tracing::instrument(level = "debug", skip_all, fields(conversation = %conversation))]
    async fn acquire(&self, conversation: &ConversationId) -> Result<()> {
        let url = self.conversation_url(conversation, "acquire")?;
        self.post_json(url, serde_json::json!({})).await?;
        Ok(())
    }

    async fn list_visible_messages(
        &self,
        conversation: &ConversationId,
    ) -> Result<Vec<RawMessageItem>> {
        let url = self.conversation_url(conversation, "messages")?;
        let body = self.get_json(url).await?;
        Ok(extract_snapshot(body))
    }

    async fn classify(
        &self,
        conversation: &ConversationId,
        item: &RawMessageItem,
    ) -> Result<MessageRecord> {
        let url = self.conversation_url(conversation, "classify")?;
        let body = self
            .post_json(
                url,
                serde_json::json!({
                    "raw_id": item.raw_id,
                    "control": item.control,
                }),
            )
            .await?;
        let classified: BridgeClassifiedMessage = serde_json::from_value(body)?;
        Ok(classified.into_record(conversation, item))
    }

    async fn enrich(
        &self,
        conversation: &ConversationId,
        item: &RawMessageItem,
        media: MediaKind,
    ) -> Result<String> {
        let url = self.conversation_url(conversation, "enrich")?;
        let body = self
            .post_json(
                url,
                serde_json::json!({
                    "raw_id": item.raw_id,
                    "control": item.control,
                    "media": media,
                }),
            )
            .await?;
        let enriched: BridgeEnrichedContent = serde_json::from_value(body)?;
        let content = enriched.content.trim();
        if content.is_empty() {
            return Err(ChannelError::Protocol(
                "bridge returned empty enriched content".to_string(),
            ));
        }
        Ok(content.to_string())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(conversation = %conversation))]
    async fn send_text(&self, conversation: &ConversationId, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChannelError::InvalidInput("message text is empty".to_string()));
        }
        let url = self.conversation_url(conversation, "send_text")?;
        self.post_json(url, serde_json::json!({ "text": text })).await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(conversation = %conversation))]
    async fn send_file(&self, conversation: &ConversationId, path: &Path) -> Result<()> {
        if path.as_os_str().is_empty() {
            return Err(ChannelError::InvalidInput("file path is empty".to_string()));
        }
        let url = self.conversation_url(conversation, "send_file")?;
        self.post_json(url, serde_json::json!({ "path": path.display().to_string() }))
            .await?;
        Ok(())
    }
}

fn build_http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ChannelError::Http(format!("build http client: {e}")))
}

fn normalize_base_url(raw: &str) -> Result<Url> {
    let normalized = raw.trim();
    if normalized.is_empty() {
        return Err(ChannelError::InvalidInput("bridge base_url is required".to_string()));
    }
    let parsed = Url::parse(normalized)
        .map_err(|e| ChannelError::InvalidInput(format!("invalid bridge base_url: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(ChannelError::InvalidInput(format!(
            "invalid bridge base_url scheme: {other}"
        ))),
    }
}

async fn read_json(response: reqwest::Response) -> Result<serde_json::Value> {
    let status = response.status();
    let body = response.text().await?;
    check_status(status, &body)?;
    if body.trim().is_empty() {
        return Ok(serde_json::Value::Null);
    }
    Ok(serde_json::from_str(&body)?)
}

fn check_status(status: StatusCode, body: &str) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    let detail = format!("bridge status={status} body={body}");
    Err(match status {
        StatusCode::GONE => ChannelError::Unavailable(detail),
        StatusCode::NOT_FOUND if reports_closed_conversation(body) => {
            ChannelError::Unavailable(detail)
        }
        // Any other 404 means the bridge does not know the route.
        StatusCode::NOT_FOUND => ChannelError::Protocol(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ChannelError::Timeout(detail),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            ChannelError::InvalidInput(detail)
        }
        s if s == StatusCode::TOO_MANY_REQUESTS
            || s == StatusCode::CONFLICT
            || s.is_server_error() =>
        {
            ChannelError::Transient(detail)
        }
        _ => ChannelError::Http(detail),
    })
}

/// The bridge answers `404 {"error": "conversation_unavailable"}` when the
/// conversation window cannot be found.
fn reports_closed_conversation(body: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_owned))
        .is_some_and(|code| code == CLOSED_CONVERSATION)
}

fn extract_snapshot(body: serde_json::Value) -> Vec<RawMessageItem> {
    let items = match body {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut obj) => match obj.remove("messages") {
            Some(serde_json::Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<RawMessageItem>(item) {
            Ok(parsed) if !parsed.raw_id.trim().is_empty() => Some(parsed),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(%e, "skipping malformed snapshot item");
                None
            }
        })
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
struct BridgeClassifiedMessage {
    #[serde(default)]
    sender: String,
    #[serde(default)]
    content: String,
    kind: MessageKind,
    #[serde(default)]
    media: Option<MediaKind>,
}

impl BridgeClassifiedMessage {
    fn into_record(self, conversation: &ConversationId, item: &RawMessageItem) -> MessageRecord {
        MessageRecord {
            conversation_id: conversation.clone(),
            message_id: item.raw_id.clone(),
            sender: self.sender,
            content: self.content,
            kind: self.kind,
            media: self.media,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct BridgeEnrichedContent {
    content: String,
}
