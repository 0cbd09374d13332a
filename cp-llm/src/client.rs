use crate::anthropic::AnthropicClient;
use crate::error::{LlmError, Result};
use crate::openai::OpenAiClient;
use crate::types::{ChatMessage, ChatResponse};
use std::time::Duration;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_MAX_TOKENS: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Anthropic,
}

#[derive(Clone)]
pub struct LlmClient {
    provider: Provider,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
    client: reqwest::Client,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(api_key: &str, model: &str) -> Result<Self> {
        let model = model.trim();
        if model.is_empty() {
            return Err(LlmError::InvalidInput("model is required".to_string()));
        }
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(LlmError::InvalidInput(format!(
                "api key is required for model {model}"
            )));
        }
        let provider = detect_provider(model);
        let base_url = match provider {
            Provider::OpenAI => OPENAI_BASE_URL,
            Provider::Anthropic => ANTHROPIC_BASE_URL,
        };
        Ok(Self {
            provider,
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            client: build_http_client(DEFAULT_TIMEOUT)?,
        })
    }

    /// Point the client at an OpenAI-compatible (or proxied Anthropic) endpoint.
    pub fn with_base_url(mut self, base_url: Option<&str>) -> Result<Self> {
        if let Some(raw) = base_url.map(str::trim).filter(|s| !s.is_empty()) {
            self.base_url = normalize_base_url(raw)?;
        }
        Ok(self)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = build_http_client(timeout)?;
        Ok(self)
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens.max(1);
        self
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model))]
    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatResponse> {
        if messages.is_empty() {
            return Err(LlmError::InvalidInput("messages must not be empty".to_string()));
        }
        match self.provider {
            Provider::OpenAI => {
                OpenAiClient::new(
                    self.client.clone(),
                    &self.base_url,
                    &self.api_key,
                    &self.model,
                    self.max_tokens,
                )
                .chat(messages)
                .await
            }
            Provider::Anthropic => {
                AnthropicClient::new(
                    self.client.clone(),
                    &self.base_url,
                    &self.api_key,
                    &self.model,
                    self.max_tokens,
                )
                .chat(messages)
                .await
            }
        }
    }
}

fn build_http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| LlmError::Http(format!("build http client: {e}")))
}

fn detect_provider(model: &str) -> Provider {
    let m = model.to_ascii_lowercase();
    if m.starts_with("claude-") {
        return Provider::Anthropic;
    }
    Provider::OpenAI
}

fn normalize_base_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim_end_matches('/');
    let parsed = reqwest::Url::parse(trimmed)
        .map_err(|e| LlmError::InvalidInput(format!("invalid llm base_url: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(trimmed.to_string()),
        other => Err(LlmError::InvalidInput(format!(
            "invalid llm base_url scheme: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};

    #[test]
    fn provider_is_detected_from_model_name() {
        assert_eq!(detect_provider("claude-sonnet-4"), Provider::Anthropic);
        assert_eq!(detect_provider("gpt-4o-mini"), Provider::OpenAI);
        assert_eq!(detect_provider("deepseek-chat"), Provider::OpenAI);
    }

    #[test]
    fn new_rejects_missing_model_or_key() {
        assert!(matches!(
            LlmClient::new("sk-test", "  "),
            Err(LlmError::InvalidInput(_))
        ));
        assert!(matches!(
            LlmClient::new("", "gpt-4o-mini"),
            Err(LlmError::InvalidInput(_))
        ));
    }

    #[test]
    fn base_url_override_is_normalized() {
        let client = LlmClient::new("sk-test", "deepseek-chat")
            .expect("client")
            .with_base_url(Some("https://api.deepseek.com/v1/"))
            .expect("base url");
        assert_eq!(client.base_url(), "https://api.deepseek.com/v1");

        let unchanged = LlmClient::new("sk-test", "gpt-4o-mini")
            .expect("client")
            .with_base_url(Some("   "))
            .expect("blank override is ignored");
        assert_eq!(unchanged.base_url(), OPENAI_BASE_URL);

        assert!(
            LlmClient::new("sk-test", "gpt-4o-mini")
                .expect("client")
                .with_base_url(Some("file:///tmp"))
                .is_err()
        );
    }

    async fn spawn_provider(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake provider");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{addr}/v1")
    }

    #[tokio::test]
    async fn openai_compatible_chat_round_trip() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|Json(body): Json<serde_json::Value>| async move {
                let last = body["messages"]
                    .as_array()
                    .and_then(|m| m.last())
                    .and_then(|m| m["content"].as_str())
                    .unwrap_or_default()
                    .to_string();
                Json(serde_json::json!({
                    "choices": [{
                        "message": { "content": format!("echo: {last}") },
                        "finish_reason": "stop"
                    }],
                    "usage": { "prompt_tokens": 3, "completion_tokens": 2 }
                }))
            }),
        );
        let base = spawn_provider(router).await;
        let client = LlmClient::new("sk-test", "local-model")
            .expect("client")
            .with_base_url(Some(&base))
            .expect("base url");

        let resp = client
            .chat(&[ChatMessage::system("be brief"), ChatMessage::user("hi")])
            .await
            .expect("chat");
        assert_eq!(resp.message.content, "echo: hi");
        assert_eq!(resp.usage.completion_tokens, 2);
        assert_eq!(resp.finish_reason, "stop");
    }

    #[tokio::test]
    async fn non_success_status_is_preserved() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    "{\"error\":{\"message\":\"Rate limit reached\"}}",
                )
            }),
        );
        let base = spawn_provider(router).await;
        let client = LlmClient::new("sk-test", "local-model")
            .expect("client")
            .with_base_url(Some(&base))
            .expect("base url");

        let err = client
            .chat(&[ChatMessage::user("hi")])
            .await
            .expect_err("429 should fail");
        assert_eq!(err.status(), Some(429));
        assert!(err.to_string().contains("Rate limit reached"));
    }
}
