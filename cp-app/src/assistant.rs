//! LLM-backed reply generation.
//!
//! Vendor errors are translated into [`ReplyFailureKind`] here and nowhere
//! else; the engine only ever sees the typed kind.

use crate::config::ChatPilotConfig;
use async_trait::async_trait;
use cp_channels::ConversationId;
use cp_engine::{ConversationMemory, Exchange, ReplyError, ReplyFailureKind, ReplyGenerator};
use cp_llm::{ChatMessage, LlmClient, LlmError};
use std::time::Duration;

const SUMMARY_PROMPT: &str = "You maintain a running memory of a chat. Merge the previous \
summary and the new exchanges into at most three short sentences written in the third person. \
Keep names, plans and preferences. Reply with the summary only.";
const MAX_TRANSCRIPT_CHARS: usize = 4_000;

pub struct LlmReplyGenerator {
    llm: LlmClient,
    system_prompt: String,
}

impl LlmReplyGenerator {
    pub fn new(llm: LlmClient, system_prompt: impl Into<String>) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
        }
    }

    pub fn from_config(cfg: &ChatPilotConfig) -> anyhow::Result<Self> {
        let api_key = cfg
            .api_key_for_model()
            .ok_or_else(|| anyhow::anyhow!("no api key for model {}", cfg.general.model))?;
        let llm = LlmClient::new(&api_key, &cfg.general.model)?
            .with_base_url(cfg.llm.base_url.as_deref())?
            .with_timeout(Duration::from_millis(cfg.llm.timeout_ms))?
            .with_max_tokens(cfg.llm.max_tokens);
        tracing::info!(
            model = %llm.model(),
            provider = ?llm.provider(),
            base_url = %llm.base_url(),
            "llm client initialized"
        );
        Ok(Self::new(llm, cfg.general.system_prompt.clone()))
    }

    fn build_messages(&self, merged: &str, memory: &ConversationMemory) -> Vec<ChatMessage> {
        let mut system = self.system_prompt.clone();
        if let Some(summary) = memory.summary.as_deref() {
            system.push_str("\n\nWhat you remember about this chat:\n");
            system.push_str(summary);
        }

        let mut messages = Vec::with_capacity(2 + memory.exchanges.len() * 2);
        messages.push(ChatMessage::system(system));
        for exchange in &memory.exchanges {
            messages.push(ChatMessage::user(exchange.user.clone()));
            messages.push(ChatMessage::assistant(exchange.assistant.clone()));
        }
        messages.push(ChatMessage::user(merged));
        messages
    }
}

#[async_trait]
impl ReplyGenerator for LlmReplyGenerator {
    #[tracing::instrument(level = "debug", skip_all, fields(conversation = %conversation))]
    async fn generate(
        &self,
        conversation: &ConversationId,
        merged_content: &str,
        memory: &ConversationMemory,
    ) -> Result<String, ReplyError> {
        let messages = self.build_messages(merged_content, memory);
        let response = self
            .llm
            .chat(&messages)
            .await
            .map_err(|e| classify_llm_error(&e))?;
        tracing::debug!(
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            finish_reason = %response.finish_reason,
            "reply generated"
        );
        Ok(response.message.content.trim().to_string())
    }

    async fn summarize(
        &self,
        _conversation: &ConversationId,
        previous: Option<&str>,
        evicted: &[Exchange],
    ) -> Result<Option<String>, ReplyError> {
        let transcript = render_transcript(previous, evicted, MAX_TRANSCRIPT_CHARS);
        let response = self
            .llm
            .chat(&[
                ChatMessage::system(SUMMARY_PROMPT),
                ChatMessage::user(transcript),
            ])
            .await
            .map_err(|e| classify_llm_error(&e))?;
        let summary = response.message.content.trim().to_string();
        if summary.is_empty() {
            return Ok(previous.map(ToOwned::to_owned));
        }
        Ok(Some(summary))
    }
}

/// Map a vendor error onto the user-facing failure taxonomy.
pub fn classify_llm_error(err: &LlmError) -> ReplyError {
    let message = err.to_string();
    let lower = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    let kind = if matches!(err.status(), Some(401 | 403))
        || has(&["invalid api key", "invalid_api_key", "incorrect api key", "unauthorized"])
    {
        ReplyFailureKind::Auth
    } else if has(&["insufficient_quota", "billing", "exceeded your current quota"]) {
        ReplyFailureKind::Quota
    } else if err.status() == Some(429) || has(&["rate limit", "rate_limit"]) {
        ReplyFailureKind::RateLimit
    } else if has(&["content_policy", "content_filter", "safety"]) {
        ReplyFailureKind::ContentPolicy
    } else if matches!(err, LlmError::Timeout(_)) || has(&["timed out", "timeout"]) {
        ReplyFailureKind::Timeout
    } else if matches!(err, LlmError::Connect(_) | LlmError::Http(_))
        || err.status().is_some_and(|s| s >= 500)
    {
        ReplyFailureKind::Network
    } else {
        ReplyFailureKind::Unknown
    };
    ReplyError::new(kind, message)
}

fn render_transcript(previous: Option<&str>, evicted: &[Exchange], max_chars: usize) -> String {
    let mut out = String::new();
    if let Some(summary) = previous.map(str::trim).filter(|s| !s.is_empty()) {
        out.push_str("[previous summary] ");
        out.push_str(summary);
    }
    for exchange in evicted {
        for (who, text) in [("user", &exchange.user), ("assistant", &exchange.assistant)] {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push('[');
            out.push_str(who);
            out.push_str("] ");
            out.push_str(text.trim());
        }
        if out.chars().count() >= max_chars {
            let truncated: String = out.chars().take(max_chars).collect();
            return format!("{truncated}\n...[truncated]");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use cp_llm::Role;
    use std::collections::VecDeque;

    fn status(code: u16, body: &str) -> LlmError {
        LlmError::Status {
            status: code,
            body: body.to_string(),
        }
    }

    #[test]
    fn vendor_errors_map_to_failure_kinds() {
        let cases = [
            (status(401, "bad key"), ReplyFailureKind::Auth),
            (status(400, "Incorrect API key provided"), ReplyFailureKind::Auth),
            (
                status(429, r#"{"error":{"code":"insufficient_quota"}}"#),
                ReplyFailureKind::Quota,
            ),
            (status(429, "slow down"), ReplyFailureKind::RateLimit),
            (status(400, "rate_limit_error"), ReplyFailureKind::RateLimit),
            (
                status(400, "flagged by content_filter"),
                ReplyFailureKind::ContentPolicy,
            ),
            (LlmError::Timeout("deadline".into()), ReplyFailureKind::Timeout),
            (LlmError::Connect("refused".into()), ReplyFailureKind::Network),
            (status(503, "overloaded"), ReplyFailureKind::Network),
            (
                LlmError::ResponseFormat("missing choices".into()),
                ReplyFailureKind::Unknown,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(classify_llm_error(&err).kind, expected, "{err}");
        }
    }

    fn generator(base_url: Option<&str>) -> LlmReplyGenerator {
        let llm = LlmClient::new("sk-test", "local-model")
            .expect("client")
            .with_base_url(base_url)
            .expect("base url");
        LlmReplyGenerator::new(llm, "be kind")
    }

    #[test]
    fn prompt_carries_summary_and_history_in_order() {
        let memory = ConversationMemory {
            summary: Some("Alice likes cats.".to_string()),
            exchanges: VecDeque::from(vec![Exchange {
                user: "hi".to_string(),
                assistant: "hello!".to_string(),
            }]),
        };
        let messages = generator(None).build_messages("how are you", &memory);
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::User]);
        assert!(messages[0].content.starts_with("be kind"));
        assert!(messages[0].content.contains("Alice likes cats."));
        assert_eq!(messages[3].content, "how are you");
    }

    #[test]
    fn transcript_is_truncated() {
        let evicted: Vec<Exchange> = (0..50)
            .map(|i| Exchange {
                user: format!("question number {i}"),
                assistant: format!("answer number {i}"),
            })
            .collect();
        let out = render_transcript(Some("old"), &evicted, 200);
        assert!(out.starts_with("[previous summary] old"));
        assert!(out.ends_with("...[truncated]"));
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
    async fn generates_and_classifies_against_a_provider() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|Json(body): Json<serde_json::Value>| async move {
                let last = body["messages"]
                    .as_array()
                    .and_then(|m| m.last())
                    .and_then(|m| m["content"].as_str())
                    .unwrap_or_default()
                    .to_string();
                if last == "too fast" {
                    return Err((StatusCode::TOO_MANY_REQUESTS, "Rate limit reached".to_string()));
                }
                Ok(Json(serde_json::json!({
                    "choices": [{
                        "message": { "content": format!("  sure: {last} || anything else? ") },
                        "finish_reason": "stop"
                    }]
                })))
            }),
        );
        let base = spawn_provider(router).await;
        let generator = generator(Some(&base));
        let alice = ConversationId::from("Alice");

        let reply = generator
            .generate(&alice, "hi how are you", &ConversationMemory::default())
            .await
            .expect("reply");
        assert_eq!(reply, "sure: hi how are you || anything else?");

        let err = generator
            .generate(&alice, "too fast", &ConversationMemory::default())
            .await
            .expect_err("rate limited");
        assert_eq!(err.kind, ReplyFailureKind::RateLimit);

        let summary = generator
            .summarize(
                &alice,
                None,
                &[Exchange {
                    user: "u".to_string(),
                    assistant: "a".to_string(),
                }],
            )
            .await
            .expect("summary");
        assert!(summary.is_some());
    }
}
