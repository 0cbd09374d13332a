use async_trait::async_trait;
use cp_channels::ConversationId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;

/// User-facing categories of reply-generation failure. The adapter that
/// talks to the model vendor decides which one applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyFailureKind {
    Auth,
    Quota,
    RateLimit,
    ContentPolicy,
    Timeout,
    Network,
    Unknown,
}

impl ReplyFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Quota => "quota",
            Self::RateLimit => "rate_limit",
            Self::ContentPolicy => "content_policy",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Unknown => "unknown",
        }
    }

    /// Operator-actionable kinds (bad key, exhausted quota, unexplained
    /// failures) log as errors; expected turbulence logs as warnings.
    pub fn log_level(&self) -> tracing::Level {
        match self {
            Self::Auth | Self::Quota | Self::Unknown => tracing::Level::ERROR,
            Self::RateLimit | Self::ContentPolicy | Self::Timeout | Self::Network => {
                tracing::Level::WARN
            }
        }
    }
}

impl fmt::Display for ReplyFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ReplyError {
    pub kind: ReplyFailureKind,
    pub message: String,
}

impl ReplyError {
    pub fn new(kind: ReplyFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// One user batch and the reply that answered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub user: String,
    pub assistant: String,
}

/// Bounded conversation history handed to the reply generator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMemory {
    pub summary: Option<String>,
    pub exchanges: VecDeque<Exchange>,
}

impl ConversationMemory {
    /// Push an exchange and return whatever fell out of the window.
    pub fn record(&mut self, exchange: Exchange, capacity: usize) -> Vec<Exchange> {
        self.exchanges.push_back(exchange);
        let mut evicted = Vec::new();
        while self.exchanges.len() > capacity {
            if let Some(old) = self.exchanges.pop_front() {
                evicted.push(old);
            }
        }
        evicted
    }
}

#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(
        &self,
        conversation: &ConversationId,
        merged_content: &str,
        memory: &ConversationMemory,
    ) -> Result<String, ReplyError>;

    /// Fold exchanges that left the history window into the rolling summary.
    async fn summarize(
        &self,
        _conversation: &ConversationId,
        previous: Option<&str>,
        _evicted: &[Exchange],
    ) -> Result<Option<String>, ReplyError> {
        Ok(previous.map(ToOwned::to_owned))
    }
}

/// Per-conversation memories, process-lifetime only.
pub struct MemoryStore {
    capacity: usize,
    inner: DashMap<ConversationId, ConversationMemory>,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: DashMap::new(),
        }
    }

    pub fn snapshot(&self, conversation: &ConversationId) -> ConversationMemory {
        self.inner
            .get(conversation)
            .map(|m| m.value().clone())
            .unwrap_or_default()
    }

    pub fn record(&self, conversation: &ConversationId, exchange: Exchange) -> Vec<Exchange> {
        if self.capacity == 0 {
            return vec![exchange];
        }
        self.inner
            .entry(conversation.clone())
            .or_default()
            .record(exchange, self.capacity)
    }

    pub fn set_summary(&self, conversation: &ConversationId, summary: Option<String>) {
        let summary = summary
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        self.inner.entry(conversation.clone()).or_default().summary = summary;
    }

    pub fn reset(&self, conversation: &ConversationId) -> bool {
        self.inner.remove(conversation).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(i: usize) -> Exchange {
        Exchange {
            user: format!("u{i}"),
            assistant: format!("a{i}"),
        }
    }

    #[test]
    fn memory_window_keeps_latest_exchanges() {
        let store = MemoryStore::new(2);
        let alice = ConversationId::from("Alice");
        assert!(store.record(&alice, exchange(1)).is_empty());
        assert!(store.record(&alice, exchange(2)).is_empty());
        let evicted = store.record(&alice, exchange(3));
        assert_eq!(evicted, vec![exchange(1)]);

        let snapshot = store.snapshot(&alice);
        let users: Vec<&str> = snapshot.exchanges.iter().map(|e| e.user.as_str()).collect();
        assert_eq!(users, vec!["u2", "u3"]);
    }

    #[test]
    fn summary_is_trimmed_and_reset_clears_everything() {
        let store = MemoryStore::new(5);
        let alice = ConversationId::from("Alice");
        store.record(&alice, exchange(1));
        store.set_summary(&alice, Some("  likes cats ".to_string()));
        assert_eq!(store.snapshot(&alice).summary.as_deref(), Some("likes cats"));

        store.set_summary(&alice, Some("   ".to_string()));
        assert_eq!(store.snapshot(&alice).summary, None);

        assert!(store.reset(&alice));
        assert_eq!(store.snapshot(&alice), ConversationMemory::default());
        assert!(!store.reset(&alice));
    }

    #[test]
    fn failure_kinds_log_at_distinct_severities() {
        assert_eq!(ReplyFailureKind::Auth.log_level(), tracing::Level::ERROR);
        assert_eq!(ReplyFailureKind::RateLimit.log_level(), tracing::Level::WARN);
        assert_eq!(
            ReplyError::new(ReplyFailureKind::Quota, "billing").to_string(),
            "quota: billing"
        );
    }
}
