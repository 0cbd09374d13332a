use crate::error::Result;
use crate::types::{ConversationId, MediaKind, MessageRecord, RawMessageItem};
use async_trait::async_trait;
use std::path::Path;

/// Narrow view of the desktop chat client as seen by the engine.
///
/// Implementations own their internal retry loops; anything returned as an
/// error has already exhausted them.
#[async_trait]
pub trait ChatSurface: Send + Sync {
    /// Short identifier used in logs: "http-bridge", "scripted".
    fn surface_id(&self) -> &str;

    /// Open the conversation window, or re-open it after it was closed.
    async fn acquire(&self, conversation: &ConversationId) -> Result<()>;

    /// Full snapshot of the currently loaded message list, oldest first.
    async fn list_visible_messages(
        &self,
        conversation: &ConversationId,
    ) -> Result<Vec<RawMessageItem>>;

    /// Extract sender, content and kind from one snapshot entry.
    async fn classify(
        &self,
        conversation: &ConversationId,
        item: &RawMessageItem,
    ) -> Result<MessageRecord>;

    /// Materialize media for one message and return the replacement content
    /// (saved file path, voice transcription, resolved link card).
    async fn enrich(
        &self,
        conversation: &ConversationId,
        item: &RawMessageItem,
        media: MediaKind,
    ) -> Result<String>;

    async fn send_text(&self, conversation: &ConversationId, text: &str) -> Result<()>;

    async fn send_file(&self, conversation: &ConversationId, path: &Path) -> Result<()>;
}
