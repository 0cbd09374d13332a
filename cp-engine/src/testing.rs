//! Scripted collaborators for engine tests.

use crate::gate::SendGate;
use crate::lock;
use crate::reply::{ConversationMemory, Exchange, ReplyError, ReplyGenerator};
use async_trait::async_trait;
use cp_channels::{
    ChannelError, ChatSurface, ConversationId, MediaKind, MessageId, MessageKind, MessageRecord,
    RawMessageItem,
};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
pub(crate) struct ScriptedMessage {
    pub id: String,
    pub sender: String,
    pub content: String,
    pub kind: MessageKind,
    pub media: Option<MediaKind>,
}

impl ScriptedMessage {
    pub fn friend(id: &str, sender: &str, content: &str) -> Self {
        Self {
            id: id.to_string(),
            sender: sender.to_string(),
            content: content.to_string(),
            kind: MessageKind::Friend,
            media: None,
        }
    }

    pub fn own(id: &str, content: &str) -> Self {
        Self {
            kind: MessageKind::SelfSent,
            ..Self::friend(id, "me", content)
        }
    }

    pub fn time(id: &str, content: &str) -> Self {
        Self {
            kind: MessageKind::Time,
            ..Self::friend(id, "", content)
        }
    }

    pub fn with_media(mut self, media: MediaKind) -> Self {
        self.media = Some(media);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SentItem {
    Text(String),
    File(PathBuf),
}

#[derive(Default)]
struct ScriptState {
    snapshots: HashMap<ConversationId, Vec<ScriptedMessage>>,
    closed: HashSet<ConversationId>,
    unrecoverable: HashSet<ConversationId>,
    failing_texts: HashSet<String>,
    sent: Vec<(ConversationId, SentItem)>,
    list_calls: HashMap<ConversationId, usize>,
    classify_calls: usize,
    enrich_calls: Vec<(MessageId, MediaKind)>,
    gate_open_during_enrich: Vec<bool>,
    acquired: Vec<ConversationId>,
}

/// In-memory chat client: snapshots are whatever the test put there.
#[derive(Default)]
pub(crate) struct ScriptedSurface {
    state: Mutex<ScriptState>,
    send_latency: Duration,
    observed_gate: Mutex<Option<SendGate>>,
}

impl ScriptedSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_send_latency(mut self, latency: Duration) -> Self {
        self.send_latency = latency;
        self
    }

    pub fn set_snapshot(&self, conversation: &str, messages: Vec<ScriptedMessage>) {
        lock(&self.state)
            .snapshots
            .insert(ConversationId::from(conversation), messages);
    }

    pub fn push(&self, conversation: &str, message: ScriptedMessage) {
        lock(&self.state)
            .snapshots
            .entry(ConversationId::from(conversation))
            .or_default()
            .push(message);
    }

    /// Drop the oldest loaded items, as when the message list scrolls.
    pub fn scroll(&self, conversation: &str, keep_last: usize) {
        let mut state = lock(&self.state);
        if let Some(items) = state.snapshots.get_mut(&ConversationId::from(conversation)) {
            let drop = items.len().saturating_sub(keep_last);
            items.drain(..drop);
        }
    }

    pub fn close(&self, conversation: &str) {
        lock(&self.state)
            .closed
            .insert(ConversationId::from(conversation));
    }

    pub fn make_unrecoverable(&self, conversation: &str) {
        let mut state = lock(&self.state);
        let id = ConversationId::from(conversation);
        state.closed.insert(id.clone());
        state.unrecoverable.insert(id);
    }

    pub fn fail_text(&self, text: &str) {
        lock(&self.state).failing_texts.insert(text.to_string());
    }

    pub fn observe_gate(&self, gate: SendGate) {
        *lock(&self.observed_gate) = Some(gate);
    }

    pub fn sent(&self) -> Vec<(ConversationId, SentItem)> {
        lock(&self.state).sent.clone()
    }

    pub fn sent_texts(&self, conversation: &str) -> Vec<String> {
        lock(&self.state)
            .sent
            .iter()
            .filter(|(c, _)| c.as_str() == conversation)
            .filter_map(|(_, item)| match item {
                SentItem::Text(t) => Some(t.clone()),
                SentItem::File(_) => None,
            })
            .collect()
    }

    pub fn list_calls(&self, conversation: &str) -> usize {
        lock(&self.state)
            .list_calls
            .get(&ConversationId::from(conversation))
            .copied()
            .unwrap_or(0)
    }

    pub fn classify_calls(&self) -> usize {
        lock(&self.state).classify_calls
    }

    pub fn enrich_calls(&self) -> Vec<(MessageId, MediaKind)> {
        lock(&self.state).enrich_calls.clone()
    }

    pub fn gate_open_during_enrich(&self) -> Vec<bool> {
        lock(&self.state).gate_open_during_enrich.clone()
    }

    pub fn acquired(&self) -> Vec<ConversationId> {
        lock(&self.state).acquired.clone()
    }
}

#[async_trait]
impl ChatSurface for ScriptedSurface {
    fn surface_id(&self) -> &str {
        "scripted"
    }

    async fn acquire(&self, conversation: &ConversationId) -> cp_channels::Result<()> {
        let mut state = lock(&self.state);
        if state.unrecoverable.contains(conversation) {
            return Err(ChannelError::Unavailable(format!("{conversation} is gone")));
        }
        state.closed.remove(conversation);
        state.acquired.push(conversation.clone());
        Ok(())
    }

    async fn list_visible_messages(
        &self,
        conversation: &ConversationId,
    ) -> cp_channels::Result<Vec<RawMessageItem>> {
        let mut state = lock(&self.state);
        *state.list_calls.entry(conversation.clone()).or_default() += 1;
        if state.closed.contains(conversation) {
            return Err(ChannelError::Unavailable(format!("{conversation} closed")));
        }
        Ok(state
            .snapshots
            .get(conversation)
            .map(|items| {
                items
                    .iter()
                    .enumerate()
                    .map(|(index, m)| RawMessageItem {
                        raw_id: MessageId::from(m.id.as_str()),
                        control: serde_json::json!({ "index": index }),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn classify(
        &self,
        conversation: &ConversationId,
        item: &RawMessageItem,
    ) -> cp_channels::Result<MessageRecord> {
        let mut state = lock(&self.state);
        state.classify_calls += 1;
        let found = state
            .snapshots
            .get(conversation)
            .and_then(|items| items.iter().find(|m| m.id == item.raw_id.as_str()))
            .cloned()
            .ok_or_else(|| ChannelError::Transient(format!("{} scrolled away", item.raw_id)))?;
        Ok(MessageRecord {
            conversation_id: conversation.clone(),
            message_id: item.raw_id.clone(),
            sender: found.sender,
            content: found.content,
            kind: found.kind,
            media: found.media,
        })
    }

    async fn enrich(
        &self,
        _conversation: &ConversationId,
        item: &RawMessageItem,
        media: MediaKind,
    ) -> cp_channels::Result<String> {
        let gate_open = lock(&self.observed_gate).as_ref().map(SendGate::is_open);
        let mut state = lock(&self.state);
        state.enrich_calls.push((item.raw_id.clone(), media));
        if let Some(open) = gate_open {
            state.gate_open_during_enrich.push(open);
        }
        Ok(format!("saved/{}", item.raw_id))
    }

    async fn send_text(&self, conversation: &ConversationId, text: &str) -> cp_channels::Result<()> {
        if !self.send_latency.is_zero() {
            tokio::time::sleep(self.send_latency).await;
        }
        let mut state = lock(&self.state);
        if state.failing_texts.contains(text) {
            return Err(ChannelError::Transient(format!("could not type {text:?}")));
        }
        state
            .sent
            .push((conversation.clone(), SentItem::Text(text.to_string())));
        Ok(())
    }

    async fn send_file(&self, conversation: &ConversationId, path: &Path) -> cp_channels::Result<()> {
        lock(&self.state)
            .sent
            .push((conversation.clone(), SentItem::File(path.to_path_buf())));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GenerateCall {
    pub conversation: ConversationId,
    pub merged: String,
    pub history_len: usize,
    pub summary: Option<String>,
}

type Script = dyn Fn(&ConversationId, &str) -> Result<String, ReplyError> + Send + Sync;

pub(crate) struct ScriptedGenerator {
    script: Box<Script>,
    latency: Duration,
    calls: Mutex<Vec<GenerateCall>>,
    summarized: Mutex<Vec<Vec<Exchange>>>,
}

impl ScriptedGenerator {
    pub fn new(
        script: impl Fn(&ConversationId, &str) -> Result<String, ReplyError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Box::new(script),
            latency: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            summarized: Mutex::new(Vec::new()),
        }
    }

    pub fn echo() -> Self {
        Self::new(|_, merged| Ok(format!("re: {merged}")))
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> Vec<GenerateCall> {
        lock(&self.calls).clone()
    }

    pub fn summarized(&self) -> Vec<Vec<Exchange>> {
        lock(&self.summarized).clone()
    }
}

#[async_trait]
impl ReplyGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        conversation: &ConversationId,
        merged_content: &str,
        memory: &ConversationMemory,
    ) -> Result<String, ReplyError> {
        lock(&self.calls).push(GenerateCall {
            conversation: conversation.clone(),
            merged: merged_content.to_string(),
            history_len: memory.exchanges.len(),
            summary: memory.summary.clone(),
        });
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        (self.script)(conversation, merged_content)
    }

    async fn summarize(
        &self,
        _conversation: &ConversationId,
        _previous: Option<&str>,
        evicted: &[Exchange],
    ) -> Result<Option<String>, ReplyError> {
        lock(&self.summarized).push(evicted.to_vec());
        let users: Vec<&str> = evicted.iter().map(|e| e.user.as_str()).collect();
        Ok(Some(format!("earlier: {}", users.join(","))))
    }
}
