use crate::dedup::DedupWindow;
use crate::error::{EngineError, Result};
use crate::gate::SendGate;
use crate::lock;
use crate::stats::EngineStats;
use cp_channels::{
    CaptureFlags, ChatSurface, ConversationId, MediaKind, MessageId, MessageKind, MessageRecord,
    RawMessageItem,
};
use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Where a conversation is in its listening lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenPhase {
    /// Registered, nothing observed yet.
    Uninitialized,
    /// The cold-start snapshot has been marked seen.
    Primed,
    /// Polling past the primed snapshot.
    Steady,
}

#[derive(Debug)]
struct PollCursor {
    phase: ListenPhase,
    last_id: Option<MessageId>,
}

struct ListenTarget {
    flags: CaptureFlags,
    cursor: Arc<tokio::sync::Mutex<PollCursor>>,
}

/// Registry of listened conversations plus the snapshot differ.
///
/// Each conversation has its own cursor lock, held for the whole poll, so
/// polls of one conversation never overlap while different conversations
/// poll concurrently. Dedup windows share one short-lived lock that is
/// never held across a collaborator call.
pub struct Listener {
    surface: Arc<dyn ChatSurface>,
    gate: SendGate,
    dedup_capacity: usize,
    stats: Arc<EngineStats>,
    targets: DashMap<ConversationId, ListenTarget>,
    windows: Mutex<HashMap<ConversationId, DedupWindow>>,
}

impl Listener {
    pub(crate) fn new(
        surface: Arc<dyn ChatSurface>,
        gate: SendGate,
        dedup_capacity: usize,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            surface,
            gate,
            dedup_capacity,
            stats,
            targets: DashMap::new(),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Register a conversation, or update the capture flags of one that is
    /// already registered. Returns `true` when the conversation is new.
    pub async fn add_target(
        &self,
        conversation: &ConversationId,
        flags: CaptureFlags,
    ) -> Result<bool> {
        if let Some(mut existing) = self.targets.get_mut(conversation) {
            existing.flags = flags;
            return Ok(false);
        }

        self.surface.acquire(conversation).await?;

        let mut inserted = false;
        self.targets
            .entry(conversation.clone())
            .and_modify(|t| t.flags = flags)
            .or_insert_with(|| {
                inserted = true;
                ListenTarget {
                    flags,
                    cursor: Arc::new(tokio::sync::Mutex::new(PollCursor {
                        phase: ListenPhase::Uninitialized,
                        last_id: None,
                    })),
                }
            });
        if inserted {
            lock(&self.windows).insert(
                conversation.clone(),
                DedupWindow::new(self.dedup_capacity),
            );
            tracing::info!(conversation = %conversation, ?flags, "listening");
        }
        Ok(inserted)
    }

    /// Forget a conversation together with its dedup window.
    pub fn remove_target(&self, conversation: &ConversationId) -> bool {
        let removed = self.targets.remove(conversation).is_some();
        lock(&self.windows).remove(conversation);
        if removed {
            tracing::info!(conversation = %conversation, "stopped listening");
        }
        removed
    }

    pub fn targets(&self) -> Vec<(ConversationId, CaptureFlags)> {
        let mut out: Vec<_> = self
            .targets
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().flags))
            .collect();
        out.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        out
    }

    pub fn is_listening(&self, conversation: &ConversationId) -> bool {
        self.targets.contains_key(conversation)
    }

    pub async fn phase(&self, conversation: &ConversationId) -> Option<ListenPhase> {
        let cursor = self.targets.get(conversation).map(|t| t.cursor.clone())?;
        let phase = cursor.lock().await.phase;
        Some(phase)
    }

    pub fn remembered_ids(&self, conversation: &ConversationId) -> Option<usize> {
        lock(&self.windows).get(conversation).map(DedupWindow::len)
    }

    /// Poll every registered conversation concurrently. Failures are logged
    /// and count as "nothing new"; only conversations with new messages
    /// appear in the result.
    pub async fn poll_once(&self) -> HashMap<ConversationId, Vec<MessageRecord>> {
        let ids: Vec<ConversationId> = self.targets.iter().map(|e| e.key().clone()).collect();
        let polls = ids.into_iter().map(|id| async move {
            let outcome = self.poll_conversation(&id).await;
            (id, outcome)
        });

        let mut out = HashMap::new();
        for (id, outcome) in join_all(polls).await {
            match outcome {
                Ok(records) if !records.is_empty() => {
                    out.insert(id, records);
                }
                Ok(_) => {}
                Err(err) => self.log_poll_failure(&id, &err),
            }
        }
        out
    }

    pub(crate) fn log_poll_failure(&self, conversation: &ConversationId, err: &EngineError) {
        match err {
            EngineError::UnknownConversation(_) => {
                tracing::debug!(conversation = %conversation, "poll skipped; no longer listening");
            }
            EngineError::ConversationUnavailable(_) => {
                tracing::warn!(conversation = %conversation, "conversation unavailable; deregistered");
            }
            other => {
                EngineStats::add(&self.stats.poll_failures, 1);
                tracing::warn!(conversation = %conversation, error = %other, "poll failed");
            }
        }
    }

    /// Diff the current snapshot of one conversation against what has
    /// already been seen and return the new messages in transcript order.
    pub async fn poll_conversation(
        &self,
        conversation: &ConversationId,
    ) -> Result<Vec<MessageRecord>> {
        let (flags, cursor) = self
            .targets
            .get(conversation)
            .map(|t| (t.flags, t.cursor.clone()))
            .ok_or_else(|| EngineError::UnknownConversation(conversation.clone()))?;
        let mut cursor = cursor.lock().await;

        let snapshot = self.snapshot(conversation).await?;

        if cursor.phase == ListenPhase::Uninitialized {
            self.prime(conversation, &snapshot);
            cursor.last_id = snapshot.last().map(|item| item.raw_id.clone());
            cursor.phase = ListenPhase::Primed;
            tracing::debug!(
                conversation = %conversation,
                seen = snapshot.len(),
                "primed from cold-start snapshot"
            );
            return Ok(Vec::new());
        }
        cursor.phase = ListenPhase::Steady;

        let Some(newest) = snapshot.last() else {
            return Ok(Vec::new());
        };
        if cursor.last_id.as_ref() == Some(&newest.raw_id) {
            return Ok(Vec::new());
        }

        // Items after the last known id. If that id is gone (recalled, or
        // scrolled out of the loaded window), resume after the newest item
        // the dedup window still remembers.
        let start = match cursor
            .last_id
            .as_ref()
            .and_then(|last| snapshot.iter().rposition(|item| &item.raw_id == last))
        {
            Some(pos) => pos + 1,
            None => self.resume_point(conversation, &snapshot),
        };

        // Decided up front: marking ids seen below may evict older ones.
        let fresh = self.fresh_items(conversation, &snapshot[start..]);

        let mut emitted = Vec::new();
        for item in fresh {
            let mut record = match self.surface.classify(conversation, item).await {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!(
                        conversation = %conversation,
                        message = %item.raw_id,
                        error = %err,
                        "classify failed; retrying next poll"
                    );
                    EngineStats::add(&self.stats.emitted_messages, emitted.len() as u64);
                    return Ok(emitted);
                }
            };
            record.message_id = item.raw_id.clone();
            record.conversation_id = conversation.clone();
            self.enrich(conversation, item, flags, &mut record).await;

            self.mark_seen(conversation, item.raw_id.clone());
            cursor.last_id = Some(item.raw_id.clone());
            emitted.push(record);
        }
        cursor.last_id = Some(newest.raw_id.clone());

        EngineStats::add(&self.stats.emitted_messages, emitted.len() as u64);
        Ok(emitted)
    }

    /// Read the full snapshot, re-acquiring the conversation once if its
    /// window went away. A second failure deregisters it.
    async fn snapshot(&self, conversation: &ConversationId) -> Result<Vec<RawMessageItem>> {
        match self.surface.list_visible_messages(conversation).await {
            Ok(items) => return Ok(items),
            Err(err) if err.is_unavailable() => {
                tracing::info!(conversation = %conversation, error = %err, "re-acquiring conversation");
            }
            Err(err) => return Err(err.into()),
        }

        let retried = match self.surface.acquire(conversation).await {
            Ok(()) => self.surface.list_visible_messages(conversation).await,
            Err(err) => Err(err),
        };
        match retried {
            Ok(items) => Ok(items),
            Err(err) if err.is_unavailable() => {
                self.remove_target(conversation);
                Err(EngineError::ConversationUnavailable(conversation.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn enrich(
        &self,
        conversation: &ConversationId,
        item: &RawMessageItem,
        flags: CaptureFlags,
        record: &mut MessageRecord,
    ) {
        if record.kind != MessageKind::Friend {
            return;
        }
        let Some(media) = record.media.filter(|m| flags.allows(*m)) else {
            return;
        };

        // Picture recognition may take a while; replies wait for it.
        let _hold = (media == MediaKind::Picture).then(|| self.gate.hold());
        match self.surface.enrich(conversation, item, media).await {
            Ok(content) => record.content = content,
            Err(err) => tracing::warn!(
                conversation = %conversation,
                message = %record.message_id,
                ?media,
                error = %err,
                "enrichment failed; keeping placeholder"
            ),
        }
    }

    fn prime(&self, conversation: &ConversationId, snapshot: &[RawMessageItem]) {
        let mut windows = lock(&self.windows);
        if let Some(window) = windows.get_mut(conversation) {
            for item in snapshot {
                window.mark_seen(item.raw_id.clone());
            }
        }
    }

    fn resume_point(&self, conversation: &ConversationId, snapshot: &[RawMessageItem]) -> usize {
        let windows = lock(&self.windows);
        let Some(window) = windows.get(conversation) else {
            return 0;
        };
        snapshot
            .iter()
            .rposition(|item| !window.is_new(&item.raw_id))
            .map_or(0, |pos| pos + 1)
    }

    fn fresh_items<'a>(
        &self,
        conversation: &ConversationId,
        items: &'a [RawMessageItem],
    ) -> Vec<&'a RawMessageItem> {
        let windows = lock(&self.windows);
        let Some(window) = windows.get(conversation) else {
            return Vec::new();
        };
        items
            .iter()
            .filter(|item| window.is_new(&item.raw_id))
            .collect()
    }

    fn mark_seen(&self, conversation: &ConversationId, id: MessageId) {
        if let Some(window) = lock(&self.windows).get_mut(conversation) {
            window.mark_seen(id);
        }
    }
}
