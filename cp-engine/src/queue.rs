use crate::lock;
use cp_channels::ConversationId;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Content accumulated for one conversation between flushes.
#[derive(Debug)]
struct PendingQueue {
    entries: VecDeque<String>,
    last_activity: Instant,
}

/// A queue popped by the idle scan, ready for reply generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushedBatch {
    pub conversation_id: ConversationId,
    pub entries: Vec<String>,
}

impl FlushedBatch {
    /// Entries in arrival order, space-joined.
    pub fn merged(&self) -> String {
        self.entries.join(" ")
    }
}

/// Registry of per-conversation pending queues.
///
/// Every structural change (append, evict, pop) happens under one short
/// lock, so an append either lands in the batch being flushed or starts a
/// fresh queue afterwards.
#[derive(Debug)]
pub struct PendingQueues {
    capacity: usize,
    inner: Mutex<HashMap<ConversationId, PendingQueue>>,
}

impl PendingQueues {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Returns how many old entries were dropped to stay within capacity.
    pub fn append(&self, conversation: &ConversationId, content: impl Into<String>) -> usize {
        self.append_at(conversation, content, Instant::now())
    }

    pub fn append_at(
        &self,
        conversation: &ConversationId,
        content: impl Into<String>,
        now: Instant,
    ) -> usize {
        let mut evicted = 0usize;
        {
            let mut guard = lock(&self.inner);
            let queue = guard
                .entry(conversation.clone())
                .or_insert_with(|| PendingQueue {
                    entries: VecDeque::with_capacity(self.capacity + 1),
                    last_activity: now,
                });
            queue.entries.push_back(content.into());
            queue.last_activity = now;
            while queue.entries.len() > self.capacity {
                queue.entries.pop_front();
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::debug!(
                conversation = %conversation,
                evicted,
                capacity = self.capacity,
                "pending queue full; dropped oldest entries"
            );
        }
        evicted
    }

    /// Pop every queue that has been idle for at least `quiet_period`.
    pub fn take_idle(&self, quiet_period: Duration) -> Vec<FlushedBatch> {
        self.take_idle_at(Instant::now(), quiet_period)
    }

    pub fn take_idle_at(&self, now: Instant, quiet_period: Duration) -> Vec<FlushedBatch> {
        let mut popped: Vec<(Instant, ConversationId, PendingQueue)> = {
            let mut guard = lock(&self.inner);
            let due: Vec<ConversationId> = guard
                .iter()
                .filter(|(_, q)| now.saturating_duration_since(q.last_activity) >= quiet_period)
                .map(|(id, _)| id.clone())
                .collect();
            due.into_iter()
                .filter_map(|id| guard.remove(&id).map(|q| (q.last_activity, id, q)))
                .collect()
        };
        popped.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.as_str().cmp(b.1.as_str())));
        popped
            .into_iter()
            .map(|(_, conversation_id, queue)| FlushedBatch {
                conversation_id,
                entries: queue.entries.into_iter().collect(),
            })
            .collect()
    }

    pub fn pending_counts(&self) -> Vec<(ConversationId, usize)> {
        let guard = lock(&self.inner);
        let mut out: Vec<(ConversationId, usize)> = guard
            .iter()
            .map(|(id, q)| (id.clone(), q.entries.len()))
            .collect();
        out.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        out
    }

    pub fn discard(&self, conversation: &ConversationId) -> usize {
        lock(&self.inner)
            .remove(conversation)
            .map_or(0, |q| q.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
