use cp_channels::MessageId;
use std::collections::{HashSet, VecDeque};

/// Bounded set of recently seen message ids for one conversation.
///
/// Polls re-read the whole loaded message list, so "new since last look"
/// is reconstructed from membership here. Insertion order is kept so the
/// least recently inserted id is evicted first.
#[derive(Debug, Clone)]
pub struct DedupWindow {
    capacity: usize,
    order: VecDeque<MessageId>,
    seen: HashSet<MessageId>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity + 1),
            seen: HashSet::with_capacity(capacity + 1),
        }
    }

    pub fn is_new(&self, id: &MessageId) -> bool {
        !self.seen.contains(id)
    }

    pub fn mark_seen(&mut self, id: MessageId) {
        if self.seen.insert(id.clone()) {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
