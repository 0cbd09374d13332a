use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct EngineStats {
    pub(crate) emitted_messages: AtomicU64,
    pub(crate) queued_messages: AtomicU64,
    pub(crate) evicted_messages: AtomicU64,
    pub(crate) dispatched_batches: AtomicU64,
    pub(crate) generated_replies: AtomicU64,
    pub(crate) fallback_replies: AtomicU64,
    pub(crate) sent_segments: AtomicU64,
    pub(crate) failed_segments: AtomicU64,
    pub(crate) poll_failures: AtomicU64,
}

impl EngineStats {
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> EngineStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        EngineStatsSnapshot {
            emitted_messages: get(&self.emitted_messages),
            queued_messages: get(&self.queued_messages),
            evicted_messages: get(&self.evicted_messages),
            dispatched_batches: get(&self.dispatched_batches),
            generated_replies: get(&self.generated_replies),
            fallback_replies: get(&self.fallback_replies),
            sent_segments: get(&self.sent_segments),
            failed_segments: get(&self.failed_segments),
            poll_failures: get(&self.poll_failures),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatsSnapshot {
    pub emitted_messages: u64,
    pub queued_messages: u64,
    pub evicted_messages: u64,
    pub dispatched_batches: u64,
    pub generated_replies: u64,
    pub fallback_replies: u64,
    pub sent_segments: u64,
    pub failed_segments: u64,
    pub poll_failures: u64,
}
