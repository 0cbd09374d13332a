//! Message dedup, debounced batching and reply dispatch for ChatPilot.
//!
//! Data flow: per-conversation poll tasks diff full snapshots from the
//! [`ChatSurface`](cp_channels::ChatSurface) through a [`DedupWindow`], friend
//! messages accumulate in [`PendingQueues`], an idle scan flushes them as
//! batches to the [`ReplyDispatcher`], and every outbound send goes through
//! one [`SendQueue`] writer.

mod config;
mod dedup;
mod dispatcher;
mod engine;
mod error;
mod gate;
mod listener;
mod queue;
mod reply;
mod sender;
mod stats;

#[cfg(test)]
mod testing;

pub use config::{EngineConfig, FallbackReplies};
pub use dedup::DedupWindow;
pub use dispatcher::ReplyDispatcher;
pub use engine::{Engine, EngineStatus, ListenTargetInfo, PendingQueueInfo};
pub use error::{EngineError, Result};
pub use gate::{SendGate, SendGateHold};
pub use listener::{ListenPhase, Listener};
pub use queue::{FlushedBatch, PendingQueues};
pub use reply::{
    ConversationMemory, Exchange, MemoryStore, ReplyError, ReplyFailureKind, ReplyGenerator,
};
pub use sender::{SendQueue, SendReport, TypingCadence, split_segments};
pub use stats::EngineStatsSnapshot;

/// A worker that panicked while holding a registry lock must not wedge the
/// others; the guarded maps stay structurally valid between mutations.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
