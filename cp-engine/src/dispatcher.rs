use crate::config::FallbackReplies;
use crate::gate::SendGate;
use crate::lock;
use crate::queue::FlushedBatch;
use crate::reply::{Exchange, MemoryStore, ReplyError, ReplyFailureKind, ReplyGenerator};
use crate::sender::{SendQueue, split_segments};
use crate::stats::EngineStats;
use cp_channels::ConversationId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub(crate) struct DispatchSettings {
    pub reply_timeout: Duration,
    pub segment_delimiter: String,
    pub fallback_replies: FallbackReplies,
}

struct DispatchContext {
    generator: Arc<dyn ReplyGenerator>,
    memory: MemoryStore,
    send_queue: SendQueue,
    gate: SendGate,
    stats: Arc<EngineStats>,
    settings: DispatchSettings,
    shutdown: CancellationToken,
}

struct Lane {
    tx: mpsc::UnboundedSender<FlushedBatch>,
    handle: JoinHandle<()>,
}

/// Turns flushed batches into replies.
///
/// Every conversation gets its own lane task: batches for one conversation
/// are generated and sent strictly one after another, while different
/// conversations generate concurrently and only meet in the send queue.
pub struct ReplyDispatcher {
    ctx: Arc<DispatchContext>,
    lanes: Mutex<HashMap<ConversationId, Lane>>,
}

impl ReplyDispatcher {
    pub(crate) fn new(
        generator: Arc<dyn ReplyGenerator>,
        memory: MemoryStore,
        send_queue: SendQueue,
        gate: SendGate,
        stats: Arc<EngineStats>,
        settings: DispatchSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx: Arc::new(DispatchContext {
                generator,
                memory,
                send_queue,
                gate,
                stats,
                settings,
                shutdown,
            }),
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Hand a batch to its conversation's lane. Returns immediately.
    pub fn dispatch(&self, batch: FlushedBatch) {
        if self.ctx.shutdown.is_cancelled() {
            tracing::debug!(conversation = %batch.conversation_id, "dispatcher stopped; batch dropped");
            return;
        }
        let mut lanes = lock(&self.lanes);
        let batch = match lanes.get(&batch.conversation_id) {
            Some(lane) => match lane.tx.send(batch) {
                Ok(()) => return,
                Err(mpsc::error::SendError(batch)) => batch,
            },
            None => batch,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let conversation = batch.conversation_id.clone();
        let handle = tokio::spawn(run_lane(self.ctx.clone(), conversation.clone(), rx));
        // The receiver was just created and is alive.
        let _ = tx.send(batch);
        lanes.insert(conversation, Lane { tx, handle });
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.ctx.memory
    }

    pub fn active_lanes(&self) -> usize {
        lock(&self.lanes)
            .values()
            .filter(|lane| !lane.handle.is_finished())
            .count()
    }

    pub(crate) fn take_handles(&self) -> Vec<JoinHandle<()>> {
        lock(&self.lanes).drain().map(|(_, lane)| lane.handle).collect()
    }
}

async fn run_lane(
    ctx: Arc<DispatchContext>,
    conversation: ConversationId,
    mut rx: mpsc::UnboundedReceiver<FlushedBatch>,
) {
    loop {
        let batch = tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => break,
            batch = rx.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
        };
        handle_batch(&ctx, batch).await;
    }
    tracing::debug!(conversation = %conversation, "reply lane stopped");
}

async fn handle_batch(ctx: &DispatchContext, batch: FlushedBatch) {
    let conversation = batch.conversation_id.clone();
    let merged = batch.merged();
    EngineStats::add(&ctx.stats.dispatched_batches, 1);
    tracing::debug!(
        conversation = %conversation,
        entries = batch.entries.len(),
        "generating reply"
    );

    let memory = ctx.memory.snapshot(&conversation);
    let reply_timeout = ctx.settings.reply_timeout;
    let generated = tokio::select! {
        biased;
        _ = ctx.shutdown.cancelled() => return,
        out = tokio::time::timeout(
            reply_timeout,
            ctx.generator.generate(&conversation, &merged, &memory),
        ) => out,
    };
    let delimiter = ctx.settings.segment_delimiter.as_str();
    let outcome = match generated {
        Ok(Ok(text)) => {
            let segments = split_segments(&text, delimiter);
            if segments.is_empty() {
                Err(ReplyError::new(ReplyFailureKind::Unknown, "empty reply"))
            } else {
                Ok((text, segments))
            }
        }
        Ok(Err(err)) => Err(err),
        Err(_) => Err(ReplyError::new(
            ReplyFailureKind::Timeout,
            format!("no reply within {reply_timeout:?}"),
        )),
    };

    let (reply, segments, is_generated) = match outcome {
        Ok((text, segments)) => {
            EngineStats::add(&ctx.stats.generated_replies, 1);
            (text, segments, true)
        }
        Err(err) => {
            log_reply_failure(&conversation, &err);
            EngineStats::add(&ctx.stats.fallback_replies, 1);
            let fallback = ctx.settings.fallback_replies.for_kind(err.kind).to_string();
            let segments = split_segments(&fallback, delimiter);
            (fallback, segments, false)
        }
    };

    // Only reachable when the configured fallback text is itself blank.
    if segments.is_empty() {
        tracing::warn!(conversation = %conversation, "reply has no sendable segments");
        return;
    }

    if !ctx.gate.is_open() {
        tracing::debug!(
            conversation = %conversation,
            outstanding = ctx.gate.outstanding(),
            "send gate closed; waiting"
        );
    }
    tokio::select! {
        biased;
        _ = ctx.shutdown.cancelled() => {
            tracing::info!(conversation = %conversation, "shutting down; reply not sent");
            return;
        }
        _ = ctx.gate.wait_open() => {}
    }

    match ctx.send_queue.send_segments(&conversation, segments).await {
        Ok(report) if report.is_complete() => {
            tracing::info!(conversation = %conversation, segments = report.delivered, "reply sent");
        }
        Ok(report) => {
            tracing::warn!(
                conversation = %conversation,
                delivered = report.delivered,
                failed = report.failed,
                "reply partially sent"
            );
        }
        Err(err) => {
            tracing::warn!(conversation = %conversation, error = %err, "reply not sent");
            return;
        }
    }

    if is_generated {
        remember(ctx, &conversation, merged, reply).await;
    }
}

async fn remember(ctx: &DispatchContext, conversation: &ConversationId, user: String, assistant: String) {
    let evicted = ctx.memory.record(conversation, Exchange { user, assistant });
    if evicted.is_empty() {
        return;
    }
    let previous = ctx.memory.snapshot(conversation).summary;
    let summarized = tokio::time::timeout(
        ctx.settings.reply_timeout,
        ctx.generator
            .summarize(conversation, previous.as_deref(), &evicted),
    )
    .await;
    match summarized {
        Ok(Ok(summary)) => ctx.memory.set_summary(conversation, summary),
        Ok(Err(err)) => {
            tracing::debug!(conversation = %conversation, error = %err, "summary not updated");
        }
        Err(_) => tracing::debug!(conversation = %conversation, "summary timed out"),
    }
}

fn log_reply_failure(conversation: &ConversationId, err: &ReplyError) {
    if err.kind.log_level() == tracing::Level::ERROR {
        tracing::error!(
            conversation = %conversation,
            kind = %err.kind,
            error = %err.message,
            "reply generation failed; sending fallback"
        );
    } else {
        tracing::warn!(
            conversation = %conversation,
            kind = %err.kind,
            error = %err.message,
            "reply generation failed; sending fallback"
        );
    }
}
