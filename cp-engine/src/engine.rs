use crate::config::EngineConfig;
use crate::dispatcher::{DispatchSettings, ReplyDispatcher};
use crate::error::{EngineError, Result};
use crate::gate::SendGate;
use crate::listener::{ListenPhase, Listener};
use crate::lock;
use crate::queue::PendingQueues;
use crate::reply::{MemoryStore, ReplyGenerator};
use crate::sender::{SendQueue, SendReport, SenderSettings};
use crate::stats::{EngineStats, EngineStatsSnapshot};
use cp_channels::{CaptureFlags, ChatSurface, ConversationId, MessageKind, MessageRecord};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize)]
pub struct ListenTargetInfo {
    pub conversation_id: ConversationId,
    pub capture: CaptureFlags,
    pub phase: Option<ListenPhase>,
    pub remembered_ids: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingQueueInfo {
    pub conversation_id: ConversationId,
    pub entries: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub surface: String,
    pub targets: Vec<ListenTargetInfo>,
    pub pending: Vec<PendingQueueInfo>,
    pub send_gate_open: bool,
    pub reply_lanes: usize,
    pub stats: EngineStatsSnapshot,
}

struct PollTask {
    generation: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Everything the background workers share.
struct EngineState {
    config: EngineConfig,
    surface_id: String,
    listener: Listener,
    queues: PendingQueues,
    dispatcher: ReplyDispatcher,
    send_queue: SendQueue,
    gate: SendGate,
    stats: Arc<EngineStats>,
    poll_tasks: DashMap<ConversationId, PollTask>,
    next_generation: AtomicU64,
}

impl EngineState {
    /// Friend messages feed the pending queues; everything else is only
    /// observed.
    fn route(&self, conversation: &ConversationId, records: &[MessageRecord]) {
        for record in records {
            match record.kind {
                MessageKind::Friend if !record.content.trim().is_empty() => {
                    let evicted = self.queues.append(conversation, record.content.clone());
                    EngineStats::add(&self.stats.queued_messages, 1);
                    EngineStats::add(&self.stats.evicted_messages, evicted as u64);
                }
                kind => tracing::debug!(
                    conversation = %conversation,
                    message = %record.message_id,
                    kind = kind.as_str(),
                    "observed message not queued"
                ),
            }
        }
    }
}

/// The running dedup / debounce / reply pipeline.
pub struct Engine {
    state: Arc<EngineState>,
    shutdown: CancellationToken,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Validate the config and spawn the send writer and debounce scanner.
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: EngineConfig,
        surface: Arc<dyn ChatSurface>,
        generator: Arc<dyn ReplyGenerator>,
    ) -> Result<Self> {
        config.validate()?;

        let shutdown = CancellationToken::new();
        let stats = Arc::new(EngineStats::default());
        let gate = SendGate::new();

        let (send_queue, writer) = SendQueue::spawn(
            surface.clone(),
            SenderSettings {
                send_timeout: config.send_timeout,
                typing: config.typing,
            },
            stats.clone(),
            shutdown.child_token(),
        );
        let dispatcher = ReplyDispatcher::new(
            generator,
            MemoryStore::new(config.history_exchanges),
            send_queue.clone(),
            gate.clone(),
            stats.clone(),
            DispatchSettings {
                reply_timeout: config.reply_timeout,
                segment_delimiter: config.segment_delimiter.clone(),
                fallback_replies: config.fallback_replies.clone(),
            },
            shutdown.child_token(),
        );
        let listener = Listener::new(
            surface.clone(),
            gate.clone(),
            config.dedup_capacity,
            stats.clone(),
        );

        let state = Arc::new(EngineState {
            surface_id: surface.surface_id().to_string(),
            queues: PendingQueues::new(config.queue_capacity),
            config,
            listener,
            dispatcher,
            send_queue,
            gate,
            stats,
            poll_tasks: DashMap::new(),
            next_generation: AtomicU64::new(0),
        });

        let scanner = tokio::spawn(scan_loop(state.clone(), shutdown.child_token()));
        tracing::info!(
            surface = %state.surface_id,
            quiet_period_ms = state.config.quiet_period.as_millis() as u64,
            poll_interval_ms = state.config.poll_interval.as_millis() as u64,
            "engine started"
        );

        Ok(Self {
            state,
            shutdown,
            background_tasks: Mutex::new(vec![writer, scanner]),
        })
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Start listening to a conversation. The cold-start snapshot is taken
    /// before this returns, so history already on screen is never answered.
    /// Calling it again for a listened conversation only updates its flags.
    pub async fn add_listen_target(
        &self,
        conversation: &ConversationId,
        flags: CaptureFlags,
    ) -> Result<()> {
        self.ensure_running()?;
        if conversation.trim().is_empty() {
            return Err(EngineError::InvalidRequest(
                "conversation id must not be empty".to_string(),
            ));
        }
        if !self.state.listener.add_target(conversation, flags).await? {
            return Ok(());
        }
        if let Err(err) = self.state.listener.poll_conversation(conversation).await {
            self.state.listener.remove_target(conversation);
            return Err(err);
        }
        self.spawn_poll_task(conversation);
        Ok(())
    }

    /// Stop listening and drop anything still pending for the conversation.
    pub fn remove_listen_target(&self, conversation: &ConversationId) -> bool {
        if let Some((_, task)) = self.state.poll_tasks.remove(conversation) {
            task.token.cancel();
        }
        let removed = self.state.listener.remove_target(conversation);
        let discarded = self.state.queues.discard(conversation);
        if discarded > 0 {
            tracing::debug!(conversation = %conversation, discarded, "pending entries discarded");
        }
        removed
    }

    pub async fn listen_targets(&self) -> Vec<ListenTargetInfo> {
        let mut out = Vec::new();
        for (conversation_id, capture) in self.state.listener.targets() {
            let phase = self.state.listener.phase(&conversation_id).await;
            let remembered_ids = self
                .state
                .listener
                .remembered_ids(&conversation_id)
                .unwrap_or(0);
            out.push(ListenTargetInfo {
                conversation_id,
                capture,
                phase,
                remembered_ids,
            });
        }
        out
    }

    /// Poll every listened conversation right now, route the results like
    /// the background loops do, and return what was new.
    pub async fn poll_once(&self) -> Result<HashMap<ConversationId, Vec<MessageRecord>>> {
        self.ensure_running()?;
        let polled = self.state.listener.poll_once().await;
        for (conversation, records) in &polled {
            self.state.route(conversation, records);
        }
        Ok(polled)
    }

    /// Send driver-provided text verbatim through the single writer.
    pub async fn send_text(&self, conversation: &ConversationId, text: &str) -> Result<SendReport> {
        self.ensure_running()?;
        if text.trim().is_empty() {
            return Err(EngineError::InvalidRequest("text must not be empty".to_string()));
        }
        self.state
            .send_queue
            .send_segments(conversation, vec![text.to_string()])
            .await
    }

    pub async fn send_file(&self, conversation: &ConversationId, path: PathBuf) -> Result<SendReport> {
        self.ensure_running()?;
        if path.as_os_str().is_empty() {
            return Err(EngineError::InvalidRequest("file path must not be empty".to_string()));
        }
        self.state.send_queue.send_file(conversation, path).await
    }

    pub fn reset_memory(&self, conversation: &ConversationId) -> bool {
        self.state.dispatcher.memory().reset(conversation)
    }

    /// Gate shared with enrichment; drivers may hold it too.
    pub fn send_gate(&self) -> SendGate {
        self.state.gate.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.state.config
    }

    pub async fn status(&self) -> EngineStatus {
        EngineStatus {
            running: self.is_running(),
            surface: self.state.surface_id.clone(),
            targets: self.listen_targets().await,
            pending: self
                .state
                .queues
                .pending_counts()
                .into_iter()
                .map(|(conversation_id, entries)| PendingQueueInfo {
                    conversation_id,
                    entries,
                })
                .collect(),
            send_gate_open: self.state.gate.is_open(),
            reply_lanes: self.state.dispatcher.active_lanes(),
            stats: self.state.stats.snapshot(),
        }
    }

    /// Cancel every worker and wait up to `shutdown_grace` for them. A send
    /// already handed to the chat surface completes; queued work is dropped.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let mut handles: Vec<JoinHandle<()>> = {
            let keys: Vec<ConversationId> = self
                .state
                .poll_tasks
                .iter()
                .map(|e| e.key().clone())
                .collect();
            keys.iter()
                .filter_map(|k| self.state.poll_tasks.remove(k))
                .map(|(_, task)| task.handle)
                .collect()
        };
        handles.extend(self.state.dispatcher.take_handles());
        handles.extend(std::mem::take(&mut *lock(&self.background_tasks)));

        let grace = self.state.config.shutdown_grace;
        let joined = tokio::time::timeout(grace, async {
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::warn!(error = %e, "engine task join failed");
                }
            }
        })
        .await;
        if joined.is_err() {
            tracing::warn!(grace_ms = grace.as_millis() as u64, "timed out waiting for engine tasks");
        }
        tracing::info!("engine stopped");
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            Err(EngineError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn spawn_poll_task(&self, conversation: &ConversationId) {
        let generation = self.state.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        let handle = tokio::spawn(poll_loop(
            self.state.clone(),
            conversation.clone(),
            generation,
            token.clone(),
        ));
        if let Some(previous) = self.state.poll_tasks.insert(
            conversation.clone(),
            PollTask {
                generation,
                token,
                handle,
            },
        ) {
            previous.token.cancel();
        }
    }
}

/// Fixed-cadence poll of one conversation. A poll always finishes before
/// the next tick is taken; late ticks are not replayed.
async fn poll_loop(
    state: Arc<EngineState>,
    conversation: ConversationId,
    generation: u64,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(state.config.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the target was primed already.
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        match state.listener.poll_conversation(&conversation).await {
            Ok(records) => state.route(&conversation, &records),
            Err(
                err @ (EngineError::ConversationUnavailable(_) | EngineError::UnknownConversation(_)),
            ) => {
                state.listener.log_poll_failure(&conversation, &err);
                state
                    .queues
                    .discard(&conversation);
                break;
            }
            Err(err) => state.listener.log_poll_failure(&conversation, &err),
        }
    }

    state
        .poll_tasks
        .remove_if(&conversation, |_, task| task.generation == generation);
    tracing::debug!(conversation = %conversation, "poll loop stopped");
}

/// Periodic idle scan: every queue quiet for `quiet_period` is popped and
/// handed to the dispatcher exactly once.
async fn scan_loop(state: Arc<EngineState>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(state.config.scan_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        for batch in state.queues.take_idle(state.config.quiet_period) {
            tracing::debug!(
                conversation = %batch.conversation_id,
                entries = batch.entries.len(),
                "conversation idle; flushing"
            );
            state.dispatcher.dispatch(batch);
        }
    }
    tracing::debug!("debounce scan stopped");
}
