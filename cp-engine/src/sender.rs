use crate::error::{EngineError, Result};
use crate::stats::EngineStats;
use cp_channels::{ChatSurface, ConversationId};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Pause inserted before each reply segment after the first, so multi-part
/// replies read like someone typing them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingCadence {
    pub per_char: Duration,
    pub floor: Duration,
    pub cap: Duration,
}

impl Default for TypingCadence {
    fn default() -> Self {
        Self {
            per_char: Duration::from_millis(120),
            floor: Duration::from_millis(800),
            cap: Duration::from_secs(6),
        }
    }
}

impl TypingCadence {
    pub fn delay_for(&self, segment: &str) -> Duration {
        let chars = u32::try_from(segment.chars().count()).unwrap_or(u32::MAX);
        self.per_char
            .saturating_mul(chars)
            .clamp(self.floor, self.cap.max(self.floor))
    }
}

/// Split a generated reply on `delimiter`, dropping blank parts.
pub fn split_segments(reply: &str, delimiter: &str) -> Vec<String> {
    if delimiter.is_empty() {
        let trimmed = reply.trim();
        return if trimmed.is_empty() {
            Vec::new()
        } else {
            vec![trimmed.to_string()]
        };
    }
    reply
        .split(delimiter)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Outcome of one send job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SendReport {
    pub delivered: usize,
    pub failed: usize,
}

impl SendReport {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug)]
enum OutboundPayload {
    Segments(Vec<String>),
    File(PathBuf),
}

struct SendJob {
    conversation_id: ConversationId,
    payload: OutboundPayload,
    done: oneshot::Sender<SendReport>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SenderSettings {
    pub send_timeout: Duration,
    pub typing: TypingCadence,
}

/// Handle to the single writer that owns the outbound side of the chat
/// client. Jobs run one at a time in submission order, and all segments of
/// a job go out before the next job starts.
#[derive(Clone)]
pub struct SendQueue {
    tx: mpsc::UnboundedSender<SendJob>,
}

impl SendQueue {
    pub(crate) fn spawn(
        surface: Arc<dyn ChatSurface>,
        settings: SenderSettings,
        stats: Arc<EngineStats>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(writer_loop(surface, settings, stats, shutdown, rx));
        (Self { tx }, handle)
    }

    pub async fn send_segments(
        &self,
        conversation: &ConversationId,
        segments: Vec<String>,
    ) -> Result<SendReport> {
        if segments.is_empty() {
            return Ok(SendReport::default());
        }
        self.submit(conversation, OutboundPayload::Segments(segments))
            .await
    }

    pub async fn send_file(
        &self,
        conversation: &ConversationId,
        path: PathBuf,
    ) -> Result<SendReport> {
        self.submit(conversation, OutboundPayload::File(path)).await
    }

    async fn submit(
        &self,
        conversation: &ConversationId,
        payload: OutboundPayload,
    ) -> Result<SendReport> {
        let (done, done_rx) = oneshot::channel();
        self.tx
            .send(SendJob {
                conversation_id: conversation.clone(),
                payload,
                done,
            })
            .map_err(|_| EngineError::SendQueueClosed)?;
        done_rx.await.map_err(|_| EngineError::SendQueueClosed)
    }
}

async fn writer_loop(
    surface: Arc<dyn ChatSurface>,
    settings: SenderSettings,
    stats: Arc<EngineStats>,
    shutdown: CancellationToken,
    mut rx: mpsc::UnboundedReceiver<SendJob>,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        execute(surface.as_ref(), settings, &stats, job).await;
    }

    rx.close();
    let mut dropped = 0usize;
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        tracing::warn!(dropped, "send queue stopped with jobs still pending");
    }
    tracing::debug!("send writer stopped");
}

async fn execute(
    surface: &dyn ChatSurface,
    settings: SenderSettings,
    stats: &EngineStats,
    job: SendJob,
) {
    let SendJob {
        conversation_id,
        payload,
        done,
    } = job;
    let mut report = SendReport::default();

    match payload {
        OutboundPayload::Segments(segments) => {
            let total = segments.len();
            for (index, segment) in segments.iter().enumerate() {
                if index > 0 {
                    tokio::time::sleep(settings.typing.delay_for(segment)).await;
                }
                let outcome = tokio::time::timeout(
                    settings.send_timeout,
                    surface.send_text(&conversation_id, segment),
                )
                .await;
                let ok = record_outcome(&conversation_id, outcome);
                if ok {
                    report.delivered += 1;
                } else {
                    report.failed += 1;
                    tracing::warn!(
                        conversation = %conversation_id,
                        segment = index + 1,
                        total,
                        "reply segment not delivered; continuing with the rest"
                    );
                }
            }
        }
        OutboundPayload::File(path) => {
            let outcome = tokio::time::timeout(
                settings.send_timeout,
                surface.send_file(&conversation_id, &path),
            )
            .await;
            if record_outcome(&conversation_id, outcome) {
                report.delivered += 1;
            } else {
                report.failed += 1;
                tracing::warn!(
                    conversation = %conversation_id,
                    path = %path.display(),
                    "file not delivered"
                );
            }
        }
    }

    EngineStats::add(&stats.sent_segments, report.delivered as u64);
    EngineStats::add(&stats.failed_segments, report.failed as u64);
    // The submitter may have given up waiting; the send already happened.
    let _ = done.send(report);
}

fn record_outcome(
    conversation: &ConversationId,
    outcome: std::result::Result<cp_channels::Result<()>, tokio::time::error::Elapsed>,
) -> bool {
    match outcome {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            tracing::warn!(conversation = %conversation, error = %err, "send failed");
            false
        }
        Err(_) => {
            tracing::warn!(conversation = %conversation, "send timed out");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedSurface, SentItem};
    use tokio::time::Instant;

    fn settings() -> SenderSettings {
        SenderSettings {
            send_timeout: Duration::from_secs(10),
            typing: TypingCadence::default(),
        }
    }

    #[test]
    fn split_drops_blank_segments() {
        assert_eq!(
            split_segments(" hi || there ||  || ok", "||"),
            vec!["hi", "there", "ok"]
        );
        assert!(split_segments(" || ", "||").is_empty());
        assert_eq!(split_segments("single", "||"), vec!["single"]);
    }

    #[test]
    fn typing_delay_is_clamped() {
        let cadence = TypingCadence::default();
        assert_eq!(cadence.delay_for("ok"), Duration::from_millis(800));
        assert_eq!(cadence.delay_for("0123456789"), Duration::from_millis(1200));
        assert_eq!(cadence.delay_for(&"x".repeat(500)), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn segments_go_out_in_order_with_typing_pauses() {
        let surface = Arc::new(ScriptedSurface::new());
        let stats = Arc::new(EngineStats::default());
        let (queue, handle) = SendQueue::spawn(
            surface.clone(),
            settings(),
            stats.clone(),
            CancellationToken::new(),
        );
        let conv = ConversationId::from("alice");

        let started = Instant::now();
        let report = queue
            .send_segments(&conv, vec!["a".into(), "b".into(), "c".into()])
            .await
            .expect("send");
        assert_eq!(report, SendReport { delivered: 3, failed: 0 });
        assert!(started.elapsed() >= Duration::from_millis(1600));
        assert_eq!(surface.sent_texts("alice"), vec!["a", "b", "c"]);
        assert_eq!(stats.snapshot().sent_segments, 3);

        drop(queue);
        handle.await.expect("writer exits once all handles drop");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_jobs_never_interleave() {
        let surface = Arc::new(ScriptedSurface::new().with_send_latency(Duration::from_millis(50)));
        let (queue, _handle) = SendQueue::spawn(
            surface.clone(),
            settings(),
            Arc::new(EngineStats::default()),
            CancellationToken::new(),
        );

        let alice = ConversationId::from("alice");
        let bob = ConversationId::from("bob");
        let q1 = queue.clone();
        let q2 = queue.clone();
        let (a, b) = tokio::join!(
            q1.send_segments(&alice, vec!["a1".into(), "a2".into()]),
            q2.send_segments(&bob, vec!["b1".into(), "b2".into()]),
        );
        a.expect("alice");
        b.expect("bob");

        let order: Vec<String> = surface
            .sent()
            .into_iter()
            .map(|(c, item)| match item {
                SentItem::Text(t) => format!("{c}:{t}"),
                SentItem::File(p) => format!("{c}:{}", p.display()),
            })
            .collect();
        let alice_first = vec!["alice:a1", "alice:a2", "bob:b1", "bob:b2"];
        let bob_first = vec!["bob:b1", "bob:b2", "alice:a1", "alice:a2"];
        assert!(order == alice_first || order == bob_first, "interleaved: {order:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_segment_does_not_stop_the_rest() {
        let surface = Arc::new(ScriptedSurface::new());
        surface.fail_text("two");
        let (queue, _handle) = SendQueue::spawn(
            surface.clone(),
            settings(),
            Arc::new(EngineStats::default()),
            CancellationToken::new(),
        );
        let report = queue
            .send_segments(
                &ConversationId::from("alice"),
                vec!["one".into(), "two".into(), "three".into()],
            )
            .await
            .expect("send");
        assert_eq!(report, SendReport { delivered: 2, failed: 1 });
        assert!(!report.is_complete());
        assert_eq!(surface.sent_texts("alice"), vec!["one", "three"]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_send_times_out() {
        let surface = Arc::new(ScriptedSurface::new().with_send_latency(Duration::from_secs(30)));
        let (queue, _handle) = SendQueue::spawn(
            surface.clone(),
            settings(),
            Arc::new(EngineStats::default()),
            CancellationToken::new(),
        );
        let report = queue
            .send_segments(&ConversationId::from("alice"), vec!["late".into()])
            .await
            .expect("send");
        assert_eq!(report.failed, 1);
        assert!(surface.sent_texts("alice").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn files_go_through_the_same_writer() {
        let surface = Arc::new(ScriptedSurface::new());
        let (queue, _handle) = SendQueue::spawn(
            surface.clone(),
            settings(),
            Arc::new(EngineStats::default()),
            CancellationToken::new(),
        );
        let report = queue
            .send_file(&ConversationId::from("alice"), PathBuf::from("/tmp/report.pdf"))
            .await
            .expect("send");
        assert_eq!(report.delivered, 1);
        assert_eq!(
            surface.sent(),
            vec![(
                ConversationId::from("alice"),
                SentItem::File(PathBuf::from("/tmp/report.pdf"))
            )]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn closed_queue_rejects_new_jobs() {
        let surface = Arc::new(ScriptedSurface::new());
        let shutdown = CancellationToken::new();
        let (queue, handle) = SendQueue::spawn(
            surface,
            settings(),
            Arc::new(EngineStats::default()),
            shutdown.clone(),
        );
        shutdown.cancel();
        handle.await.expect("writer stops");
        let err = queue
            .send_segments(&ConversationId::from("alice"), vec!["x".into()])
            .await
            .expect_err("closed");
        assert!(matches!(err, EngineError::SendQueueClosed));
    }
}
