//! Progress Stream (C10): a duplex, ordered, resumable message channel
//! between a job's actor and the one client attached to it.
//!
//! Generalizes a broadcast-based event bus into a per-job topic that keeps
//! a bounded replay buffer and coalesces bursts of `progress` messages.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};

/// Minimum number of messages retained per job stream for replay on
/// reattach.
pub const RETENTION: usize = 256;
pub const COALESCE_INTERVAL: Duration = Duration::from_millis(250);
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
pub const PONG_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    Hello,
    Progress,
    ItemDone,
    Snapshot,
    Completed,
    /// Terminal message for a job that finished with some, but not all,
    /// items failing. Distinct from `completed`/`failed` so a client can
    /// tell a mixed-outcome batch apart from a clean run or a total loss.
    Partial,
    Failed,
    Cancelled,
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub job_id: String,
    pub seq: u64,
    pub payload: serde_json::Value,
}

/// A single job's ordered, replayable, coalescing message stream.
pub struct JobStream {
    job_id: String,
    seq: AtomicU64,
    retained: Mutex<VecDeque<StreamMessage>>,
    sender: broadcast::Sender<StreamMessage>,
    pending_progress: Mutex<Option<serde_json::Value>>,
    closed: AtomicBool,
    attached: AtomicBool,
}

impl JobStream {
    pub fn new(job_id: String) -> Arc<Self> {
        let (sender, _) = broadcast::channel(1024);
        let stream = Arc::new(Self {
            job_id,
            seq: AtomicU64::new(0),
            retained: Mutex::new(VecDeque::with_capacity(RETENTION)),
            sender,
            pending_progress: Mutex::new(None),
            closed: AtomicBool::new(false),
            attached: AtomicBool::new(false),
        });
        let background = stream.clone();
        tokio::spawn(async move { background.coalesce_loop().await });
        stream
    }

    async fn coalesce_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(COALESCE_INTERVAL);
        loop {
            ticker.tick().await;
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            let payload = {
                let mut guard = self.pending_progress.lock().await;
                guard.take()
            };
            if let Some(payload) = payload {
                self.emit(MessageType::Progress, payload).await;
            }
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    async fn emit(&self, message_type: MessageType, payload: serde_json::Value) -> StreamMessage {
        let message = StreamMessage {
            message_type,
            job_id: self.job_id.clone(),
            seq: self.next_seq(),
            payload,
        };
        {
            let mut retained = self.retained.lock().await;
            retained.push_back(message.clone());
            while retained.len() > RETENTION {
                retained.pop_front();
            }
        }
        // No active subscriber is not an error: the actor keeps running.
        let _ = self.sender.send(message.clone());
        message
    }

    /// Queue a progress update; at most one is flushed per
    /// [`COALESCE_INTERVAL`].
    pub async fn send_progress(&self, payload: serde_json::Value) {
        let mut guard = self.pending_progress.lock().await;
        *guard = Some(payload);
    }

    /// `itemDone` is never coalesced.
    pub async fn send_item_done(&self, payload: serde_json::Value) -> StreamMessage {
        self.emit(MessageType::ItemDone, payload).await
    }

    pub async fn send_snapshot(&self, payload: serde_json::Value) -> StreamMessage {
        self.emit(MessageType::Snapshot, payload).await
    }

    pub async fn send_ping(&self) -> StreamMessage {
        self.emit(MessageType::Ping, serde_json::json!({})).await
    }

    /// Sends a terminal message (`completed`/`failed`/`cancelled`) and
    /// marks the stream closed.
    pub async fn send_terminal(
        &self,
        message_type: MessageType,
        payload: serde_json::Value,
    ) -> StreamMessage {
        let message = self.emit(message_type, payload).await;
        self.closed.store(true, Ordering::Release);
        message
    }

    /// Subscribe for live messages, returning everything retained with
    /// `seq > last_seq` to replay first, per the reattach contract.
    pub async fn subscribe(&self, last_seq: u64) -> (Vec<StreamMessage>, broadcast::Receiver<StreamMessage>) {
        let retained = self.retained.lock().await;
        let replay: Vec<StreamMessage> = retained.iter().filter(|m| m.seq > last_seq).cloned().collect();
        (replay, self.sender.subscribe())
    }

    /// Claim the single attachment slot for this job's stream. Returns
    /// `false` if another client is already attached. A reattach after
    /// disconnect (`detach`) is allowed.
    pub fn try_attach(&self) -> bool {
        self.attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn detach(&self) {
        self.attached.store(false, Ordering::Release);
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

/// Registry of active job streams, keyed by `jobId`.
#[derive(Clone, Default)]
pub struct StreamRegistry {
    streams: Arc<DashMap<String, Arc<JobStream>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, job_id: &str) -> Arc<JobStream> {
        self.streams
            .entry(job_id.to_string())
            .or_insert_with(|| JobStream::new(job_id.to_string()))
            .clone()
    }

    pub fn get(&self, job_id: &str) -> Option<Arc<JobStream>> {
        self.streams.get(job_id).map(|e| e.clone())
    }

    pub fn remove(&self, job_id: &str) {
        self.streams.remove(job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn progress_bursts_coalesce_to_one_message_per_interval() {
        let stream = JobStream::new("job-1".to_string());
        for i in 0..10 {
            stream.send_progress(serde_json::json!({"n": i})).await;
        }
        tokio::time::advance(COALESCE_INTERVAL + Duration::from_millis(10)).await;
        tokio::task::yield_now().await;

        let (replay, _rx) = stream.subscribe(0).await;
        let progress_count = replay.iter().filter(|m| m.message_type == MessageType::Progress).count();
        assert_eq!(progress_count, 1);
        assert_eq!(replay.last().unwrap().payload, serde_json::json!({"n": 9}));
    }

    #[tokio::test]
    async fn item_done_is_never_coalesced() {
        let stream = JobStream::new("job-1".to_string());
        stream.send_item_done(serde_json::json!({"index": 0})).await;
        stream.send_item_done(serde_json::json!({"index": 1})).await;
        let (replay, _rx) = stream.subscribe(0).await;
        assert_eq!(replay.len(), 2);
    }

    #[tokio::test]
    async fn seq_is_strictly_increasing() {
        let stream = JobStream::new("job-1".to_string());
        let a = stream.send_item_done(serde_json::json!({})).await;
        let b = stream.send_item_done(serde_json::json!({})).await;
        let c = stream.send_item_done(serde_json::json!({})).await;
        assert!(a.seq < b.seq);
        assert!(b.seq < c.seq);
    }

    #[tokio::test]
    async fn reattach_replays_only_messages_after_last_seq() {
        let stream = JobStream::new("job-1".to_string());
        let a = stream.send_item_done(serde_json::json!({"i": 0})).await;
        let _b = stream.send_item_done(serde_json::json!({"i": 1})).await;
        let (replay, _rx) = stream.subscribe(a.seq).await;
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].payload, serde_json::json!({"i": 1}));
    }

    #[tokio::test]
    async fn terminal_message_closes_the_stream() {
        let stream = JobStream::new("job-1".to_string());
        assert!(!stream.is_closed());
        stream.send_terminal(MessageType::Completed, serde_json::json!({})).await;
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn registry_creates_and_reuses_streams() {
        let registry = StreamRegistry::new();
        let a = registry.get_or_create("job-1");
        let b = registry.get_or_create("job-1");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.get("job-2").is_none());
    }

    #[tokio::test]
    async fn only_one_attachment_at_a_time() {
        let stream = JobStream::new("job-1".to_string());
        assert!(stream.try_attach());
        assert!(!stream.try_attach());
        stream.detach();
        assert!(stream.try_attach());
    }
}
