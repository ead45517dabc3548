//! Per-channel FIFO message queue with burst merging, a sliding-window rate
//! limiter, and depth-bounded backpressure.
//!
//! Serialization is per channel: `enqueue` pushes onto a channel's deque and,
//! if nothing is already draining that channel, spawns a single drain task
//! for it. Channels drain independently and in parallel with each other;
//! within one channel, messages are strictly FIFO except where the burst
//! merge window collapses adjacent arrivals into one batch.

use super::message::{Message, MessageOrigin};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

const MAX_QUEUE_DEPTH: usize = 10;
const RATE_LIMIT_WINDOW_SECS: i64 = 60;
const RATE_LIMIT_MAX: usize = 10;

#[async_trait]
pub trait MessageProcessor: Send + Sync {
    /// Handle one drained (possibly merged) message. Errors are logged by
    /// the queue, never propagated -- a single failure must not stop the
    /// channel's drain loop.
    async fn process(&self, message: Message) -> anyhow::Result<()>;
}

/// Invoked whenever a message is rejected, either by channel backpressure
/// or the per-user rate limiter. Callers use this to send the user a "busy"
/// reply.
pub trait RejectHandler: Send + Sync {
    fn on_reject(&self, message: &Message, reason: RejectReason);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    QueueFull,
    RateLimited,
}

struct ChannelState {
    queue: Mutex<VecDeque<Message>>,
    processing: AtomicBool,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            processing: AtomicBool::new(false),
        }
    }
}

pub struct MessageQueue {
    channels: Arc<DashMap<String, Arc<ChannelState>>>,
    rate_limits: Arc<DashMap<String, VecDeque<chrono::DateTime<chrono::Utc>>>>,
    processor: Arc<dyn MessageProcessor>,
    reject_handler: Arc<dyn RejectHandler>,
    merge_window_ms: i64,
}

impl MessageQueue {
    pub fn new(
        processor: Arc<dyn MessageProcessor>,
        reject_handler: Arc<dyn RejectHandler>,
        merge_window_ms: i64,
    ) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            rate_limits: Arc::new(DashMap::new()),
            processor,
            reject_handler,
            merge_window_ms,
        }
    }

    /// Attempts to enqueue `message`. Returns `true` if accepted. Real user
    /// messages (origin == None) are subject to the per-user rate limit;
    /// synthetic messages (scheduler, worker-trigger, approval-response)
    /// bypass it.
    pub fn enqueue(&self, message: Message) -> bool {
        if message.origin.is_none() && !self.check_rate_limit(&message.user_id) {
            self.reject_handler.on_reject(&message, RejectReason::RateLimited);
            return false;
        }

        let state = self
            .channels
            .entry(message.channel_id.clone())
            .or_insert_with(|| Arc::new(ChannelState::default()))
            .clone();

        {
            let mut queue = state.queue.lock();
            if queue.len() >= MAX_QUEUE_DEPTH {
                drop(queue);
                self.reject_handler.on_reject(&message, RejectReason::QueueFull);
                return false;
            }
            queue.push_back(message);
        }

        if state
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.spawn_drain(state);
        }
        true
    }

    fn check_rate_limit(&self, user_id: &str) -> bool {
        let now = chrono::Utc::now();
        let cutoff = now - chrono::Duration::seconds(RATE_LIMIT_WINDOW_SECS);
        let mut entry = self.rate_limits.entry(user_id.to_string()).or_default();
        while matches!(entry.front(), Some(t) if *t < cutoff) {
            entry.pop_front();
        }
        if entry.len() >= RATE_LIMIT_MAX {
            return false;
        }
        entry.push_back(now);
        true
    }

    pub fn queue_depth(&self, channel_id: &str) -> usize {
        self.channels
            .get(channel_id)
            .map(|s| s.queue.lock().len())
            .unwrap_or(0)
    }

    pub fn is_processing(&self, channel_id: &str) -> bool {
        self.channels
            .get(channel_id)
            .map(|s| s.processing.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn spawn_drain(&self, state: Arc<ChannelState>) {
        let processor = self.processor.clone();
        let merge_window_ms = self.merge_window_ms;
        tokio::spawn(async move {
            loop {
                let batch = {
                    let mut queue = state.queue.lock();
                    let head = match queue.pop_front() {
                        Some(h) => h,
                        None => {
                            state.processing.store(false, Ordering::SeqCst);
                            return;
                        }
                    };
                    let window_end = head.arrived_at + chrono::Duration::milliseconds(merge_window_ms);
                    let mut batch = vec![head];
                    while let Some(front) = queue.front() {
                        if front.arrived_at <= window_end {
                            batch.push(queue.pop_front().unwrap());
                        } else {
                            break;
                        }
                    }
                    batch
                };

                let merged = merge_batch(batch);
                if let Err(err) = processor.process(merged).await {
                    warn!(error = %err, "message processing failed; continuing drain loop");
                }

                // Loop back: another arrival may have landed while we were
                // processing. If the queue is now empty we flip `processing`
                // back to false and exit so the next `enqueue` respawns us.
                let empty = state.queue.lock().is_empty();
                if empty {
                    state.processing.store(false, Ordering::SeqCst);
                    // Re-check: an enqueue could have raced between the
                    // emptiness check and the flag flip.
                    if state.queue.lock().is_empty() {
                        return;
                    }
                    if state
                        .processing
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_err()
                    {
                        return;
                    }
                }
            }
        });
    }
}

/// Joins a burst's text fields with newlines; metadata comes from the head
/// entry. Images on non-head entries are currently dropped.
fn merge_batch(batch: Vec<Message>) -> Message {
    if batch.len() == 1 {
        return batch.into_iter().next().unwrap();
    }
    let head = &batch[0];
    let channel_id = head.channel_id.clone();
    let user_id = head.user_id.clone();
    let platform = head.platform.clone();
    let arrived_at = head.arrived_at;
    let images = head.images.clone();
    let origin = head.origin;
    let text = batch
        .iter()
        .map(|m| m.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    Message {
        channel_id,
        user_id,
        text,
        platform,
        arrived_at,
        images,
        origin,
    }
}

pub fn scheduler_message(channel_id: impl Into<String>, user_id: impl Into<String>, text: impl Into<String>, platform: impl Into<String>) -> Message {
    Message {
        channel_id: channel_id.into(),
        user_id: user_id.into(),
        text: text.into(),
        platform: platform.into(),
        arrived_at: chrono::Utc::now(),
        images: Vec::new(),
        origin: Some(MessageOrigin::Scheduler),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    struct RecordingProcessor {
        calls: Arc<Mutex<Vec<Message>>>,
        notify: Arc<Notify>,
        expected: usize,
        seen: AtomicUsize,
    }

    #[async_trait]
    impl MessageProcessor for RecordingProcessor {
        async fn process(&self, message: Message) -> anyhow::Result<()> {
            self.calls.lock().push(message);
            if self.seen.fetch_add(1, Ordering::SeqCst) + 1 >= self.expected {
                self.notify.notify_one();
            }
            Ok(())
        }
    }

    struct NoopReject {
        rejected: Arc<Mutex<Vec<RejectReason>>>,
    }

    impl RejectHandler for NoopReject {
        fn on_reject(&self, _message: &Message, reason: RejectReason) {
            self.rejected.lock().push(reason);
        }
    }

    #[tokio::test]
    async fn burst_within_window_merges_into_one_call() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let notify = Arc::new(Notify::new());
        let processor = Arc::new(RecordingProcessor {
            calls: calls.clone(),
            notify: notify.clone(),
            expected: 1,
            seen: AtomicUsize::new(0),
        });
        let rejected = Arc::new(Mutex::new(Vec::new()));
        let reject = Arc::new(NoopReject { rejected });

        let queue = MessageQueue::new(processor, reject, 5000);

        let mut m1 = Message::new_user("c1", "u1", "hi", "test");
        let t0 = m1.arrived_at;
        let mut m2 = m1.clone();
        m2.text = "are you".into();
        let mut m3 = m1.clone();
        m3.text = "there".into();
        m3.arrived_at = t0 + chrono::Duration::milliseconds(100);

        queue.enqueue(m1);
        queue.enqueue(m2);
        queue.enqueue(m3);

        tokio::time::timeout(std::time::Duration::from_secs(2), notify.notified())
            .await
            .expect("processor should have been called");

        let calls = calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].text, "hi\nare you\nthere");
    }

    #[tokio::test]
    async fn rate_limit_rejects_eleventh_message() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let notify = Arc::new(Notify::new());
        let processor = Arc::new(RecordingProcessor {
            calls,
            notify,
            expected: 100,
            seen: AtomicUsize::new(0),
        });
        let rejected = Arc::new(Mutex::new(Vec::new()));
        let reject = Arc::new(NoopReject { rejected: rejected.clone() });
        let queue = MessageQueue::new(processor, reject, 5000);

        for i in 0..11 {
            let m = Message::new_user(format!("c{i}"), "u1", format!("msg{i}"), "test");
            queue.enqueue(m);
        }

        assert_eq!(rejected.lock().len(), 1);
        assert_eq!(rejected.lock()[0], RejectReason::RateLimited);
    }
}
