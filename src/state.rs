use crate::error::FeedError;
use crate::facade::FeedHandler;
use crate::feed::telemetry::PipelinePerf;
use crate::feed::types::{ChannelState, FeedUpdate, Topic, TopicStatusSnapshot};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One registered subscriber of a topic.
///
/// Every delivery holds `gate` and re-checks `token` under it. Cancelling the
/// token and then taking the gate therefore waits out a callback running on
/// another thread, while a callback that unsubscribes itself re-enters the
/// gate without deadlocking.
///
/// A slot joining a running topic starts detached: live emits skip it until
/// the pipeline task has replayed the latest state to it and attached it.
pub struct SubscriberSlot {
    pub id: u64,
    handler: Arc<dyn FeedHandler>,
    token: CancellationToken,
    gate: ReentrantMutex<()>,
    attached: AtomicBool,
}

impl SubscriberSlot {
    pub fn new(id: u64, handler: Arc<dyn FeedHandler>, token: CancellationToken) -> Self {
        Self::with_attached(id, handler, token, true)
    }

    /// Slot for a topic whose pipeline is already running.
    pub fn pending(id: u64, handler: Arc<dyn FeedHandler>, token: CancellationToken) -> Self {
        Self::with_attached(id, handler, token, false)
    }

    fn with_attached(
        id: u64,
        handler: Arc<dyn FeedHandler>,
        token: CancellationToken,
        attached: bool,
    ) -> Self {
        Self {
            id,
            handler,
            token,
            gate: ReentrantMutex::new(()),
            attached: AtomicBool::new(attached),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub fn attach(&self) {
        self.attached.store(true, Ordering::Release);
    }

    pub fn deliver_data(&self, update: &FeedUpdate) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        let _gate = self.gate.lock();
        if self.token.is_cancelled() {
            return false;
        }
        self.handler.on_data(update);
        true
    }

    pub fn deliver_error(&self, error: &FeedError) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        let _gate = self.gate.lock();
        if self.token.is_cancelled() {
            return false;
        }
        self.handler.on_error(error);
        true
    }

    /// Stops delivery. Returns once no callback of this slot is running on
    /// another thread.
    pub fn close(&self) {
        self.token.cancel();
        drop(self.gate.lock());
    }
}

pub enum TopicCommand {
    /// Replay the latest state to a pending slot, then attach it.
    Attach(Arc<SubscriberSlot>),
    Rescale(f64),
}

#[derive(Debug, Clone)]
pub struct TopicStatus {
    pub state: ChannelState,
    pub reason: Option<String>,
    pub last_message_unix_ms: Option<i64>,
    pub consecutive_pull_failures: u32,
    pub perf: PipelinePerf,
}

impl Default for TopicStatus {
    fn default() -> Self {
        Self {
            state: ChannelState::Connecting,
            reason: None,
            last_message_unix_ms: None,
            consecutive_pull_failures: 0,
            perf: PipelinePerf::default(),
        }
    }
}

/// State of one topic visible outside its pipeline task.
pub struct TopicShared {
    pub topic: Topic,
    subscribers: Mutex<Vec<Arc<SubscriberSlot>>>,
    status: RwLock<TopicStatus>,
}

impl TopicShared {
    pub fn new(topic: Topic) -> Self {
        Self {
            topic,
            subscribers: Mutex::new(Vec::new()),
            status: RwLock::new(TopicStatus::default()),
        }
    }

    pub fn add_subscriber(&self, slot: Arc<SubscriberSlot>) {
        self.subscribers.lock().push(slot);
    }

    /// Removes a subscriber; returns it along with the remaining count.
    pub fn remove_subscriber(&self, id: u64) -> Option<(Arc<SubscriberSlot>, usize)> {
        let mut subscribers = self.subscribers.lock();
        let position = subscribers.iter().position(|slot| slot.id == id)?;
        let slot = subscribers.remove(position);
        Some((slot, subscribers.len()))
    }

    pub fn drain_subscribers(&self) -> Vec<Arc<SubscriberSlot>> {
        std::mem::take(&mut *self.subscribers.lock())
    }

    /// Snapshot taken so that no lock is held while callbacks run.
    pub fn subscribers(&self) -> Vec<Arc<SubscriberSlot>> {
        self.subscribers.lock().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn status(&self) -> TopicStatus {
        self.status.read().clone()
    }

    pub fn update_status(&self, update: impl FnOnce(&mut TopicStatus)) {
        update(&mut *self.status.write());
    }

    pub fn status_snapshot(&self) -> TopicStatusSnapshot {
        let status = self.status();
        TopicStatusSnapshot {
            topic: self.topic.to_string(),
            state: status.state,
            subscribers: self.subscriber_count(),
            last_message_unix_ms: status.last_message_unix_ms,
            consecutive_pull_failures: status.consecutive_pull_failures,
            apply_p50_us: status.perf.apply_p50_us,
            apply_p95_us: status.perf.apply_p95_us,
            apply_p99_us: status.perf.apply_p99_us,
            ingest_count: status.perf.ingest_count,
            emit_count: status.perf.emit_count,
            reason: status.reason,
        }
    }
}

pub struct TopicEntry {
    pub shared: Arc<TopicShared>,
    pub cancel: CancellationToken,
    pub commands: mpsc::UnboundedSender<TopicCommand>,
}

/// Active topics of one engine.
#[derive(Default)]
pub struct TopicRegistry {
    pub topics: Mutex<HashMap<Topic, TopicEntry>>,
    next_subscription_id: AtomicU64,
}

impl TopicRegistry {
    pub fn next_subscription_id(&self) -> u64 {
        self.next_subscription_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn shared(&self, topic: &Topic) -> Option<Arc<TopicShared>> {
        self.topics
            .lock()
            .get(topic)
            .map(|entry| Arc::clone(&entry.shared))
    }

    pub fn topics(&self) -> Vec<Topic> {
        let mut topics = self.topics.lock().keys().cloned().collect::<Vec<_>>();
        topics.sort();
        topics
    }
}
