//! Connection lifecycle for push channels.
//!
//! One channel task per exact topic, shared by reference count. The task
//! connects, marks the channel `Live` on the first parsed message, and on any
//! failure (error, close, connect refusal, silence longer than `stale_after`)
//! marks it `Dead` and reconnects with capped exponential backoff and full
//! jitter.

use crate::feed::transport::{PushStream, PushTransport, TransportFrame};
use crate::feed::types::{parse_feed_payload, ChannelState, FeedMessage, Topic};
use futures_util::StreamExt;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LOG_THROTTLE_MS: u64 = 500;
const DEFAULT_EVENT_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(15_000),
        }
    }
}

impl BackoffConfig {
    /// Upper bound of the delay before reconnect attempt `attempt` (1-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let base_ms = self.base_delay.as_millis().min(u64::MAX as u128) as u64;
        let max_ms = self.max_delay.as_millis().min(u64::MAX as u128) as u64;
        Duration::from_millis(base_ms.saturating_mul(1_u64 << exponent).min(max_ms))
    }

    /// Full jitter: uniform in `[0, ceiling(attempt)]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling_ms = self.ceiling(attempt).as_millis() as u64;
        let jittered_ms = rand::thread_rng().gen_range(0..=ceiling_ms);
        Duration::from_millis(jittered_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSettings {
    pub backoff: BackoffConfig,
    pub reconnect_budget: u32,
    pub stale_after: Duration,
    /// A connect attempt still pending after this long counts as failed.
    pub connect_timeout: Duration,
    pub event_capacity: usize,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            reconnect_budget: 8,
            stale_after: Duration::from_millis(30_000),
            connect_timeout: Duration::from_millis(10_000),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    State(ChannelState),
    Message(Arc<FeedMessage>),
    ReconnectBudgetExhausted { attempts: u32, last_error: String },
}

/// A reference to a shared channel. Return it through
/// [`ConnectionSupervisor::close`].
pub struct ChannelHandle {
    id: u64,
    topic: Topic,
    events: broadcast::Receiver<ChannelEvent>,
    state: watch::Receiver<ChannelState>,
}

impl ChannelHandle {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.state() == ChannelState::Live
    }

    /// Next event in emission order; `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "channel consumer lagged, events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

struct ActiveChannel {
    refs: usize,
    events: broadcast::Sender<ChannelEvent>,
    state: watch::Receiver<ChannelState>,
    cancel: CancellationToken,
}

struct SupervisorInner {
    transport: Arc<dyn PushTransport>,
    channels: Mutex<HashMap<Topic, ActiveChannel>>,
    next_handle_id: AtomicU64,
}

#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ConnectionSupervisor {
    pub fn new(transport: Arc<dyn PushTransport>) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                transport,
                channels: Mutex::new(HashMap::new()),
                next_handle_id: AtomicU64::new(1),
            }),
        }
    }

    /// Opens (or joins) the channel for `topic`. Settings of the first opener
    /// win. Must be called from within a Tokio runtime.
    pub fn open(&self, topic: &Topic, settings: ChannelSettings) -> ChannelHandle {
        let id = self.inner.next_handle_id.fetch_add(1, Ordering::Relaxed);
        let mut channels = self.inner.channels.lock();

        if let Some(active) = channels.get_mut(topic) {
            active.refs = active.refs.saturating_add(1);
            debug!(topic = %topic, refs = active.refs, "joined existing push channel");
            return ChannelHandle {
                id,
                topic: topic.clone(),
                events: active.events.subscribe(),
                state: active.state.clone(),
            };
        }

        let (events, receiver) = broadcast::channel(settings.event_capacity.max(1));
        let (state_sender, state) = watch::channel(ChannelState::Connecting);
        let cancel = CancellationToken::new();

        let task = ChannelTask {
            topic: topic.clone(),
            transport: Arc::clone(&self.inner.transport),
            settings,
            events: events.clone(),
            state: state_sender,
            cancel: cancel.clone(),
            throttle: LogThrottle::default(),
        };
        tokio::spawn(task.run());

        channels.insert(
            topic.clone(),
            ActiveChannel {
                refs: 1,
                events,
                state: state.clone(),
                cancel,
            },
        );
        debug!(topic = %topic, "opened push channel");

        ChannelHandle {
            id,
            topic: topic.clone(),
            events: receiver,
            state,
        }
    }

    /// Releases a handle; the transport is torn down with the last one.
    pub fn close(&self, handle: ChannelHandle) {
        let removed = {
            let mut channels = self.inner.channels.lock();
            match channels.get_mut(&handle.topic) {
                Some(active) if active.refs > 1 => {
                    active.refs -= 1;
                    None
                }
                Some(_) => channels.remove(&handle.topic),
                None => None,
            }
        };

        if let Some(active) = removed {
            active.cancel.cancel();
            debug!(topic = %handle.topic, handle = handle.id, "closed push channel");
        }
    }

    pub fn state(&self, topic: &Topic) -> Option<ChannelState> {
        self.inner
            .channels
            .lock()
            .get(topic)
            .map(|active| *active.state.borrow())
    }

    pub fn is_live(&self, topic: &Topic) -> bool {
        self.state(topic) == Some(ChannelState::Live)
    }

    pub fn open_channels(&self) -> usize {
        self.inner.channels.lock().len()
    }
}

#[derive(Debug, Default)]
struct LogThrottle {
    last_reason: Option<String>,
    last_emit: Option<Instant>,
}

impl LogThrottle {
    fn allow(&mut self, reason: &str) -> bool {
        let now = Instant::now();
        let repeated = self.last_reason.as_deref() == Some(reason)
            && self
                .last_emit
                .map(|instant| now.duration_since(instant) < Duration::from_millis(LOG_THROTTLE_MS))
                .unwrap_or(false);
        if repeated {
            return false;
        }
        self.last_reason = Some(reason.to_string());
        self.last_emit = Some(now);
        true
    }
}

enum PumpExit {
    Cancelled,
    Failed { reason: String, reached_live: bool },
}

struct ChannelTask {
    topic: Topic,
    transport: Arc<dyn PushTransport>,
    settings: ChannelSettings,
    events: broadcast::Sender<ChannelEvent>,
    state: watch::Sender<ChannelState>,
    cancel: CancellationToken,
    throttle: LogThrottle,
}

impl ChannelTask {
    async fn run(mut self) {
        let mut attempt = 0_u32;
        let mut budget_reported = false;

        while !self.cancel.is_cancelled() {
            self.publish_state(ChannelState::Connecting);

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                connected = tokio::time::timeout(
                    self.settings.connect_timeout,
                    self.transport.connect(&self.topic),
                ) => connected,
            };

            let reason = match connected {
                Err(_) => format!(
                    "connect timed out after {} ms",
                    self.settings.connect_timeout.as_millis()
                ),
                Ok(Err(error)) => format!("connect failed: {error}"),
                Ok(Ok(stream)) => match self.pump(stream).await {
                    PumpExit::Cancelled => break,
                    PumpExit::Failed {
                        reason,
                        reached_live,
                    } => {
                        if reached_live {
                            attempt = 0;
                            budget_reported = false;
                        }
                        reason
                    }
                },
            };

            self.publish_state(ChannelState::Dead);
            attempt = attempt.saturating_add(1);

            if attempt >= self.settings.reconnect_budget && !budget_reported {
                budget_reported = true;
                warn!(topic = %self.topic, attempt, %reason, "reconnect budget exhausted");
                let _ = self.events.send(ChannelEvent::ReconnectBudgetExhausted {
                    attempts: attempt,
                    last_error: reason.clone(),
                });
            }

            let delay = self.settings.backoff.delay(attempt);
            if self.throttle.allow(&reason) {
                warn!(
                    topic = %self.topic,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %reason,
                    "push channel dead, scheduling reconnect"
                );
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!(topic = %self.topic, "push channel task stopped");
    }

    async fn pump(&mut self, mut stream: PushStream) -> PumpExit {
        let mut reached_live = false;

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return PumpExit::Cancelled,
                next = tokio::time::timeout(self.settings.stale_after, stream.next()) => next,
            };

            let frame = match next {
                Err(_) => {
                    return PumpExit::Failed {
                        reason: format!(
                            "no message for {} ms",
                            self.settings.stale_after.as_millis()
                        ),
                        reached_live,
                    }
                }
                Ok(None) => {
                    return PumpExit::Failed {
                        reason: "stream ended".to_string(),
                        reached_live,
                    }
                }
                Ok(Some(Err(error))) => {
                    return PumpExit::Failed {
                        reason: error.to_string(),
                        reached_live,
                    }
                }
                Ok(Some(Ok(frame))) => frame,
            };

            match frame {
                TransportFrame::Closed(close_reason) => {
                    return PumpExit::Failed {
                        reason: format!(
                            "closed by peer: {}",
                            close_reason.unwrap_or_else(|| "no reason".to_string())
                        ),
                        reached_live,
                    }
                }
                TransportFrame::Payload(mut payload) => match parse_feed_payload(&mut payload) {
                    Ok(message) => {
                        if !reached_live {
                            reached_live = true;
                            info!(topic = %self.topic, "push channel live");
                            self.publish_state(ChannelState::Live);
                        }
                        let _ = self.events.send(ChannelEvent::Message(Arc::new(message)));
                    }
                    Err(error) => {
                        let reason = error.to_string();
                        if self.throttle.allow(&reason) {
                            warn!(topic = %self.topic, %reason, "dropping malformed push frame");
                        }
                    }
                },
            }
        }
    }

    fn publish_state(&self, next: ChannelState) {
        if *self.state.borrow() == next {
            return;
        }
        self.state.send_replace(next);
        let _ = self.events.send(ChannelEvent::State(next));
    }
}
