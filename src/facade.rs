//! The subscription surface used by presentation code.

use crate::error::{FeedError, FeedResult};
use crate::feed::config::{EngineConfig, TopicConfigArgs};
use crate::feed::pipeline::{run_topic_pipeline, PipelineContext};
use crate::feed::remote::{HttpPullSource, WebSocketTransport};
use crate::feed::supervisor::ConnectionSupervisor;
use crate::feed::telemetry::now_unix_ms;
use crate::feed::transport::{PullSource, PushTransport};
use crate::feed::types::{ChannelState, FeedUpdate, Topic, TopicStatusSnapshot};
use crate::state::{SubscriberSlot, TopicCommand, TopicEntry, TopicRegistry, TopicShared};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Callbacks of one subscription. Invoked from the topic's pipeline task;
/// implementations must not block.
pub trait FeedHandler: Send + Sync + 'static {
    fn on_data(&self, update: &FeedUpdate);

    fn on_error(&self, _error: &FeedError) {}
}

/// Closure-based [`FeedHandler`].
pub struct Handlers<D, E> {
    on_data: D,
    on_error: E,
}

pub fn handlers<D, E>(on_data: D, on_error: E) -> Handlers<D, E>
where
    D: Fn(&FeedUpdate) + Send + Sync + 'static,
    E: Fn(&FeedError) + Send + Sync + 'static,
{
    Handlers { on_data, on_error }
}

impl<D, E> FeedHandler for Handlers<D, E>
where
    D: Fn(&FeedUpdate) + Send + Sync + 'static,
    E: Fn(&FeedError) + Send + Sync + 'static,
{
    fn on_data(&self, update: &FeedUpdate) {
        (self.on_data)(update)
    }

    fn on_error(&self, error: &FeedError) {
        (self.on_error)(error)
    }
}

/// Handle returned by [`FeedEngine::subscribe`]; pass it back to
/// [`FeedEngine::unsubscribe`].
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    topic: Topic,
    created_at_unix_ms: i64,
    token: CancellationToken,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn created_at_unix_ms(&self) -> i64 {
        self.created_at_unix_ms
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}

struct EngineInner {
    registry: TopicRegistry,
    supervisor: ConnectionSupervisor,
    pull: Arc<dyn PullSource>,
    topic_defaults: TopicConfigArgs,
}

/// Cheap to clone; all clones share one registry. Subscribing spawns tasks,
/// so it must happen inside a Tokio runtime.
#[derive(Clone)]
pub struct FeedEngine {
    inner: Arc<EngineInner>,
}

impl FeedEngine {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        pull: Arc<dyn PullSource>,
        topic_defaults: TopicConfigArgs,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                registry: TopicRegistry::default(),
                supervisor: ConnectionSupervisor::new(transport),
                pull,
                topic_defaults,
            }),
        }
    }

    pub fn from_config(config: &EngineConfig) -> FeedResult<Self> {
        config.validate()?;
        let transport = Arc::new(WebSocketTransport::new(config.ws_base_url.clone()));
        let pull = Arc::new(HttpPullSource::new(
            config.http_base_url.clone(),
            config.http_timeout(),
        )?);
        Ok(Self::new(transport, pull, config.topic_defaults.clone()))
    }

    pub fn subscribe(&self, topic: &str, handler: impl FeedHandler) -> FeedResult<Subscription> {
        self.subscribe_with(topic, handler, TopicConfigArgs::default())
    }

    /// Subscribes with per-topic overrides. Overrides only take effect for
    /// the subscriber that starts the topic; later subscribers share it.
    pub fn subscribe_with(
        &self,
        topic: &str,
        handler: impl FeedHandler,
        args: TopicConfigArgs,
    ) -> FeedResult<Subscription> {
        let topic = Topic::parse(topic)?;
        let config = args.merged_over(&self.inner.topic_defaults).normalize()?;

        let id = self.inner.registry.next_subscription_id();
        let token = CancellationToken::new();
        let handler: Arc<dyn FeedHandler> = Arc::new(handler);

        let mut topics = self.inner.registry.topics.lock();
        match topics.get(&topic) {
            Some(entry) => {
                let slot = Arc::new(SubscriberSlot::pending(id, handler, token.clone()));
                entry.shared.add_subscriber(Arc::clone(&slot));
                let _ = entry.commands.send(TopicCommand::Attach(slot));
                debug!(topic = %topic, subscription = id, "joined running topic");
            }
            None => {
                let shared = Arc::new(TopicShared::new(topic.clone()));
                shared.add_subscriber(Arc::new(SubscriberSlot::new(id, handler, token.clone())));
                let cancel = CancellationToken::new();
                let (commands, command_receiver) = mpsc::unbounded_channel();

                tokio::spawn(run_topic_pipeline(PipelineContext {
                    shared: Arc::clone(&shared),
                    supervisor: self.inner.supervisor.clone(),
                    pull: Arc::clone(&self.inner.pull),
                    config,
                    cancel: cancel.clone(),
                    commands: command_receiver,
                }));

                topics.insert(
                    topic.clone(),
                    TopicEntry {
                        shared,
                        cancel,
                        commands,
                    },
                );
                info!(topic = %topic, subscription = id, "topic started");
            }
        }
        drop(topics);

        Ok(Subscription {
            id,
            topic,
            created_at_unix_ms: now_unix_ms(),
            token,
        })
    }

    /// Once this returns, no callback of `subscription` is running or will
    /// run. Safe to call from inside that subscription's own callback.
    /// Returns `false` when the subscription was already gone.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let (slot, torn_down) = {
            let mut topics = self.inner.registry.topics.lock();
            let Some(entry) = topics.get(&subscription.topic) else {
                return false;
            };
            let Some((slot, remaining)) = entry.shared.remove_subscriber(subscription.id) else {
                return false;
            };
            let torn_down = if remaining == 0 {
                topics.remove(&subscription.topic)
            } else {
                None
            };
            (slot, torn_down)
        };

        slot.close();
        if let Some(entry) = torn_down {
            entry.cancel.cancel();
            info!(topic = %subscription.topic, "topic torn down");
        }
        debug!(topic = %subscription.topic, subscription = subscription.id, "unsubscribed");
        true
    }

    /// `true` only while the push channel is authoritative for the topic.
    pub fn is_live(&self, topic: &str) -> bool {
        self.status(topic)
            .map(|status| status.state == ChannelState::Live)
            .unwrap_or(false)
    }

    pub fn status(&self, topic: &str) -> Option<TopicStatusSnapshot> {
        let topic = Topic::parse(topic).ok()?;
        self.inner
            .registry
            .shared(&topic)
            .map(|shared| shared.status_snapshot())
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.inner.registry.topics()
    }

    /// Re-denominates the candle series of `topic`, e.g. after a quote
    /// currency switch.
    pub fn rescale_candles(&self, topic: &str, factor: f64) -> FeedResult<()> {
        if !factor.is_finite() || factor <= 0.0 {
            return Err(FeedError::InvalidArgument(
                "rescale factor must be a finite positive number".to_string(),
            ));
        }
        let topic = Topic::parse(topic)?;
        let topics = self.inner.registry.topics.lock();
        let entry = topics.get(&topic).ok_or_else(|| {
            FeedError::InvalidArgument(format!("topic {topic} has no active subscription"))
        })?;
        let _ = entry.commands.send(TopicCommand::Rescale(factor));
        Ok(())
    }

    /// Tears down every topic and silences every subscription.
    pub fn shutdown(&self) {
        let entries = {
            let mut topics = self.inner.registry.topics.lock();
            topics.drain().map(|(_, entry)| entry).collect::<Vec<_>>()
        };

        for entry in &entries {
            for slot in entry.shared.drain_subscribers() {
                slot.close();
            }
            entry.cancel.cancel();
        }
        if !entries.is_empty() {
            info!(topics = entries.len(), "feed engine shut down");
        }
    }

    pub fn open_channels(&self) -> usize {
        self.inner.supervisor.open_channels()
    }
}
