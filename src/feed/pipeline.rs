//! The per-topic pipeline task.
//!
//! Sole owner and mutator of a topic's processing state. Push events, pull
//! results, fallback and quiet timers, and facade commands all arrive in one
//! `select!` loop, so both sources are applied in arrival order.

use crate::error::FeedError;
use crate::feed::candles::CandleMergeEngine;
use crate::feed::config::TopicConfig;
use crate::feed::dedup::Deduplicator;
use crate::feed::fallback::{FallbackController, PullTicket, PullVerdict};
use crate::feed::stabilizer::{ListFilter, Stabilizer};
use crate::feed::supervisor::{ChannelEvent, ConnectionSupervisor};
use crate::feed::telemetry::{elapsed_us, now_unix_ms, PipelineTelemetry};
use crate::feed::transport::PullSource;
use crate::feed::types::{
    list_items, parse_candle_batch, CandleInterval, CandleSeriesView, ChannelState, DataSource,
    FeedMessage, FeedPayload, FeedUpdate, ListSnapshot, MessageKind, Topic,
};
use crate::state::{SubscriberSlot, TopicCommand, TopicShared};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) struct PipelineContext {
    pub shared: Arc<TopicShared>,
    pub supervisor: ConnectionSupervisor,
    pub pull: Arc<dyn PullSource>,
    pub config: TopicConfig,
    pub cancel: CancellationToken,
    pub commands: mpsc::UnboundedReceiver<TopicCommand>,
}

struct PullOutcome {
    ticket: PullTicket,
    result: Result<FeedMessage, FeedError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ReplayKey {
    List,
    Candles,
    Value(MessageKind),
}

pub(crate) async fn run_topic_pipeline(context: PipelineContext) {
    let PipelineContext {
        shared,
        supervisor,
        pull,
        config,
        cancel,
        mut commands,
    } = context;

    let topic = shared.topic.clone();
    let mut channel = supervisor.open(&topic, config.channel);
    let (pull_sender, mut pull_receiver) = mpsc::unbounded_channel::<PullOutcome>();
    let mut pipeline = TopicPipeline::new(Arc::clone(&shared), &config);

    pipeline.start(channel.state(), Instant::now());
    debug!(topic = %topic, "topic pipeline started");

    loop {
        let fallback_deadline = pipeline.fallback.next_deadline();
        let quiet_deadline = pipeline.stabilizer.pending_deadline();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(command) = commands.recv() => pipeline.on_command(command),
            event = channel.recv() => match event {
                Some(event) => pipeline.on_channel_event(event),
                None => {
                    warn!(topic = %topic, "push channel closed underneath the pipeline");
                    break;
                }
            },
            Some(outcome) = pull_receiver.recv() => pipeline.on_pull_outcome(outcome),
            _ = sleep_until_opt(fallback_deadline) => {
                if let Some(ticket) = pipeline.on_fallback_deadline(Instant::now()) {
                    spawn_pull(
                        ticket,
                        topic.clone(),
                        Arc::clone(&pull),
                        pull_sender.clone(),
                        cancel.clone(),
                    );
                }
            }
            _ = sleep_until_opt(quiet_deadline) => pipeline.on_quiet_deadline(Instant::now()),
        }
    }

    supervisor.close(channel);
    debug!(topic = %topic, "topic pipeline stopped");
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

fn spawn_pull(
    ticket: PullTicket,
    topic: Topic,
    pull: Arc<dyn PullSource>,
    results: mpsc::UnboundedSender<PullOutcome>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = pull.fetch(&topic) => result,
        };
        let _ = results.send(PullOutcome { ticket, result });
    });
}

struct TopicPipeline {
    shared: Arc<TopicShared>,
    topic: Topic,
    dedup: Deduplicator,
    stabilizer: Stabilizer,
    fallback: FallbackController,
    candles: CandleMergeEngine,
    list_filter: Option<ListFilter>,
    telemetry: PipelineTelemetry,
    channel_state: ChannelState,
    pending_list_source: DataSource,
    last_source: DataSource,
    latest: HashMap<ReplayKey, FeedUpdate>,
}

impl TopicPipeline {
    fn new(shared: Arc<TopicShared>, config: &TopicConfig) -> Self {
        let topic = shared.topic.clone();
        Self {
            shared,
            topic,
            dedup: Deduplicator::new(config.fingerprint.clone()),
            stabilizer: Stabilizer::new(config.stabilizer.clone()),
            fallback: FallbackController::new(config.fallback),
            candles: CandleMergeEngine::new(config.max_candles),
            list_filter: config.list_filter.clone(),
            telemetry: PipelineTelemetry::default(),
            channel_state: ChannelState::Connecting,
            pending_list_source: DataSource::Push,
            last_source: DataSource::Push,
            latest: HashMap::new(),
        }
    }

    fn start(&mut self, channel_state: ChannelState, now: Instant) {
        self.fallback.arm(now);
        self.channel_state = channel_state;
        if channel_state == ChannelState::Live {
            self.fallback.on_live();
        }
        self.refresh_status(None);
    }

    fn on_command(&mut self, command: TopicCommand) {
        match command {
            TopicCommand::Attach(slot) => {
                self.replay(&slot);
                slot.attach();
            }
            TopicCommand::Rescale(factor) => match self.candles.rescale(&self.topic, factor) {
                Ok(()) => {
                    if let Some(view) = self.candle_view() {
                        self.emit(ReplayKey::Candles, self.last_source, FeedPayload::Candles(view));
                    }
                }
                Err(error) => warn!(topic = %self.topic, %error, "candle rescale rejected"),
            },
        }
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::State(state) => self.on_channel_state(state),
            ChannelEvent::Message(message) => {
                self.on_message(FeedMessage::clone(&message), DataSource::Push)
            }
            ChannelEvent::ReconnectBudgetExhausted {
                attempts,
                last_error,
            } => {
                let error = FeedError::transport(
                    self.topic.as_str(),
                    format!("reconnect budget exhausted after {attempts} attempts: {last_error}"),
                );
                self.refresh_status(Some(error.to_string()));
                self.deliver_error(&error);
            }
        }
    }

    fn on_channel_state(&mut self, state: ChannelState) {
        let previous = self.channel_state;
        self.channel_state = state;

        match state {
            ChannelState::Live => {
                if self.fallback.on_live() {
                    info!(topic = %self.topic, "push channel recovered, fallback stopped");
                    self.dedup.reset();
                    self.stabilizer.reset();
                }
            }
            ChannelState::Dead if previous == ChannelState::Live => {
                self.fallback.on_dead(Instant::now());
            }
            _ => {}
        }
        self.refresh_status(None);
    }

    fn on_fallback_deadline(&mut self, now: Instant) -> Option<PullTicket> {
        let was_active = self.fallback.is_active();
        let ticket = self.fallback.on_deadline(now)?;
        if !was_active {
            info!(topic = %self.topic, "push channel silent, falling back to pull");
            self.refresh_status(Some("push channel silent".to_string()));
        }
        debug!(topic = %self.topic, attempt = ticket.attempt, "issuing pull");
        Some(ticket)
    }

    fn on_pull_outcome(&mut self, outcome: PullOutcome) {
        let PullOutcome { ticket, result } = outcome;
        match self.fallback.on_pull_result(ticket, result.is_ok()) {
            PullVerdict::Stale => {
                debug!(topic = %self.topic, attempt = ticket.attempt, "discarding stale pull result");
            }
            PullVerdict::Accepted => {
                if let Ok(message) = result {
                    self.on_message(message, DataSource::Pull);
                }
                self.refresh_status(None);
            }
            PullVerdict::Failed {
                consecutive,
                escalate,
            } => {
                let last_error = match result {
                    Err(error) => error.to_string(),
                    Ok(_) => String::new(),
                };
                warn!(topic = %self.topic, consecutive, %last_error, "pull failed");
                self.refresh_status(Some(last_error.clone()));
                if escalate {
                    let error = FeedError::FallbackExhausted {
                        topic: self.topic.to_string(),
                        attempts: consecutive,
                        last_error,
                    };
                    self.deliver_error(&error);
                }
            }
        }
    }

    fn on_quiet_deadline(&mut self, now: Instant) {
        if let Some(snapshot) = self.stabilizer.poll(now) {
            debug!(topic = %self.topic, items = snapshot.len(), "quiet period elapsed, applying list");
            self.emit(
                ReplayKey::List,
                self.pending_list_source,
                FeedPayload::List(snapshot),
            );
        }
    }

    fn on_message(&mut self, message: FeedMessage, source: DataSource) {
        let started_at = std::time::Instant::now();
        self.shared.update_status(|status| {
            status.last_message_unix_ms = Some(now_unix_ms());
        });

        let Some(message) = self.dedup.accept(message) else {
            self.telemetry.record_ingest(elapsed_us(started_at));
            return;
        };

        let FeedMessage { kind, data } = message;
        let emitted = match kind {
            MessageKind::TokenList => self
                .ingest_list(&data, source)
                .map(|snapshot| (ReplayKey::List, FeedPayload::List(snapshot))),
            MessageKind::CandlesSnapshot | MessageKind::CandlesUpdate => {
                match self.ingest_candles(&kind, &data) {
                    Some(view) => Some((ReplayKey::Candles, FeedPayload::Candles(view))),
                    None if self.candle_interval(&data).is_none() => Some((
                        ReplayKey::Value(kind.clone()),
                        FeedPayload::Value {
                            kind,
                            data: Arc::new(data),
                        },
                    )),
                    None => None,
                }
            }
            other => Some((
                ReplayKey::Value(other.clone()),
                FeedPayload::Value {
                    kind: other,
                    data: Arc::new(data),
                },
            )),
        };
        self.telemetry.record_ingest(elapsed_us(started_at));

        if let Some((key, payload)) = emitted {
            self.emit(key, source, payload);
        }
    }

    fn ingest_list(&mut self, data: &Value, source: DataSource) -> Option<Arc<ListSnapshot>> {
        let Some(raw_items) = list_items(data) else {
            debug!(topic = %self.topic, "token_list payload without items, ignored");
            return None;
        };

        let items = match &self.list_filter {
            Some(filter) => raw_items
                .iter()
                .filter(|item| filter.retains(item))
                .cloned()
                .collect::<Vec<_>>(),
            None => raw_items.clone(),
        };
        let fingerprint = self.dedup.spec().of_items(&items);
        let snapshot = Arc::new(ListSnapshot { items, fingerprint });

        let applied = self.stabilizer.offer(snapshot, Instant::now());
        if applied.is_none() {
            self.pending_list_source = source;
        }
        applied
    }

    fn candle_interval(&self, data: &Value) -> Option<CandleInterval> {
        self.topic.candle_interval().or_else(|| {
            data.get("interval")
                .and_then(Value::as_str)
                .and_then(|raw| CandleInterval::parse_str(raw).ok())
        })
    }

    fn ingest_candles(&mut self, kind: &MessageKind, data: &Value) -> Option<CandleSeriesView> {
        let Some(interval) = self.candle_interval(data) else {
            debug!(topic = %self.topic, "candle payload without interval, passed through");
            return None;
        };

        let (updates, undecodable) = parse_candle_batch(data);
        if undecodable > 0 {
            debug!(topic = %self.topic, undecodable, "dropping undecodable candles");
        }

        let report = if *kind == MessageKind::CandlesSnapshot {
            self.candles.apply_snapshot(&self.topic, interval, &updates)
        } else {
            self.candles.apply_incremental(&self.topic, interval, &updates)
        };

        if *kind == MessageKind::CandlesUpdate && report.accepted == 0 {
            return None;
        }
        self.candle_view()
    }

    fn candle_view(&self) -> Option<CandleSeriesView> {
        self.candles.series(&self.topic).map(|series| CandleSeriesView {
            interval: series.interval(),
            candles: Arc::clone(series.candles()),
        })
    }

    fn emit(&mut self, key: ReplayKey, source: DataSource, payload: FeedPayload) {
        let update = FeedUpdate {
            topic: self.topic.clone(),
            source,
            payload,
        };
        for slot in self.shared.subscribers() {
            if slot.is_attached() {
                slot.deliver_data(&update);
            }
        }
        self.last_source = source;
        self.telemetry.record_emit();
        self.latest.insert(key, update);
        self.refresh_status(None);
    }

    fn replay(&self, slot: &SubscriberSlot) {
        for update in self.latest.values() {
            if !slot.deliver_data(update) {
                break;
            }
        }
    }

    fn deliver_error(&self, error: &FeedError) {
        for slot in self.shared.subscribers() {
            slot.deliver_error(error);
        }
    }

    fn refresh_status(&self, reason: Option<String>) {
        let state = if self.fallback.is_active() {
            ChannelState::FallbackActive
        } else {
            self.channel_state
        };
        let consecutive_pull_failures = self.fallback.consecutive_failures();
        let perf = self.telemetry.snapshot();

        self.shared.update_status(|status| {
            status.state = state;
            status.consecutive_pull_failures = consecutive_pull_failures;
            status.perf = perf;
            if reason.is_some() || state == ChannelState::Live {
                status.reason = reason;
            }
        });
    }
}
