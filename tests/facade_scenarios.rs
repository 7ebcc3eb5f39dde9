use async_trait::async_trait;
use futures_util::StreamExt;
use launchpad_feed::{
    ChannelState, DataSource, FeedEngine, FeedError, FeedHandler, FeedMessage, FeedPayload,
    FeedResult, FeedUpdate, MessageKind, PullSource, PushStream, PushTransport, Subscription,
    Topic, TopicConfigArgs, TransportFrame,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

type FrameSender = mpsc::UnboundedSender<FeedResult<TransportFrame>>;

/// Hands out scripted connections in order; once they run out every
/// connection stays silent, or is refused when `refuse` is set.
#[derive(Default)]
struct FakePush {
    connects: AtomicUsize,
    scripted: Mutex<VecDeque<mpsc::UnboundedReceiver<FeedResult<TransportFrame>>>>,
    refuse: bool,
}

impl FakePush {
    fn silent() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn refusing() -> Arc<Self> {
        Arc::new(Self {
            refuse: true,
            ..Self::default()
        })
    }

    fn scripted() -> (Arc<Self>, FrameSender) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let push = Self::default();
        push.scripted.lock().push_back(receiver);
        (Arc::new(push), sender)
    }

    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PushTransport for FakePush {
    async fn connect(&self, topic: &Topic) -> FeedResult<PushStream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match self.scripted.lock().pop_front() {
            Some(receiver) => Ok(futures_util::stream::unfold(receiver, |mut receiver| async move {
                receiver.recv().await.map(|frame| (frame, receiver))
            })
            .boxed()),
            None if self.refuse => Err(FeedError::transport(topic.as_str(), "connection refused")),
            None => Ok(futures_util::stream::pending().boxed()),
        }
    }
}

struct FakePull {
    calls: Mutex<Vec<Instant>>,
    response: FeedResult<FeedMessage>,
}

impl FakePull {
    fn answering(response: FeedResult<FeedMessage>) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            response,
        })
    }

    fn calls(&self) -> Vec<Instant> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl PullSource for FakePull {
    async fn fetch(&self, _topic: &Topic) -> FeedResult<FeedMessage> {
        self.calls.lock().push(Instant::now());
        self.response.clone()
    }
}

#[derive(Clone, Default)]
struct Recorder {
    updates: Arc<Mutex<Vec<FeedUpdate>>>,
    errors: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn updates(&self) -> Vec<FeedUpdate> {
        self.updates.lock().clone()
    }

    fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }
}

impl FeedHandler for Recorder {
    fn on_data(&self, update: &FeedUpdate) {
        self.updates.lock().push(update.clone());
    }

    fn on_error(&self, error: &FeedError) {
        self.errors.lock().push(error.to_string());
    }
}

fn token_list(volume_of_first: f64) -> Value {
    let mut items = vec![json!({"address": "mint-0", "volume": volume_of_first})];
    for rank in 1..10 {
        items.push(json!({"address": format!("mint-{rank}"), "volume": 50.0 - rank as f64}));
    }
    Value::Array(items)
}

fn push_frame(kind: &str, data: Value) -> FeedResult<TransportFrame> {
    let payload = serde_json::to_vec(&json!({"type": kind, "data": data}))
        .expect("frame should encode");
    Ok(TransportFrame::Payload(payload))
}

fn list_pull() -> Arc<FakePull> {
    FakePull::answering(Ok(FeedMessage::new(MessageKind::TokenList, token_list(100.0))))
}

async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn silent_push_falls_back_to_pull_on_schedule() {
    let pull = list_pull();
    let engine = FeedEngine::new(FakePush::silent(), pull.clone(), TopicConfigArgs::default());
    let recorder = Recorder::default();
    let start = Instant::now();
    let _subscription = engine
        .subscribe("tokens/top-mc", recorder.clone())
        .expect("subscribe");

    advance(1_900).await;
    assert!(pull.calls().is_empty());
    assert!(!engine.is_live("tokens/top-mc"));

    advance(200).await;
    assert_eq!(pull.calls().len(), 1);
    assert!(!engine.is_live("tokens/top-mc"));

    advance(20_000).await;
    let calls = pull.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0] - start, Duration::from_millis(2_000));
    assert_eq!(calls[1] - start, Duration::from_millis(22_000));
    assert!(!engine.is_live("tokens/top-mc"));

    let status = engine.status("tokens/top-mc").expect("topic is active");
    assert_eq!(status.state, ChannelState::FallbackActive);

    // Identical pulled snapshots are delivered once.
    let updates = recorder.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].source, DataSource::Pull);
    assert!(matches!(&updates[0].payload, FeedPayload::List(snapshot) if snapshot.len() == 10));
}

#[tokio::test(start_paused = true)]
async fn recovered_push_stops_polling() {
    let (push, frames) = FakePush::scripted();
    let pull = list_pull();
    let engine = FeedEngine::new(push, pull.clone(), TopicConfigArgs::default());
    let recorder = Recorder::default();
    let _subscription = engine
        .subscribe("tokens/top-mc", recorder.clone())
        .expect("subscribe");

    advance(23_000).await;
    assert_eq!(pull.calls().len(), 2);

    frames
        .send(push_frame("token_list", token_list(100.0)))
        .expect("send");
    advance(10).await;
    assert!(engine.is_live("tokens/top-mc"));

    advance(20_000).await;
    assert_eq!(pull.calls().len(), 2);
    assert!(engine.is_live("tokens/top-mc"));

    // The push snapshot equals the pulled one but is the new baseline.
    let sources = recorder
        .updates()
        .iter()
        .map(|update| update.source)
        .collect::<Vec<_>>();
    assert_eq!(sources, vec![DataSource::Pull, DataSource::Push]);
}

#[tokio::test(start_paused = true)]
async fn failed_pulls_surface_fallback_exhausted_once() {
    let pull = FakePull::answering(Err(FeedError::Pull("status 503".to_string())));
    let engine = FeedEngine::new(FakePush::silent(), pull.clone(), TopicConfigArgs::default());
    let recorder = Recorder::default();
    let _subscription = engine
        .subscribe("tokens/top-mc", recorder.clone())
        .expect("subscribe");

    advance(41_000).await;
    assert_eq!(pull.calls().len(), 2);
    assert!(recorder.errors().is_empty());

    advance(2_000).await;
    let errors = recorder.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("fallback exhausted for tokens/top-mc after 3 failed pulls"));

    advance(20_000).await;
    assert_eq!(pull.calls().len(), 4);
    assert_eq!(recorder.errors().len(), 1);

    let status = engine.status("tokens/top-mc").expect("topic is active");
    assert_eq!(status.state, ChannelState::FallbackActive);
    assert_eq!(status.consecutive_pull_failures, 4);
}

#[tokio::test(start_paused = true)]
async fn refused_connects_surface_one_transport_error() {
    let push = FakePush::refusing();
    let engine = FeedEngine::new(push.clone(), list_pull(), TopicConfigArgs::default());
    let recorder = Recorder::default();
    let _subscription = engine
        .subscribe_with(
            "tokens/top-mc",
            recorder.clone(),
            TopicConfigArgs {
                reconnect_budget: Some(2),
                backoff_base_ms: Some(50),
                backoff_max_ms: Some(100),
                ..TopicConfigArgs::default()
            },
        )
        .expect("subscribe");

    advance(1_500).await;
    let errors = recorder.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with(
        "transport error on tokens/top-mc: reconnect budget exhausted after 2 attempts"
    ));
    assert!(errors[0].contains("connection refused"));
    let status = engine.status("tokens/top-mc").expect("topic is active");
    assert!(status
        .reason
        .is_some_and(|reason| reason.contains("reconnect budget exhausted")));

    // Retries continue, but the budget is reported once per failure streak.
    advance(10_000).await;
    assert!(push.connects() > 2);
    assert_eq!(recorder.errors().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn dropped_live_channel_rearms_fallback() {
    let (push, frames) = FakePush::scripted();
    let pull = list_pull();
    let engine = FeedEngine::new(push, pull.clone(), TopicConfigArgs::default());
    let _subscription = engine
        .subscribe("tokens/top-mc", Recorder::default())
        .expect("subscribe");

    frames
        .send(push_frame("token_list", token_list(100.0)))
        .expect("send");
    advance(10).await;
    assert!(engine.is_live("tokens/top-mc"));

    // Closing the stream kills the channel; the reconnect stays silent.
    drop(frames);
    advance(10).await;
    assert!(!engine.is_live("tokens/top-mc"));

    advance(1_900).await;
    assert!(pull.calls().is_empty());

    advance(200).await;
    assert_eq!(pull.calls().len(), 1);
    let status = engine.status("tokens/top-mc").expect("topic is active");
    assert_eq!(status.state, ChannelState::FallbackActive);
}

#[tokio::test(start_paused = true)]
async fn unsubscribing_cancels_pending_fallback() {
    let pull = list_pull();
    let engine = FeedEngine::new(FakePush::silent(), pull.clone(), TopicConfigArgs::default());
    let recorder = Recorder::default();
    let subscription = engine
        .subscribe("tokens/top-mc", recorder.clone())
        .expect("subscribe");

    advance(1_000).await;
    assert!(engine.unsubscribe(&subscription));
    assert!(!engine.unsubscribe(&subscription));
    assert!(!subscription.is_active());

    advance(60_000).await;
    assert!(pull.calls().is_empty());
    assert!(recorder.updates().is_empty());
    assert!(recorder.errors().is_empty());
    assert!(engine.topics().is_empty());
    assert_eq!(engine.open_channels(), 0);
}

#[tokio::test(start_paused = true)]
async fn unsubscribing_drops_pending_debounced_list() {
    let (push, frames) = FakePush::scripted();
    let engine = FeedEngine::new(push, list_pull(), TopicConfigArgs::default());
    let recorder = Recorder::default();
    let subscription = engine
        .subscribe("tokens/top-mc", recorder.clone())
        .expect("subscribe");

    frames
        .send(push_frame("token_list", token_list(100.0)))
        .expect("send");
    advance(10).await;
    frames
        .send(push_frame("token_list", token_list(102.0)))
        .expect("send");
    advance(1_000).await;
    assert_eq!(recorder.updates().len(), 1);

    engine.unsubscribe(&subscription);
    advance(5_000).await;
    assert_eq!(recorder.updates().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn insignificant_list_change_lands_after_quiet_period() {
    let (push, frames) = FakePush::scripted();
    let engine = FeedEngine::new(push, list_pull(), TopicConfigArgs::default());
    let recorder = Recorder::default();
    let _subscription = engine
        .subscribe("tokens/top-mc", recorder.clone())
        .expect("subscribe");

    frames
        .send(push_frame("token_list", token_list(100.0)))
        .expect("send");
    advance(10).await;
    frames
        .send(push_frame("token_list", token_list(102.0)))
        .expect("send");
    advance(2_900).await;
    assert_eq!(recorder.updates().len(), 1);

    advance(200).await;
    let updates = recorder.updates();
    assert_eq!(updates.len(), 2);
    let FeedPayload::List(snapshot) = &updates[1].payload else {
        panic!("expected a list payload");
    };
    assert_eq!(snapshot.items[0]["volume"], json!(102.0));

    // Dropping to 8 items is significant and applied at once.
    let mut shorter = token_list(102.0);
    if let Value::Array(items) = &mut shorter {
        items.truncate(8);
    }
    frames.send(push_frame("token_list", shorter)).expect("send");
    advance(10).await;
    assert_eq!(recorder.updates().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn subscribers_share_one_transport_until_both_leave() {
    let (push, _frames) = FakePush::scripted();
    let engine = FeedEngine::new(push.clone(), list_pull(), TopicConfigArgs::default());
    let first = engine
        .subscribe("tokens/top-mc", Recorder::default())
        .expect("subscribe");
    let second = engine
        .subscribe("tokens/top-mc", Recorder::default())
        .expect("subscribe");
    advance(10).await;

    assert_eq!(push.connects(), 1);
    assert_eq!(engine.open_channels(), 1);
    assert_eq!(
        engine.status("tokens/top-mc").map(|status| status.subscribers),
        Some(2)
    );

    engine.unsubscribe(&first);
    advance(10).await;
    assert_eq!(engine.open_channels(), 1);

    engine.unsubscribe(&second);
    advance(10).await;
    assert_eq!(engine.open_channels(), 0);
    assert!(engine.status("tokens/top-mc").is_none());
}

#[tokio::test(start_paused = true)]
async fn late_subscriber_receives_latest_state() {
    let (push, frames) = FakePush::scripted();
    let engine = FeedEngine::new(push, list_pull(), TopicConfigArgs::default());
    let _early = engine
        .subscribe("tokens/top-mc", Recorder::default())
        .expect("subscribe");
    frames
        .send(push_frame("token_list", token_list(100.0)))
        .expect("send");
    advance(10).await;

    let late = Recorder::default();
    let _late_subscription = engine
        .subscribe("tokens/top-mc", late.clone())
        .expect("subscribe");
    advance(10).await;

    let updates = late.updates();
    assert_eq!(updates.len(), 1);
    assert!(matches!(&updates[0].payload, FeedPayload::List(snapshot) if snapshot.len() == 10));
}

#[tokio::test(start_paused = true)]
async fn callback_may_unsubscribe_itself() {
    let (push, frames) = FakePush::scripted();
    let engine = FeedEngine::new(push, list_pull(), TopicConfigArgs::default());
    let delivered = Arc::new(AtomicUsize::new(0));
    let own_subscription: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

    let handler = {
        let engine = engine.clone();
        let delivered = Arc::clone(&delivered);
        let own_subscription = Arc::clone(&own_subscription);
        launchpad_feed::handlers(
            move |_update: &FeedUpdate| {
                delivered.fetch_add(1, Ordering::SeqCst);
                if let Some(subscription) = own_subscription.lock().take() {
                    engine.unsubscribe(&subscription);
                }
            },
            |_error: &FeedError| {},
        )
    };
    let subscription = engine
        .subscribe("tokens/So1abc/price", handler)
        .expect("subscribe");
    *own_subscription.lock() = Some(subscription);

    frames
        .send(push_frame("price_update", json!({"price": 1.0})))
        .expect("send");
    frames
        .send(push_frame("price_update", json!({"price": 2.0})))
        .expect("send");
    advance(10).await;

    assert_eq!(delivered.load(Ordering::SeqCst), 1);
    assert!(engine.topics().is_empty());
}

#[tokio::test(start_paused = true)]
async fn candle_series_merges_and_rescales() {
    let (push, frames) = FakePush::scripted();
    let engine = FeedEngine::new(push, list_pull(), TopicConfigArgs::default());
    let recorder = Recorder::default();
    let topic = "tokens/So1abc/candles/1m";
    let _subscription = engine.subscribe(topic, recorder.clone()).expect("subscribe");

    frames
        .send(push_frame(
            "candles_snapshot",
            json!([{"openTime": 1_700_000_040_000_i64, "o": 1, "h": 2, "l": 0.5, "c": 1.5, "v": 10}]),
        ))
        .expect("send");
    frames
        .send(push_frame(
            "candles_update",
            json!({"openTime": 1_700_000_040_000_i64, "o": 1, "h": 2.5, "l": 0.5, "c": 2, "v": 12}),
        ))
        .expect("send");
    advance(10).await;

    engine.rescale_candles(topic, 2.0).expect("rescale");
    assert!(engine.rescale_candles(topic, f64::NAN).is_err());
    advance(10).await;

    let updates = recorder.updates();
    assert_eq!(updates.len(), 3);
    let FeedPayload::Candles(merged) = &updates[1].payload else {
        panic!("expected candles");
    };
    assert_eq!(merged.candles.len(), 1);
    assert_eq!(merged.candles[0].index, 0);
    assert_eq!(merged.candles[0].high, 2.5);
    assert_eq!(merged.candles[0].close, 2.0);
    assert_eq!(merged.candles[0].volume, 12.0);

    let FeedPayload::Candles(rescaled) = &updates[2].payload else {
        panic!("expected candles");
    };
    assert_eq!(rescaled.candles[0].close, 4.0);
    assert_eq!(rescaled.candles[0].open_time, 1_700_000_040_000);
}

#[tokio::test(start_paused = true)]
async fn rejects_invalid_topic_and_config() {
    let engine = FeedEngine::new(FakePush::silent(), list_pull(), TopicConfigArgs::default());
    assert!(matches!(
        engine.subscribe("tokens//top", Recorder::default()),
        Err(FeedError::InvalidArgument(_))
    ));
    assert!(matches!(
        engine.subscribe_with(
            "tokens/top-mc",
            Recorder::default(),
            TopicConfigArgs {
                failure_window: Some(0),
                ..TopicConfigArgs::default()
            },
        ),
        Err(FeedError::InvalidArgument(_))
    ));
    assert!(engine.topics().is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_silences_everything() {
    let pull = list_pull();
    let engine = FeedEngine::new(FakePush::silent(), pull.clone(), TopicConfigArgs::default());
    let recorder = Recorder::default();
    let subscription = engine
        .subscribe("tokens/top-mc", recorder.clone())
        .expect("subscribe");
    engine
        .subscribe("tokens/new", recorder.clone())
        .expect("subscribe");
    advance(10).await;
    assert_eq!(engine.topics().len(), 2);

    engine.shutdown();
    advance(30_000).await;
    assert!(engine.topics().is_empty());
    assert!(!subscription.is_active());
    assert!(pull.calls().is_empty());
    assert!(recorder.updates().is_empty());
    assert_eq!(engine.open_channels(), 0);
}
