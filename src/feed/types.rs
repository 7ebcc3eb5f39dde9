use crate::error::{FeedError, FeedResult};
use crate::feed::dedup::Fingerprint;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Identifier of one logical feed, e.g. `tokens/top-mc` or
/// `tokens/{addr}/candles/{interval}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(Arc<str>);

impl Topic {
    pub fn parse(raw: &str) -> FeedResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(FeedError::InvalidArgument(
                "topic must not be empty".to_string(),
            ));
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(FeedError::InvalidArgument(format!(
                "topic '{trimmed}' must not contain whitespace"
            )));
        }
        if trimmed.starts_with('/') || trimmed.ends_with('/') || trimmed.contains("//") {
            return Err(FeedError::InvalidArgument(format!(
                "topic '{trimmed}' must not contain empty path segments"
            )));
        }
        Ok(Self(Arc::from(trimmed)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Interval of a `.../candles/{interval}` topic.
    pub fn candle_interval(&self) -> Option<CandleInterval> {
        let segments: Vec<&str> = self.segments().collect();
        segments
            .windows(2)
            .rev()
            .find(|pair| pair[0] == "candles")
            .and_then(|pair| CandleInterval::parse_str(pair[1]).ok())
    }

    /// Kind assumed for a pulled payload that carries no `type` envelope.
    pub fn default_snapshot_kind(&self) -> MessageKind {
        if self.candle_interval().is_some() {
            MessageKind::CandlesSnapshot
        } else if self.segments().any(|segment| segment.starts_with("balance")) {
            MessageKind::BalanceUpdate
        } else if self.segments().any(|segment| segment == "trades" || segment == "price") {
            MessageKind::PriceUpdate
        } else {
            MessageKind::TokenList
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Topic {
    type Error = FeedError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Topic> for String {
    fn from(value: Topic) -> Self {
        value.0.to_string()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CandleInterval {
    #[serde(rename = "1s")]
    S1,
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl CandleInterval {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::S1 => "1s",
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }

    pub fn parse_str(raw: &str) -> FeedResult<Self> {
        match raw.trim() {
            "1s" => Ok(Self::S1),
            "1m" => Ok(Self::M1),
            "5m" => Ok(Self::M5),
            "15m" => Ok(Self::M15),
            "1h" => Ok(Self::H1),
            "4h" => Ok(Self::H4),
            "1d" => Ok(Self::D1),
            other => Err(FeedError::InvalidArgument(format!(
                "unsupported candle interval '{other}'"
            ))),
        }
    }

    pub fn duration_ms(self) -> i64 {
        match self {
            Self::S1 => 1_000,
            Self::M1 => 60_000,
            Self::M5 => 300_000,
            Self::M15 => 900_000,
            Self::H1 => 3_600_000,
            Self::H4 => 14_400_000,
            Self::D1 => 86_400_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Connecting,
    Live,
    Dead,
    FallbackActive,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Push,
    Pull,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    TokenList,
    PriceUpdate,
    CandlesSnapshot,
    CandlesUpdate,
    BalanceUpdate,
    Other(String),
}

impl MessageKind {
    pub fn parse_str(raw: &str) -> Self {
        match raw {
            "token_list" => Self::TokenList,
            "price_update" => Self::PriceUpdate,
            "candles_snapshot" => Self::CandlesSnapshot,
            "candles_update" => Self::CandlesUpdate,
            "balance_update" => Self::BalanceUpdate,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::TokenList => "token_list",
            Self::PriceUpdate => "price_update",
            Self::CandlesSnapshot => "candles_snapshot",
            Self::CandlesUpdate => "candles_update",
            Self::BalanceUpdate => "balance_update",
            Self::Other(raw) => raw,
        }
    }
}

/// One decoded inbound message, from either source.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedMessage {
    pub kind: MessageKind,
    pub data: Value,
}

impl FeedMessage {
    pub fn new(kind: MessageKind, data: Value) -> Self {
        Self { kind, data }
    }
}

#[derive(Debug, Deserialize)]
struct FeedEnvelopeWire {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

pub fn parse_feed_payload(payload: &mut [u8]) -> FeedResult<FeedMessage> {
    let wire: FeedEnvelopeWire = simd_json::serde::from_slice(payload)?;
    if wire.kind.trim().is_empty() {
        return Err(FeedError::Parse(
            "message type discriminator is empty".to_string(),
        ));
    }
    Ok(FeedMessage::new(MessageKind::parse_str(wire.kind.trim()), wire.data))
}

/// Decodes a pulled body: an enveloped message, or a bare payload whose kind
/// is inferred from the topic.
pub fn parse_pull_payload(topic: &Topic, payload: &mut [u8]) -> FeedResult<FeedMessage> {
    let value: Value = simd_json::serde::from_slice(payload)?;
    if let Some(kind) = value.get("type").and_then(Value::as_str) {
        let data = value.get("data").cloned().unwrap_or(Value::Null);
        return Ok(FeedMessage::new(MessageKind::parse_str(kind), data));
    }
    Ok(FeedMessage::new(topic.default_snapshot_kind(), value))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum WireNumber {
    Number(f64),
    Text(String),
}

impl WireNumber {
    fn value(&self) -> FeedResult<f64> {
        match self {
            Self::Number(value) => Ok(*value),
            Self::Text(raw) => Ok(raw.trim().parse::<f64>()?),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CandleWire {
    #[serde(alias = "t", alias = "time", alias = "open_time", alias = "timestamp")]
    #[serde(rename = "openTime")]
    open_time: WireNumber,
    #[serde(alias = "o")]
    open: WireNumber,
    #[serde(alias = "h")]
    high: WireNumber,
    #[serde(alias = "l")]
    low: WireNumber,
    #[serde(alias = "c")]
    close: WireNumber,
    #[serde(alias = "v", default = "zero_volume")]
    volume: WireNumber,
}

fn zero_volume() -> WireNumber {
    WireNumber::Number(0.0)
}

/// An OHLCV bar as received, before validation and indexing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandleUpdate {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl TryFrom<CandleWire> for CandleUpdate {
    type Error = FeedError;

    fn try_from(value: CandleWire) -> Result<Self, Self::Error> {
        let open_time = value.open_time.value()?;
        if !open_time.is_finite() {
            return Err(FeedError::Parse("candle openTime must be finite".to_string()));
        }
        Ok(Self {
            open_time: open_time as i64,
            open: value.open.value()?,
            high: value.high.value()?,
            low: value.low.value()?,
            close: value.close.value()?,
            volume: value.volume.value()?,
        })
    }
}

/// Positional bar of a [`crate::feed::candles::CandleSeries`]. `index` is the
/// x-axis position; display time must always come from `open_time`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub index: usize,
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Decodes a candle batch. Accepts an array, a single bar, or an object with a
/// `candles`/`bars` array. Returns the decodable bars and the number of
/// entries that could not be decoded.
pub fn parse_candle_batch(data: &Value) -> (Vec<CandleUpdate>, usize) {
    let entries: Vec<&Value> = match data {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => match map.get("candles").or_else(|| map.get("bars")) {
            Some(Value::Array(items)) => items.iter().collect(),
            Some(_) => Vec::new(),
            None => vec![data],
        },
        _ => Vec::new(),
    };

    let mut updates = Vec::with_capacity(entries.len());
    let mut undecodable = 0_usize;
    for entry in entries {
        let decoded = serde_json::from_value::<CandleWire>(entry.clone())
            .map_err(FeedError::from)
            .and_then(CandleUpdate::try_from);
        match decoded {
            Ok(update) => updates.push(update),
            Err(_) => undecodable += 1,
        }
    }
    (updates, undecodable)
}

/// A full replacement list for a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct ListSnapshot {
    pub items: Vec<Value>,
    pub fingerprint: Fingerprint,
}

impl ListSnapshot {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Extracts list items from a `token_list` payload: a bare array or an
/// object wrapping one under `tokens`/`items`.
pub fn list_items(data: &Value) -> Option<&Vec<Value>> {
    match data {
        Value::Array(items) => Some(items),
        Value::Object(map) => map
            .get("tokens")
            .or_else(|| map.get("items"))
            .and_then(Value::as_array),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandleSeriesView {
    pub interval: CandleInterval,
    pub candles: Arc<Vec<Candle>>,
}

/// What a subscriber receives through `on_data`.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedPayload {
    List(Arc<ListSnapshot>),
    Candles(CandleSeriesView),
    Value { kind: MessageKind, data: Arc<Value> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedUpdate {
    pub topic: Topic,
    pub source: DataSource,
    pub payload: FeedPayload,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicStatusSnapshot {
    pub topic: String,
    pub state: ChannelState,
    pub subscribers: usize,
    pub last_message_unix_ms: Option<i64>,
    pub consecutive_pull_failures: u32,
    pub apply_p50_us: Option<u32>,
    pub apply_p95_us: Option<u32>,
    pub apply_p99_us: Option<u32>,
    pub ingest_count: u64,
    pub emit_count: u64,
    pub reason: Option<String>,
}
