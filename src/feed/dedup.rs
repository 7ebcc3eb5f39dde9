//! Fingerprint-based duplicate suppression.
//!
//! A fingerprint hashes what the UI renders and skips what only changes on
//! the wire (sequence numbers, server timestamps). Numbers are hashed by
//! value so `1` and `1.0` collide, and object keys are visited in sorted
//! order.

use crate::feed::types::{FeedMessage, MessageKind};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

pub const DEFAULT_VOLATILE_FIELDS: &[&str] = &[
    "seq",
    "sequence",
    "ts",
    "timestamp",
    "serverTime",
    "receivedAt",
];
pub const DEFAULT_FINGERPRINT_ITEMS: usize = 50;

/// Bar identity on candle messages; always hashed even when listed as
/// volatile.
const CANDLE_KEY_FIELDS: &[&str] = &["openTime", "t", "time", "open_time", "timestamp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub u64);

#[derive(Debug, Clone)]
pub struct FingerprintSpec {
    volatile_fields: Vec<String>,
    max_items: usize,
}

impl Default for FingerprintSpec {
    fn default() -> Self {
        Self {
            volatile_fields: DEFAULT_VOLATILE_FIELDS
                .iter()
                .map(|field| field.to_string())
                .collect(),
            max_items: DEFAULT_FINGERPRINT_ITEMS,
        }
    }
}

impl FingerprintSpec {
    pub fn new(volatile_fields: Vec<String>, max_items: usize) -> Self {
        Self {
            volatile_fields,
            max_items: max_items.max(1),
        }
    }

    pub fn of_message(&self, message: &FeedMessage) -> Fingerprint {
        let mut hasher = DefaultHasher::new();
        message.kind.hash(&mut hasher);
        let preserved: &[&str] = match message.kind {
            MessageKind::CandlesSnapshot | MessageKind::CandlesUpdate => CANDLE_KEY_FIELDS,
            _ => &[],
        };
        self.hash_value(&message.data, preserved, &mut hasher);
        Fingerprint(hasher.finish())
    }

    pub fn of_items(&self, items: &[Value]) -> Fingerprint {
        let mut hasher = DefaultHasher::new();
        items.len().hash(&mut hasher);
        for item in items.iter().take(self.max_items) {
            self.hash_value(item, &[], &mut hasher);
        }
        Fingerprint(hasher.finish())
    }

    fn is_volatile(&self, key: &str, preserved: &[&str]) -> bool {
        !preserved.contains(&key) && self.volatile_fields.iter().any(|field| field == key)
    }

    fn hash_value(&self, value: &Value, preserved: &[&str], hasher: &mut DefaultHasher) {
        match value {
            Value::Null => 0_u8.hash(hasher),
            Value::Bool(flag) => {
                1_u8.hash(hasher);
                flag.hash(hasher);
            }
            Value::Number(number) => {
                2_u8.hash(hasher);
                let normalized = number.as_f64().unwrap_or_default();
                // -0.0 and 0.0 render the same
                let bits = if normalized == 0.0 { 0 } else { normalized.to_bits() };
                bits.hash(hasher);
            }
            Value::String(text) => {
                3_u8.hash(hasher);
                text.hash(hasher);
            }
            Value::Array(items) => {
                4_u8.hash(hasher);
                items.len().hash(hasher);
                for item in items.iter().take(self.max_items) {
                    self.hash_value(item, preserved, hasher);
                }
            }
            Value::Object(map) => {
                5_u8.hash(hasher);
                let mut keys: Vec<&String> =
                    map.keys().filter(|key| !self.is_volatile(key, preserved)).collect();
                keys.sort_unstable();
                for key in keys {
                    key.hash(hasher);
                    if let Some(field) = map.get(key) {
                        self.hash_value(field, preserved, hasher);
                    }
                }
            }
        }
    }
}

/// Per-topic duplicate filter. Fingerprints are tracked per message kind so
/// interleaved kinds on one topic do not evict each other.
#[derive(Debug, Default)]
pub struct Deduplicator {
    spec: FingerprintSpec,
    last_accepted: HashMap<MessageKind, Fingerprint>,
    dropped: u64,
}

impl Deduplicator {
    pub fn new(spec: FingerprintSpec) -> Self {
        Self {
            spec,
            last_accepted: HashMap::new(),
            dropped: 0,
        }
    }

    pub fn accept(&mut self, message: FeedMessage) -> Option<FeedMessage> {
        let fingerprint = self.spec.of_message(&message);
        match self.last_accepted.get(&message.kind) {
            Some(previous) if *previous == fingerprint => {
                self.dropped = self.dropped.saturating_add(1);
                None
            }
            _ => {
                self.last_accepted.insert(message.kind.clone(), fingerprint);
                Some(message)
            }
        }
    }

    pub fn reset(&mut self) {
        self.last_accepted.clear();
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn spec(&self) -> &FingerprintSpec {
        &self.spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn token_list(data: Value) -> FeedMessage {
        FeedMessage::new(MessageKind::TokenList, data)
    }

    #[test]
    fn drops_repeated_payload() {
        let mut dedup = Deduplicator::default();
        let message = token_list(json!([{"address": "a", "volume": 10}]));

        assert!(dedup.accept(message.clone()).is_some());
        assert!(dedup.accept(message).is_none());
        assert_eq!(dedup.dropped(), 1);
    }

    #[test]
    fn ignores_volatile_sequence_fields() {
        let mut dedup = Deduplicator::default();
        let first = token_list(json!({"seq": 1, "tokens": [{"address": "a"}]}));
        let second = token_list(json!({"seq": 2, "tokens": [{"address": "a"}]}));

        assert!(dedup.accept(first).is_some());
        assert!(dedup.accept(second).is_none());
    }

    #[test]
    fn treats_integer_and_float_forms_as_equal() {
        let spec = FingerprintSpec::default();
        let integer = token_list(json!({"price": 1}));
        let float = token_list(json!({"price": 1.0}));
        assert_eq!(spec.of_message(&integer), spec.of_message(&float));
    }

    #[test]
    fn order_of_items_changes_fingerprint() {
        let spec = FingerprintSpec::default();
        let first = token_list(json!([{"address": "a"}, {"address": "b"}]));
        let swapped = token_list(json!([{"address": "b"}, {"address": "a"}]));
        assert_ne!(spec.of_message(&first), spec.of_message(&swapped));
    }

    #[test]
    fn kinds_are_tracked_independently() {
        let mut dedup = Deduplicator::default();
        let list = token_list(json!([{"address": "a"}]));
        let price = FeedMessage::new(MessageKind::PriceUpdate, json!({"price": 2}));

        assert!(dedup.accept(list.clone()).is_some());
        assert!(dedup.accept(price).is_some());
        assert!(dedup.accept(list).is_none());
    }

    #[test]
    fn candle_open_time_is_never_volatile() {
        let mut dedup = Deduplicator::default();
        let bar = |timestamp: i64| {
            FeedMessage::new(
                MessageKind::CandlesUpdate,
                json!({"timestamp": timestamp, "o": 1, "h": 1, "l": 1, "c": 1, "v": 0}),
            )
        };

        assert!(dedup.accept(bar(60_000)).is_some());
        assert!(dedup.accept(bar(120_000)).is_some());
        assert!(dedup.accept(bar(120_000)).is_none());

        let price = |timestamp: i64| {
            FeedMessage::new(
                MessageKind::PriceUpdate,
                json!({"timestamp": timestamp, "price": 1}),
            )
        };
        assert!(dedup.accept(price(1)).is_some());
        assert!(dedup.accept(price(2)).is_none());
    }

    #[test]
    fn reset_accepts_next_message_as_baseline() {
        let mut dedup = Deduplicator::default();
        let message = token_list(json!([{"address": "a"}]));
        assert!(dedup.accept(message.clone()).is_some());
        dedup.reset();
        assert!(dedup.accept(message).is_some());
    }

    proptest! {
        #[test]
        fn emits_at_most_once_per_run_of_identical_payloads(
            runs in proptest::collection::vec((0_u8..4, 1_usize..6), 1..30)
        ) {
            let mut dedup = Deduplicator::default();
            let mut emitted = 0_usize;
            let mut expected = 0_usize;
            let mut previous: Option<u8> = None;

            for (value, repeat) in runs {
                if previous != Some(value) {
                    expected += 1;
                }
                previous = Some(value);
                for seq in 0..repeat {
                    let message = token_list(json!({"seq": seq, "value": value}));
                    if dedup.accept(message).is_some() {
                        emitted += 1;
                    }
                }
            }

            prop_assert_eq!(emitted, expected);
        }
    }
}
