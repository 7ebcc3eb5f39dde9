use crate::error::{FeedError, FeedResult};
use crate::feed::candles::DEFAULT_MAX_CANDLES;
use crate::feed::dedup::{FingerprintSpec, DEFAULT_FINGERPRINT_ITEMS, DEFAULT_VOLATILE_FIELDS};
use crate::feed::fallback::FallbackConfig;
use crate::feed::stabilizer::{ListFilter, StabilizerConfig};
use crate::feed::supervisor::{BackoffConfig, ChannelSettings};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_WS_BASE_URL: &str = "ws://127.0.0.1:8080/ws";
pub const DEFAULT_HTTP_BASE_URL: &str = "http://127.0.0.1:8080/api";
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 10_000;

pub const DEFAULT_ARM_TIMEOUT_MS: u64 = 2_000;
pub const POLL_INTERVAL_ARM_MULTIPLIER: u64 = 10;
pub const DEFAULT_FAILURE_WINDOW: u32 = 3;
pub const DEFAULT_QUIET_PERIOD_MS: u64 = 3_000;
pub const DEFAULT_TOP_K: usize = 4;
pub const DEFAULT_RELATIVE_CHANGE: f64 = 0.10;
pub const DEFAULT_KEY_FIELD: &str = "address";
pub const DEFAULT_TRACKED_FIELD: &str = "volume";
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 15_000;
pub const DEFAULT_RECONNECT_BUDGET: u32 = 8;
pub const DEFAULT_STALE_AFTER_MS: u64 = 30_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

pub const MIN_ARM_TIMEOUT_MS: u64 = 100;
pub const MAX_ARM_TIMEOUT_MS: u64 = 60_000;
pub const MIN_POLL_INTERVAL_MS: u64 = 500;
pub const MAX_POLL_INTERVAL_MS: u64 = 600_000;
pub const MIN_FAILURE_WINDOW: u32 = 1;
pub const MAX_FAILURE_WINDOW: u32 = 20;
pub const MAX_QUIET_PERIOD_MS: u64 = 60_000;
pub const MIN_TOP_K: usize = 1;
pub const MAX_TOP_K: usize = 50;
pub const MAX_RELATIVE_CHANGE: f64 = 10.0;
pub const MIN_FINGERPRINT_ITEMS: usize = 1;
pub const MAX_FINGERPRINT_ITEMS: usize = 10_000;
pub const MIN_MAX_CANDLES: usize = 50;
pub const MAX_MAX_CANDLES: usize = 20_000;
pub const MIN_BACKOFF_BASE_MS: u64 = 50;
pub const MAX_BACKOFF_BASE_MS: u64 = 10_000;
pub const MAX_BACKOFF_MAX_MS: u64 = 300_000;
pub const MIN_RECONNECT_BUDGET: u32 = 1;
pub const MAX_RECONNECT_BUDGET: u32 = 1_000;
pub const MIN_STALE_AFTER_MS: u64 = 1_000;
pub const MAX_STALE_AFTER_MS: u64 = 600_000;
pub const MIN_CONNECT_TIMEOUT_MS: u64 = 500;
pub const MAX_CONNECT_TIMEOUT_MS: u64 = 120_000;
pub const MIN_HTTP_TIMEOUT_MS: u64 = 100;
pub const MAX_HTTP_TIMEOUT_MS: u64 = 120_000;

/// Per-topic overrides as supplied by callers. Every field is optional.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TopicConfigArgs {
    pub arm_timeout_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub failure_window: Option<u32>,
    pub quiet_period_ms: Option<u64>,
    pub top_k: Option<usize>,
    pub relative_change: Option<f64>,
    pub key_field: Option<String>,
    pub tracked_field: Option<String>,
    pub list_filter: Option<ListFilter>,
    pub volatile_fields: Option<Vec<String>>,
    pub fingerprint_items: Option<usize>,
    pub max_candles: Option<usize>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
    pub reconnect_budget: Option<u32>,
    pub stale_after_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct TopicConfig {
    pub fallback: FallbackConfig,
    pub stabilizer: StabilizerConfig,
    pub fingerprint: FingerprintSpec,
    pub list_filter: Option<ListFilter>,
    pub max_candles: usize,
    pub channel: ChannelSettings,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            fallback: FallbackConfig::default(),
            stabilizer: StabilizerConfig::default(),
            fingerprint: FingerprintSpec::default(),
            list_filter: None,
            max_candles: DEFAULT_MAX_CANDLES,
            channel: ChannelSettings::default(),
        }
    }
}

impl TopicConfigArgs {
    /// Fills every unset field from `defaults`.
    pub fn merged_over(self, defaults: &TopicConfigArgs) -> TopicConfigArgs {
        let defaults = defaults.clone();
        TopicConfigArgs {
            arm_timeout_ms: self.arm_timeout_ms.or(defaults.arm_timeout_ms),
            poll_interval_ms: self.poll_interval_ms.or(defaults.poll_interval_ms),
            failure_window: self.failure_window.or(defaults.failure_window),
            quiet_period_ms: self.quiet_period_ms.or(defaults.quiet_period_ms),
            top_k: self.top_k.or(defaults.top_k),
            relative_change: self.relative_change.or(defaults.relative_change),
            key_field: self.key_field.or(defaults.key_field),
            tracked_field: self.tracked_field.or(defaults.tracked_field),
            list_filter: self.list_filter.or(defaults.list_filter),
            volatile_fields: self.volatile_fields.or(defaults.volatile_fields),
            fingerprint_items: self.fingerprint_items.or(defaults.fingerprint_items),
            max_candles: self.max_candles.or(defaults.max_candles),
            backoff_base_ms: self.backoff_base_ms.or(defaults.backoff_base_ms),
            backoff_max_ms: self.backoff_max_ms.or(defaults.backoff_max_ms),
            reconnect_budget: self.reconnect_budget.or(defaults.reconnect_budget),
            stale_after_ms: self.stale_after_ms.or(defaults.stale_after_ms),
            connect_timeout_ms: self.connect_timeout_ms.or(defaults.connect_timeout_ms),
        }
    }

    pub fn normalize(self) -> FeedResult<TopicConfig> {
        let arm_timeout_ms = self.arm_timeout_ms.unwrap_or(DEFAULT_ARM_TIMEOUT_MS);
        if !(MIN_ARM_TIMEOUT_MS..=MAX_ARM_TIMEOUT_MS).contains(&arm_timeout_ms) {
            return Err(FeedError::InvalidArgument(format!(
                "armTimeoutMs must be between {MIN_ARM_TIMEOUT_MS} and {MAX_ARM_TIMEOUT_MS}"
            )));
        }

        let poll_interval_ms = self
            .poll_interval_ms
            .unwrap_or(arm_timeout_ms.saturating_mul(POLL_INTERVAL_ARM_MULTIPLIER));
        if !(MIN_POLL_INTERVAL_MS..=MAX_POLL_INTERVAL_MS).contains(&poll_interval_ms) {
            return Err(FeedError::InvalidArgument(format!(
                "pollIntervalMs must be between {MIN_POLL_INTERVAL_MS} and {MAX_POLL_INTERVAL_MS}"
            )));
        }

        let failure_window = self.failure_window.unwrap_or(DEFAULT_FAILURE_WINDOW);
        if !(MIN_FAILURE_WINDOW..=MAX_FAILURE_WINDOW).contains(&failure_window) {
            return Err(FeedError::InvalidArgument(format!(
                "failureWindow must be between {MIN_FAILURE_WINDOW} and {MAX_FAILURE_WINDOW}"
            )));
        }

        let quiet_period_ms = self.quiet_period_ms.unwrap_or(DEFAULT_QUIET_PERIOD_MS);
        if quiet_period_ms > MAX_QUIET_PERIOD_MS {
            return Err(FeedError::InvalidArgument(format!(
                "quietPeriodMs must be at most {MAX_QUIET_PERIOD_MS}"
            )));
        }

        let top_k = self.top_k.unwrap_or(DEFAULT_TOP_K);
        if !(MIN_TOP_K..=MAX_TOP_K).contains(&top_k) {
            return Err(FeedError::InvalidArgument(format!(
                "topK must be between {MIN_TOP_K} and {MAX_TOP_K}"
            )));
        }

        let relative_change = self.relative_change.unwrap_or(DEFAULT_RELATIVE_CHANGE);
        if !relative_change.is_finite()
            || relative_change <= 0.0
            || relative_change > MAX_RELATIVE_CHANGE
        {
            return Err(FeedError::InvalidArgument(format!(
                "relativeChange must be a finite number in (0, {MAX_RELATIVE_CHANGE}]"
            )));
        }

        let key_field = normalize_field_name("keyField", self.key_field, DEFAULT_KEY_FIELD)?;
        let tracked_field =
            normalize_field_name("trackedField", self.tracked_field, DEFAULT_TRACKED_FIELD)?;

        let list_filter = match self.list_filter {
            Some(filter) => {
                let field = filter.field.trim().to_string();
                if field.is_empty() || !filter.min.is_finite() {
                    return Err(FeedError::InvalidArgument(
                        "listFilter needs a non-empty field and a finite min".to_string(),
                    ));
                }
                Some(ListFilter {
                    field,
                    min: filter.min,
                })
            }
            None => None,
        };

        let volatile_fields = self
            .volatile_fields
            .unwrap_or_else(|| {
                DEFAULT_VOLATILE_FIELDS
                    .iter()
                    .map(|field| field.to_string())
                    .collect()
            })
            .into_iter()
            .map(|field| field.trim().to_string())
            .filter(|field| !field.is_empty())
            .collect::<Vec<_>>();

        let fingerprint_items = self.fingerprint_items.unwrap_or(DEFAULT_FINGERPRINT_ITEMS);
        if !(MIN_FINGERPRINT_ITEMS..=MAX_FINGERPRINT_ITEMS).contains(&fingerprint_items) {
            return Err(FeedError::InvalidArgument(format!(
                "fingerprintItems must be between {MIN_FINGERPRINT_ITEMS} and {MAX_FINGERPRINT_ITEMS}"
            )));
        }

        let max_candles = self.max_candles.unwrap_or(DEFAULT_MAX_CANDLES);
        if !(MIN_MAX_CANDLES..=MAX_MAX_CANDLES).contains(&max_candles) {
            return Err(FeedError::InvalidArgument(format!(
                "maxCandles must be between {MIN_MAX_CANDLES} and {MAX_MAX_CANDLES}"
            )));
        }

        let backoff_base_ms = self.backoff_base_ms.unwrap_or(DEFAULT_BACKOFF_BASE_MS);
        if !(MIN_BACKOFF_BASE_MS..=MAX_BACKOFF_BASE_MS).contains(&backoff_base_ms) {
            return Err(FeedError::InvalidArgument(format!(
                "backoffBaseMs must be between {MIN_BACKOFF_BASE_MS} and {MAX_BACKOFF_BASE_MS}"
            )));
        }

        let backoff_max_ms = self
            .backoff_max_ms
            .unwrap_or(DEFAULT_BACKOFF_MAX_MS.max(backoff_base_ms));
        if !(backoff_base_ms..=MAX_BACKOFF_MAX_MS).contains(&backoff_max_ms) {
            return Err(FeedError::InvalidArgument(format!(
                "backoffMaxMs must be between backoffBaseMs and {MAX_BACKOFF_MAX_MS}"
            )));
        }

        let reconnect_budget = self.reconnect_budget.unwrap_or(DEFAULT_RECONNECT_BUDGET);
        if !(MIN_RECONNECT_BUDGET..=MAX_RECONNECT_BUDGET).contains(&reconnect_budget) {
            return Err(FeedError::InvalidArgument(format!(
                "reconnectBudget must be between {MIN_RECONNECT_BUDGET} and {MAX_RECONNECT_BUDGET}"
            )));
        }

        let stale_after_ms = self.stale_after_ms.unwrap_or(DEFAULT_STALE_AFTER_MS);
        if !(MIN_STALE_AFTER_MS..=MAX_STALE_AFTER_MS).contains(&stale_after_ms) {
            return Err(FeedError::InvalidArgument(format!(
                "staleAfterMs must be between {MIN_STALE_AFTER_MS} and {MAX_STALE_AFTER_MS}"
            )));
        }

        let connect_timeout_ms = self.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS);
        if !(MIN_CONNECT_TIMEOUT_MS..=MAX_CONNECT_TIMEOUT_MS).contains(&connect_timeout_ms) {
            return Err(FeedError::InvalidArgument(format!(
                "connectTimeoutMs must be between {MIN_CONNECT_TIMEOUT_MS} and {MAX_CONNECT_TIMEOUT_MS}"
            )));
        }

        Ok(TopicConfig {
            fallback: FallbackConfig {
                arm_timeout: Duration::from_millis(arm_timeout_ms),
                poll_interval: Duration::from_millis(poll_interval_ms),
                failure_window,
            },
            stabilizer: StabilizerConfig {
                top_k,
                relative_change,
                quiet_period: Duration::from_millis(quiet_period_ms),
                key_field,
                tracked_field,
            },
            fingerprint: FingerprintSpec::new(volatile_fields, fingerprint_items),
            list_filter,
            max_candles,
            channel: ChannelSettings {
                backoff: BackoffConfig {
                    base_delay: Duration::from_millis(backoff_base_ms),
                    max_delay: Duration::from_millis(backoff_max_ms),
                },
                reconnect_budget,
                stale_after: Duration::from_millis(stale_after_ms),
                connect_timeout: Duration::from_millis(connect_timeout_ms),
                ..ChannelSettings::default()
            },
        })
    }
}

fn normalize_field_name(
    label: &str,
    value: Option<String>,
    default_value: &str,
) -> FeedResult<String> {
    let field = value
        .unwrap_or_else(|| default_value.to_string())
        .trim()
        .to_string();
    if field.is_empty() || field.chars().any(char::is_whitespace) {
        return Err(FeedError::InvalidArgument(format!(
            "{label} must be a non-empty field name without whitespace"
        )));
    }
    Ok(field)
}

/// Engine-wide settings: where the two sources live and the defaults every
/// topic starts from.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub ws_base_url: String,
    pub http_base_url: String,
    pub http_timeout_ms: u64,
    pub topic_defaults: TopicConfigArgs,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ws_base_url: DEFAULT_WS_BASE_URL.to_string(),
            http_base_url: DEFAULT_HTTP_BASE_URL.to_string(),
            http_timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
            topic_defaults: TopicConfigArgs::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> FeedResult<Self> {
        let http_timeout_ms = match env_value("FEED_HTTP_TIMEOUT_MS") {
            Some(raw) => raw.parse::<u64>().map_err(|_| {
                FeedError::InvalidArgument(format!(
                    "FEED_HTTP_TIMEOUT_MS must be an integer, got {raw:?}"
                ))
            })?,
            None => DEFAULT_HTTP_TIMEOUT_MS,
        };

        let config = Self {
            ws_base_url: env_value("FEED_WS_URL")
                .unwrap_or_else(|| DEFAULT_WS_BASE_URL.to_string()),
            http_base_url: env_value("FEED_HTTP_URL")
                .unwrap_or_else(|| DEFAULT_HTTP_BASE_URL.to_string()),
            http_timeout_ms,
            topic_defaults: TopicConfigArgs::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FeedResult<()> {
        if !(MIN_HTTP_TIMEOUT_MS..=MAX_HTTP_TIMEOUT_MS).contains(&self.http_timeout_ms) {
            return Err(FeedError::InvalidArgument(format!(
                "http timeout must be between {MIN_HTTP_TIMEOUT_MS} and {MAX_HTTP_TIMEOUT_MS} ms"
            )));
        }
        if !self.ws_base_url.starts_with("ws://") && !self.ws_base_url.starts_with("wss://") {
            return Err(FeedError::InvalidArgument(
                "push endpoint must use ws:// or wss://".to_string(),
            ));
        }
        if !self.http_base_url.starts_with("http://") && !self.http_base_url.starts_with("https://")
        {
            return Err(FeedError::InvalidArgument(
                "pull endpoint must use http:// or https://".to_string(),
            ));
        }
        self.topic_defaults.clone().normalize().map(|_| ())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
