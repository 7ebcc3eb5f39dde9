//! Anti-jitter buffer for list-shaped feeds.
//!
//! Significant changes (list size, top-K ordering, a large move of the
//! tracked field on the first row) apply immediately. Anything else is held
//! as `pending` and promoted once the quiet period passes without a newer
//! significant change.

use crate::feed::types::ListSnapshot;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const KEY_FIELD_FALLBACKS: &[&str] = &["address", "mint", "id"];

/// Keeps only items whose `field` is at least `min`, e.g. graduation
/// progress >= 80.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilter {
    pub field: String,
    pub min: f64,
}

impl ListFilter {
    pub fn retains(&self, item: &Value) -> bool {
        numeric_field(item, &self.field)
            .map(|value| value >= self.min)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StabilizerConfig {
    pub top_k: usize,
    pub relative_change: f64,
    pub quiet_period: Duration,
    pub key_field: String,
    pub tracked_field: String,
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            top_k: 4,
            relative_change: 0.10,
            quiet_period: Duration::from_millis(3_000),
            key_field: "address".to_string(),
            tracked_field: "volume".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct Stabilizer {
    config: StabilizerConfig,
    applied: Option<Arc<ListSnapshot>>,
    pending: Option<Arc<ListSnapshot>>,
    pending_since: Option<Instant>,
}

impl Stabilizer {
    pub fn new(config: StabilizerConfig) -> Self {
        Self {
            config,
            applied: None,
            pending: None,
            pending_since: None,
        }
    }

    /// Returns the snapshot to apply now, or `None` when it was deferred.
    pub fn offer(&mut self, snapshot: Arc<ListSnapshot>, now: Instant) -> Option<Arc<ListSnapshot>> {
        let significant = match self.applied.as_deref() {
            None => true,
            Some(applied) => self.is_significant(applied, &snapshot),
        };

        if significant {
            self.pending = None;
            self.pending_since = None;
            self.applied = Some(Arc::clone(&snapshot));
            return Some(snapshot);
        }

        self.pending = Some(snapshot);
        self.pending_since = Some(now);
        None
    }

    pub fn pending_deadline(&self) -> Option<Instant> {
        self.pending_since
            .map(|since| since + self.config.quiet_period)
    }

    /// Promotes the pending snapshot if its quiet period has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<Arc<ListSnapshot>> {
        let deadline = self.pending_deadline()?;
        if now < deadline {
            return None;
        }
        let promoted = self.pending.take()?;
        self.pending_since = None;
        self.applied = Some(Arc::clone(&promoted));
        Some(promoted)
    }

    pub fn applied(&self) -> Option<&Arc<ListSnapshot>> {
        self.applied.as_ref()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Forgets everything so the next offer is a cold start.
    pub fn reset(&mut self) {
        self.applied = None;
        self.pending = None;
        self.pending_since = None;
    }

    pub fn is_significant(&self, applied: &ListSnapshot, candidate: &ListSnapshot) -> bool {
        if applied.len() != candidate.len() {
            return true;
        }

        let top_k = self.config.top_k;
        let applied_keys = applied
            .items
            .iter()
            .take(top_k)
            .map(|item| self.item_key(item));
        let candidate_keys = candidate
            .items
            .iter()
            .take(top_k)
            .map(|item| self.item_key(item));
        if !applied_keys.eq(candidate_keys) {
            return true;
        }

        let tracked = &self.config.tracked_field;
        let previous = applied.items.first().and_then(|item| numeric_field(item, tracked));
        let next = candidate
            .items
            .first()
            .and_then(|item| numeric_field(item, tracked));
        match (previous, next) {
            (Some(previous), Some(next)) => {
                relative_change(previous, next) > self.config.relative_change
            }
            (None, None) => false,
            _ => true,
        }
    }

    fn item_key(&self, item: &Value) -> Option<String> {
        std::iter::once(self.config.key_field.as_str())
            .chain(KEY_FIELD_FALLBACKS.iter().copied())
            .find_map(|field| item.get(field))
            .map(|key| match key {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
    }
}

fn relative_change(previous: f64, next: f64) -> f64 {
    if previous == 0.0 {
        return if next == 0.0 { 0.0 } else { f64::INFINITY };
    }
    ((next - previous) / previous).abs()
}

pub(crate) fn numeric_field(item: &Value, field: &str) -> Option<f64> {
    match item.get(field)? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|value| value.is_finite())
}
