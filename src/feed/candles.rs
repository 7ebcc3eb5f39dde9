//! Candle merge engine.
//!
//! Series are positional: `index` is the x-axis slot, reassigned `0..N-1` in
//! chronological order after every merge so periods without trades never
//! render as gaps.

use crate::error::FeedError;
use crate::feed::types::{Candle, CandleInterval, CandleUpdate, Topic};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_MAX_CANDLES: usize = 5_000;

pub fn validate_candle(update: &CandleUpdate) -> Result<(), FeedError> {
    let prices = [
        ("open", update.open),
        ("high", update.high),
        ("low", update.low),
        ("close", update.close),
    ];
    for (name, value) in prices {
        if !value.is_finite() || value <= 0.0 {
            return Err(FeedError::Validation(format!(
                "candle {} has non-positive or non-finite {name}: {value}",
                update.open_time
            )));
        }
    }
    if !update.volume.is_finite() || update.volume < 0.0 {
        return Err(FeedError::Validation(format!(
            "candle {} has negative or non-finite volume: {}",
            update.open_time, update.volume
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeReport {
    pub accepted: usize,
    pub rejected: usize,
    pub len: usize,
}

#[derive(Debug, Clone)]
pub struct CandleSeries {
    interval: CandleInterval,
    candles: Arc<Vec<Candle>>,
    max_candles: usize,
}

impl CandleSeries {
    pub fn new(interval: CandleInterval, max_candles: usize) -> Self {
        Self {
            interval,
            candles: Arc::new(Vec::new()),
            max_candles: max_candles.max(1),
        }
    }

    pub fn interval(&self) -> CandleInterval {
        self.interval
    }

    pub fn candles(&self) -> &Arc<Vec<Candle>> {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn replace(&mut self, updates: &[CandleUpdate]) -> MergeReport {
        let mut report = MergeReport::default();
        let mut bars: Vec<Candle> = Vec::with_capacity(updates.len());

        for update in updates {
            if let Err(error) = validate_candle(update) {
                debug!(%error, "dropping invalid snapshot candle");
                report.rejected += 1;
                continue;
            }
            report.accepted += 1;
            bars.push(candle_from_update(update));
        }

        // stable sort keeps batch order within one open time so the last wins
        bars.sort_by_key(|bar| bar.open_time);
        bars.reverse();
        bars.dedup_by_key(|bar| bar.open_time);
        bars.reverse();

        self.candles = Arc::new(bars);
        self.finish(report)
    }

    pub fn merge(&mut self, updates: &[CandleUpdate]) -> MergeReport {
        let mut report = MergeReport::default();
        let bars = Arc::make_mut(&mut self.candles);

        for update in updates {
            if let Err(error) = validate_candle(update) {
                debug!(%error, "discarding invalid candle update");
                report.rejected += 1;
                continue;
            }
            report.accepted += 1;
            let next = candle_from_update(update);
            match bars.binary_search_by_key(&update.open_time, |bar| bar.open_time) {
                Ok(position) => {
                    let existing = &mut bars[position];
                    existing.open = next.open;
                    existing.high = next.high;
                    existing.low = next.low;
                    existing.close = next.close;
                    existing.volume = next.volume;
                }
                Err(position) => bars.insert(position, next),
            }
        }

        self.finish(report)
    }

    /// Re-denominates prices. Ordering and indices are untouched.
    pub fn rescale(&mut self, factor: f64) -> Result<(), FeedError> {
        if !factor.is_finite() || factor <= 0.0 {
            return Err(FeedError::InvalidArgument(format!(
                "rescale factor must be finite and positive, got {factor}"
            )));
        }
        for bar in Arc::make_mut(&mut self.candles).iter_mut() {
            bar.open *= factor;
            bar.high *= factor;
            bar.low *= factor;
            bar.close *= factor;
        }
        Ok(())
    }

    fn finish(&mut self, mut report: MergeReport) -> MergeReport {
        let bars = Arc::make_mut(&mut self.candles);
        if bars.len() > self.max_candles {
            let overflow = bars.len() - self.max_candles;
            bars.drain(0..overflow);
        }
        for (index, bar) in bars.iter_mut().enumerate() {
            bar.index = index;
        }
        report.len = bars.len();
        report
    }
}

fn candle_from_update(update: &CandleUpdate) -> Candle {
    Candle {
        index: 0,
        open_time: update.open_time,
        open: update.open,
        high: update.high,
        low: update.low,
        close: update.close,
        volume: update.volume,
    }
}

/// All candle series owned by one engine, keyed by topic.
#[derive(Debug)]
pub struct CandleMergeEngine {
    series: HashMap<Topic, CandleSeries>,
    max_candles: usize,
}

impl Default for CandleMergeEngine {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CANDLES)
    }
}

impl CandleMergeEngine {
    pub fn new(max_candles: usize) -> Self {
        Self {
            series: HashMap::new(),
            max_candles,
        }
    }

    pub fn apply_snapshot(
        &mut self,
        topic: &Topic,
        interval: CandleInterval,
        candles: &[CandleUpdate],
    ) -> MergeReport {
        let series = self.series_for(topic, interval);
        let report = series.replace(candles);
        debug!(
            topic = %topic,
            interval = interval.as_str(),
            accepted = report.accepted,
            rejected = report.rejected,
            "candle snapshot applied"
        );
        report
    }

    pub fn apply_incremental(
        &mut self,
        topic: &Topic,
        interval: CandleInterval,
        updates: &[CandleUpdate],
    ) -> MergeReport {
        self.series_for(topic, interval).merge(updates)
    }

    pub fn rescale(&mut self, topic: &Topic, factor: f64) -> Result<(), FeedError> {
        match self.series.get_mut(topic) {
            Some(series) => series.rescale(factor),
            None => Ok(()),
        }
    }

    pub fn series(&self, topic: &Topic) -> Option<&CandleSeries> {
        self.series.get(topic)
    }

    pub fn discard(&mut self, topic: &Topic) -> Option<CandleSeries> {
        self.series.remove(topic)
    }

    fn series_for(&mut self, topic: &Topic, interval: CandleInterval) -> &mut CandleSeries {
        let max_candles = self.max_candles;
        let series = self
            .series
            .entry(topic.clone())
            .or_insert_with(|| CandleSeries::new(interval, max_candles));
        if series.interval() != interval {
            debug!(
                topic = %topic,
                from = series.interval().as_str(),
                to = interval.as_str(),
                "interval changed, starting a new candle series"
            );
            *series = CandleSeries::new(interval, max_candles);
        }
        series
    }
}
