use std::time::{SystemTime, UNIX_EPOCH};

const APPLY_WINDOW_CAPACITY: usize = 1_024;

#[derive(Debug, Clone)]
struct RollingWindowU32 {
    values: Box<[u32; APPLY_WINDOW_CAPACITY]>,
    len: usize,
    cursor: usize,
}

impl Default for RollingWindowU32 {
    fn default() -> Self {
        Self {
            values: Box::new([0; APPLY_WINDOW_CAPACITY]),
            len: 0,
            cursor: 0,
        }
    }
}

impl RollingWindowU32 {
    fn push(&mut self, value: u32) {
        self.values[self.cursor] = value;
        self.cursor = (self.cursor + 1) % APPLY_WINDOW_CAPACITY;
        if self.len < APPLY_WINDOW_CAPACITY {
            self.len += 1;
        }
    }

    fn percentiles(&self) -> (Option<u32>, Option<u32>, Option<u32>) {
        if self.len == 0 {
            return (None, None, None);
        }

        let mut snapshot = Vec::with_capacity(self.len);
        snapshot.extend_from_slice(&self.values[..self.len]);
        snapshot.sort_unstable();

        (
            percentile_from_sorted(&snapshot, 50),
            percentile_from_sorted(&snapshot, 95),
            percentile_from_sorted(&snapshot, 99),
        )
    }
}

fn percentile_from_sorted(sorted_values: &[u32], percentile: usize) -> Option<u32> {
    if sorted_values.is_empty() {
        return None;
    }
    let max_index = sorted_values.len().saturating_sub(1);
    let index = max_index.saturating_mul(percentile).saturating_div(100);
    sorted_values.get(index).copied()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelinePerf {
    pub apply_p50_us: Option<u32>,
    pub apply_p95_us: Option<u32>,
    pub apply_p99_us: Option<u32>,
    pub ingest_count: u64,
    pub emit_count: u64,
}

/// Per-topic counters: how many messages entered the pipeline, how many
/// updates left it, and how long each apply step took.
#[derive(Debug, Default)]
pub struct PipelineTelemetry {
    apply_us: RollingWindowU32,
    ingest_count: u64,
    emit_count: u64,
}

impl PipelineTelemetry {
    pub fn record_ingest(&mut self, apply_us: u32) {
        self.apply_us.push(apply_us);
        self.ingest_count = self.ingest_count.saturating_add(1);
    }

    pub fn record_emit(&mut self) {
        self.emit_count = self.emit_count.saturating_add(1);
    }

    pub fn snapshot(&self) -> PipelinePerf {
        let (apply_p50_us, apply_p95_us, apply_p99_us) = self.apply_us.percentiles();
        PipelinePerf {
            apply_p50_us,
            apply_p95_us,
            apply_p99_us,
            ingest_count: self.ingest_count,
            emit_count: self.emit_count,
        }
    }
}

pub fn elapsed_us(started_at: std::time::Instant) -> u32 {
    started_at.elapsed().as_micros().min(u32::MAX as u128) as u32
}

pub fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
