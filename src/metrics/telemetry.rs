use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

const PERF_WINDOW_CAPACITY: usize = 1_024;

/// Lock-free counters read by the status heartbeat.
#[derive(Debug, Default)]
pub struct ReconcileTelemetry {
    processed_count: AtomicU64,
    has_last_sequence: AtomicBool,
    last_sequence: AtomicU64,
    tracked_metrics: AtomicU64,
    has_last_snapshot_at_ms: AtomicBool,
    last_snapshot_at_ms: AtomicI64,
    snapshot_failures: AtomicU64,
    cursor_resets: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub processed_count: u64,
    pub last_sequence: Option<u64>,
    pub tracked_metrics: u64,
    pub last_snapshot_at_ms: Option<i64>,
    pub snapshot_failures: u64,
    pub cursor_resets: u64,
}

impl ReconcileTelemetry {
    pub fn record_fold(&self, processed_count: usize, last_sequence: Option<u64>, tracked: usize) {
        self.processed_count
            .fetch_add(processed_count as u64, Ordering::Relaxed);
        if let Some(sequence) = last_sequence {
            self.last_sequence.store(sequence, Ordering::Relaxed);
            self.has_last_sequence.store(true, Ordering::Relaxed);
        }
        self.tracked_metrics.store(tracked as u64, Ordering::Relaxed);
    }

    pub fn record_snapshot_success(&self, at_ms: i64, tracked: usize) {
        self.last_snapshot_at_ms.store(at_ms, Ordering::Relaxed);
        self.has_last_snapshot_at_ms.store(true, Ordering::Relaxed);
        self.tracked_metrics.store(tracked as u64, Ordering::Relaxed);
    }

    pub fn record_snapshot_failure(&self) {
        self.snapshot_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cursor_reset(&self) {
        self.cursor_resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            processed_count: self.processed_count.load(Ordering::Relaxed),
            last_sequence: if self.has_last_sequence.load(Ordering::Relaxed) {
                Some(self.last_sequence.load(Ordering::Relaxed))
            } else {
                None
            },
            tracked_metrics: self.tracked_metrics.load(Ordering::Relaxed),
            last_snapshot_at_ms: if self.has_last_snapshot_at_ms.load(Ordering::Relaxed) {
                Some(self.last_snapshot_at_ms.load(Ordering::Relaxed))
            } else {
                None
            },
            snapshot_failures: self.snapshot_failures.load(Ordering::Relaxed),
            cursor_resets: self.cursor_resets.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
struct RollingWindowU32 {
    values: Vec<u32>,
    cursor: usize,
}

impl Default for RollingWindowU32 {
    fn default() -> Self {
        Self {
            values: Vec::with_capacity(PERF_WINDOW_CAPACITY),
            cursor: 0,
        }
    }
}

impl RollingWindowU32 {
    fn push(&mut self, value: u32) {
        if self.values.len() < PERF_WINDOW_CAPACITY {
            self.values.push(value);
        } else {
            self.values[self.cursor] = value;
        }
        self.cursor = (self.cursor + 1) % PERF_WINDOW_CAPACITY;
    }

    fn percentiles(&self) -> (Option<u32>, Option<u32>, Option<u32>) {
        let mut sorted = self.values.clone();
        sorted.sort_unstable();

        (
            percentile_from_sorted(&sorted, 50),
            percentile_from_sorted(&sorted, 95),
            percentile_from_sorted(&sorted, 99),
        )
    }
}

fn percentile_from_sorted(sorted_values: &[u32], percentile: usize) -> Option<u32> {
    if sorted_values.is_empty() {
        return None;
    }
    let max_index = sorted_values.len() - 1;
    let index = max_index.saturating_mul(percentile) / 100;
    sorted_values.get(index).copied()
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilePerfSnapshot {
    pub fold_p50_us: Option<u32>,
    pub fold_p95_us: Option<u32>,
    pub fold_p99_us: Option<u32>,
    pub fetch_p50_ms: Option<u32>,
    pub fetch_p95_ms: Option<u32>,
    pub fetch_p99_ms: Option<u32>,
    pub fold_count: u64,
    pub fetch_count: u64,
}

#[derive(Debug, Default)]
pub struct PerformanceTelemetry {
    fold_us: RollingWindowU32,
    fetch_ms: RollingWindowU32,
    fold_count: u64,
    fetch_count: u64,
}

impl PerformanceTelemetry {
    pub fn record_fold(&mut self, elapsed_us: u128) {
        self.fold_us.push(elapsed_us.min(u32::MAX as u128) as u32);
        self.fold_count = self.fold_count.saturating_add(1);
    }

    pub fn record_fetch(&mut self, elapsed_ms: u128) {
        self.fetch_ms.push(elapsed_ms.min(u32::MAX as u128) as u32);
        self.fetch_count = self.fetch_count.saturating_add(1);
    }

    pub fn snapshot(&self) -> ReconcilePerfSnapshot {
        let (fold_p50_us, fold_p95_us, fold_p99_us) = self.fold_us.percentiles();
        let (fetch_p50_ms, fetch_p95_ms, fetch_p99_ms) = self.fetch_ms.percentiles();

        ReconcilePerfSnapshot {
            fold_p50_us,
            fold_p95_us,
            fold_p99_us,
            fetch_p50_ms,
            fetch_p95_ms,
            fetch_p99_ms,
            fold_count: self.fold_count,
            fetch_count: self.fetch_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_snapshot_tracks_optional_fields() {
        let telemetry = ReconcileTelemetry::default();
        assert_eq!(telemetry.snapshot(), TelemetrySnapshot::default());

        telemetry.record_fold(3, Some(42), 4);
        telemetry.record_fold(0, None, 4);
        telemetry.record_snapshot_failure();
        telemetry.record_snapshot_success(1_700, 5);

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.processed_count, 3);
        assert_eq!(snapshot.last_sequence, Some(42));
        assert_eq!(snapshot.tracked_metrics, 5);
        assert_eq!(snapshot.last_snapshot_at_ms, Some(1_700));
        assert_eq!(snapshot.snapshot_failures, 1);
    }

    #[test]
    fn percentiles_come_from_recent_window() {
        let mut perf = PerformanceTelemetry::default();
        assert_eq!(perf.snapshot().fold_p50_us, None);

        for value in 1..=100 {
            perf.record_fold(value);
        }
        let snapshot = perf.snapshot();
        assert_eq!(snapshot.fold_p50_us, Some(50));
        assert_eq!(snapshot.fold_p99_us, Some(99));
        assert_eq!(snapshot.fold_count, 100);
        assert_eq!(snapshot.fetch_count, 0);
    }

    #[test]
    fn rolling_window_overwrites_oldest() {
        let mut window = RollingWindowU32::default();
        for _ in 0..PERF_WINDOW_CAPACITY {
            window.push(1);
        }
        for _ in 0..PERF_WINDOW_CAPACITY {
            window.push(7);
        }

        assert_eq!(window.values.len(), PERF_WINDOW_CAPACITY);
        assert_eq!(window.percentiles(), (Some(7), Some(7), Some(7)));
    }
}
