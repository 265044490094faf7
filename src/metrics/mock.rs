use crate::error::AppError;
use crate::metrics::snapshot::SnapshotSource;
use crate::metrics::stream::{AppendOutcome, SharedEventLog};
use crate::metrics::types::{EventMessage, SnapshotEntry};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub const MOCK_STREAM_INTERVAL_MS: u64 = 750;

pub const MOCK_METRIC_NAMES: [&str; 4] = [
    "total_verifications",
    "success_rate",
    "avg_response_time_ms",
    "cache_efficiency",
];

/// Deterministic snapshot that drifts a little on every poll.
#[derive(Debug, Default)]
pub struct MockSnapshotSource {
    polls: AtomicU64,
}

impl MockSnapshotSource {
    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }
}

pub fn mock_snapshot_values(poll: u64) -> Vec<SnapshotEntry> {
    let step = poll as f64;
    vec![
        SnapshotEntry::new("total_verifications", 1_000.0 + step * 50.0),
        SnapshotEntry::new("success_rate", 95.0 - (poll % 5) as f64),
        SnapshotEntry::new("avg_response_time_ms", 180.0 + (poll % 7) as f64 * 3.5),
        SnapshotEntry::new("cache_efficiency", 0.80 + (poll % 4) as f64 * 0.02),
    ]
}

impl SnapshotSource for MockSnapshotSource {
    async fn fetch_snapshot(&self) -> Result<Vec<SnapshotEntry>, AppError> {
        let poll = self.polls.fetch_add(1, Ordering::Relaxed);
        Ok(mock_snapshot_values(poll))
    }
}

/// Partial update touching one or two metrics, chosen from the sequence.
pub fn mock_event_message(sequence: u64) -> EventMessage {
    let mut fields = BTreeMap::new();
    match sequence % 3 {
        0 => {
            fields.insert(
                "success_rate".to_string(),
                96.0 + (sequence % 4) as f64 * 0.5,
            );
        }
        1 => {
            fields.insert(
                "avg_response_time_ms".to_string(),
                150.0 + (sequence % 9) as f64 * 4.0,
            );
        }
        _ => {
            fields.insert(
                "success_rate".to_string(),
                97.0 - (sequence % 3) as f64 * 0.25,
            );
            fields.insert(
                "cache_efficiency".to_string(),
                0.85 + (sequence % 5) as f64 * 0.01,
            );
        }
    }

    EventMessage { sequence, fields }
}

pub async fn run_mock_event_producer(log: &SharedEventLog, cancel_token: &CancellationToken) {
    let mut sequence = 0_u64;
    let mut ticker = tokio::time::interval(Duration::from_millis(MOCK_STREAM_INTERVAL_MS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    {
        let mut writable = log.write();
        writable.restart();
    }

    while !cancel_token.is_cancelled() {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                sequence = sequence.saturating_add(1);
                let outcome = log.write().append(mock_event_message(sequence));
                if let AppendOutcome::Stale { current, last } = outcome {
                    tracing::warn!(current, last, "mock producer emitted a stale sequence");
                }
            }
        }
    }
}
