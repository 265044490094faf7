use crate::metrics::cursor::EventCursor;
use crate::metrics::freshness::FreshnessSignal;
use crate::metrics::merger::{apply_snapshot, apply_stream_batch, SnapshotApplyOutcome};
use crate::metrics::poller::{spawn_fallback_poller, PollerHandle, PollerState};
use crate::metrics::snapshot::SnapshotSource;
use crate::metrics::telemetry::{
    PerformanceTelemetry, ReconcilePerfSnapshot, ReconcileTelemetry, TelemetrySnapshot,
};
use crate::metrics::types::{EventMessage, MetricStateSet, MetricValue, SnapshotEntry};
use crate::metrics::now_unix_ms;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct ReconcileState {
    metrics: MetricStateSet,
    cursor: EventCursor,
    log_epoch: Option<u64>,
}

/// One reconciliation session: the merged metric set, the stream cursor, the
/// freshness highlight and the fallback poller that feeds snapshots in.
///
/// The merge state is only locked for synchronous folds, never across an
/// await point.
pub struct MetricsSession {
    shared: Arc<Mutex<ReconcileState>>,
    freshness: FreshnessSignal,
    telemetry: Arc<ReconcileTelemetry>,
    perf: Arc<Mutex<PerformanceTelemetry>>,
    poller: Mutex<Option<PollerHandle>>,
}

impl MetricsSession {
    pub fn new(freshness_window: Duration) -> Self {
        Self {
            shared: Arc::new(Mutex::new(ReconcileState::default())),
            freshness: FreshnessSignal::new(freshness_window),
            telemetry: Arc::new(ReconcileTelemetry::default()),
            perf: Arc::new(Mutex::new(PerformanceTelemetry::default())),
            poller: Mutex::new(None),
        }
    }

    /// Folds whatever part of `messages` this session has not seen yet.
    ///
    /// `epoch` identifies the log generation; a new epoch means the source
    /// started its list over, so the cursor goes back to zero. Returns the
    /// names written by this fold, which also become the freshness set.
    ///
    /// Must be called from within a tokio runtime: a non-empty fold schedules
    /// the freshness clear timer.
    pub fn fold_events(&self, epoch: u64, messages: &[EventMessage]) -> BTreeSet<String> {
        let started_at = Instant::now();
        let (changed, folded, last_sequence, tracked) = {
            let mut writable = self.shared.lock();

            if writable.log_epoch != Some(epoch) {
                if let Some(previous) = writable.log_epoch {
                    tracing::debug!(previous, epoch, "event log restarted, rewinding cursor");
                }
                writable.cursor.reset();
                writable.log_epoch = Some(epoch);
            } else if writable.cursor.is_ahead_of(messages.len()) {
                tracing::warn!(
                    cursor = writable.cursor.position(),
                    log_len = messages.len(),
                    "event log shrank without a restart signal, rewinding cursor"
                );
                writable.cursor.reset();
                self.telemetry.record_cursor_reset();
            }

            let fresh = writable.cursor.advance(messages);
            let last_sequence = fresh.last().map(|message| message.sequence);
            let changed = apply_stream_batch(&mut writable.metrics, fresh, now_unix_ms());
            (changed, fresh.len(), last_sequence, writable.metrics.len())
        };

        if folded > 0 {
            self.telemetry.record_fold(folded, last_sequence, tracked);
            self.perf.lock().record_fold(started_at.elapsed().as_micros());
        }
        if !changed.is_empty() {
            self.freshness.mark_changed(changed.clone());
        }

        changed
    }

    pub fn apply_snapshot_values(&self, entries: &[SnapshotEntry]) -> SnapshotApplyOutcome {
        apply_snapshot_into(&self.shared, &self.telemetry, entries)
    }

    /// Starts the fallback poller, replacing any poller already running.
    ///
    /// The previous poller is shut down before the new one spawns, so a
    /// refresh it had in flight can no longer land afterwards.
    pub async fn start<S: SnapshotSource>(&self, source: S, poll_interval: Duration) {
        let previous = self.poller.lock().take();
        if let Some(previous) = previous {
            previous.shutdown().await;
        }

        let shared = Arc::clone(&self.shared);
        let telemetry = Arc::clone(&self.telemetry);
        let perf = Arc::clone(&self.perf);

        let handle = spawn_fallback_poller(
            Arc::new(source),
            poll_interval,
            CancellationToken::new(),
            move |result, elapsed| {
                perf.lock().record_fetch(elapsed.as_millis());
                match result {
                    Ok(entries) => {
                        let outcome = apply_snapshot_into(&shared, &telemetry, &entries);
                        tracing::debug!(
                            inserted = outcome.inserted,
                            refreshed = outcome.refreshed,
                            held_by_stream = outcome.held_by_stream,
                            "snapshot applied"
                        );
                    }
                    Err(error) => {
                        telemetry.record_snapshot_failure();
                        tracing::warn!(%error, "snapshot refresh failed, keeping previous values");
                    }
                }
            },
        );

        let replaced = self.poller.lock().replace(handle);
        if let Some(replaced) = replaced {
            replaced.stop();
        }
    }

    /// Tears down the poller and the pending freshness clear.
    pub async fn stop(&self) {
        let handle = self.poller.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        self.freshness.cancel();
    }

    pub fn is_polling(&self) -> bool {
        self.poller.lock().is_some()
    }

    pub fn poller_state(&self) -> PollerState {
        self.poller
            .lock()
            .as_ref()
            .map(PollerHandle::state)
            .unwrap_or(PollerState::Idle)
    }

    pub fn merged_values(&self) -> BTreeMap<String, f64> {
        self.shared.lock().metrics.merged_values()
    }

    pub fn metric_values(&self) -> Vec<MetricValue> {
        self.shared.lock().metrics.iter().cloned().collect()
    }

    pub fn metric(&self, name: &str) -> Option<MetricValue> {
        self.shared.lock().metrics.get(name).cloned()
    }

    pub fn changed_fields(&self) -> BTreeSet<String> {
        self.freshness.changed_fields()
    }

    pub fn processed_count(&self) -> usize {
        self.shared.lock().cursor.position()
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    pub fn perf_snapshot(&self) -> ReconcilePerfSnapshot {
        self.perf.lock().snapshot()
    }
}

fn apply_snapshot_into(
    shared: &Mutex<ReconcileState>,
    telemetry: &ReconcileTelemetry,
    entries: &[SnapshotEntry],
) -> SnapshotApplyOutcome {
    let now_ms = now_unix_ms();
    let (outcome, tracked) = {
        let mut writable = shared.lock();
        let outcome = apply_snapshot(&mut writable.metrics, entries, now_ms);
        (outcome, writable.metrics.len())
    };
    telemetry.record_snapshot_success(now_ms, tracked);
    outcome
}
