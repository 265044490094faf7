use crate::error::AppError;
use crate::metrics::snapshot::SnapshotSource;
use crate::metrics::types::SnapshotEntry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PollerState {
    Idle,
    Refreshing,
}

#[derive(Debug, Default)]
pub struct PollerStats {
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

impl PollerStats {
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

/// Idle/refreshing gate shared between the tick loop and the refresh task.
#[derive(Debug)]
struct RefreshGate {
    state: Mutex<PollerState>,
}

impl RefreshGate {
    fn try_begin(&self) -> bool {
        let mut writable = self.state.lock();
        if *writable == PollerState::Refreshing {
            return false;
        }
        *writable = PollerState::Refreshing;
        true
    }

    fn finish(&self) {
        *self.state.lock() = PollerState::Idle;
    }

    fn current(&self) -> PollerState {
        *self.state.lock()
    }
}

pub struct PollerHandle {
    cancellation_token: CancellationToken,
    join_handle: JoinHandle<()>,
    gate: Arc<RefreshGate>,
    stats: Arc<PollerStats>,
}

impl PollerHandle {
    pub fn state(&self) -> PollerState {
        self.gate.current()
    }

    pub fn stats(&self) -> &PollerStats {
        &self.stats
    }

    pub fn stop(&self) {
        self.cancellation_token.cancel();
    }

    pub async fn shutdown(self) {
        self.cancellation_token.cancel();
        let _ = self.join_handle.await;
    }
}

/// Refreshes the snapshot every `interval`, starting immediately.
///
/// A tick that lands while a refresh is still in flight is dropped. Every
/// finished refresh, successful or not, is handed to `on_refresh` together
/// with its fetch time; the loop itself never stops on a failed fetch.
pub fn spawn_fallback_poller<S, F>(
    source: Arc<S>,
    interval: Duration,
    cancellation_token: CancellationToken,
    on_refresh: F,
) -> PollerHandle
where
    S: SnapshotSource,
    F: Fn(Result<Vec<SnapshotEntry>, AppError>, Duration) + Send + Sync + 'static,
{
    let gate = Arc::new(RefreshGate {
        state: Mutex::new(PollerState::Idle),
    });
    let stats = Arc::new(PollerStats::default());
    let on_refresh = Arc::new(on_refresh);

    let loop_token = cancellation_token.clone();
    let loop_gate = Arc::clone(&gate);
    let loop_stats = Arc::clone(&stats);

    let join_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                biased;
                _ = loop_token.cancelled() => break,
                _ = ticker.tick() => {
                    if !loop_gate.try_begin() {
                        loop_stats.skipped.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("snapshot refresh still in flight, skipping poll tick");
                        continue;
                    }

                    let refresh_source = Arc::clone(&source);
                    let refresh_gate = Arc::clone(&loop_gate);
                    let refresh_stats = Arc::clone(&loop_stats);
                    let refresh_callback = Arc::clone(&on_refresh);
                    let refresh_token = loop_token.clone();

                    in_flight = Some(tokio::spawn(async move {
                        let started_at = Instant::now();
                        let result = tokio::select! {
                            biased;
                            _ = refresh_token.cancelled() => None,
                            result = refresh_source.fetch_snapshot() => Some(result),
                        };

                        if let Some(result) = result {
                            if result.is_ok() {
                                refresh_stats.completed.fetch_add(1, Ordering::Relaxed);
                            } else {
                                refresh_stats.failed.fetch_add(1, Ordering::Relaxed);
                            }
                            refresh_callback(result, started_at.elapsed());
                        }
                        refresh_gate.finish();
                    }));
                }
            }
        }

        if let Some(handle) = in_flight.take() {
            let _ = handle.await;
        }
        loop_gate.finish();
    });

    PollerHandle {
        cancellation_token,
        join_handle,
        gate,
        stats,
    }
}
