mod commands;
mod error;
pub mod metrics;
mod state;

pub use commands::health::{health, HealthResponse};
pub use commands::reconciler::{
    changed_fields, merged_values, metric_values, reconciler_status, start_reconciler,
    stop_reconciler,
};
pub use error::AppError;
pub use state::AppState;

use metrics::types::StartReconcilerArgs;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing_subscriber::EnvFilter;

const REPORT_INTERVAL_MS: u64 = 1_000;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // A subscriber installed by an embedding host wins.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Runs the reconciler from environment configuration until Ctrl-C.
pub async fn run() -> Result<(), AppError> {
    init_tracing();

    let args = StartReconcilerArgs::from_env()?;
    let state = AppState::new();
    let session = start_reconciler(&state, Some(args)).await?;
    tracing::info!(
        snapshot_url = ?session.snapshot_url,
        stream_url = ?session.stream_url,
        mock_mode = session.mock_mode,
        "live metrics running, press Ctrl-C to stop"
    );

    let mut report_ticker = tokio::time::interval(Duration::from_millis(REPORT_INTERVAL_MS));
    report_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;
            signal = &mut shutdown => {
                signal?;
                break;
            }
            _ = report_ticker.tick() => {
                let values = merged_values(&state).await;
                let changed = changed_fields(&state).await;
                let status = reconciler_status(&state).await?;
                tracing::info!(
                    state = ?status.state,
                    processed = status.processed_count,
                    values = ?values,
                    changed = ?changed,
                    "metrics"
                );
            }
        }
    }

    let stopped = stop_reconciler(&state).await?;
    tracing::info!(stopped = stopped.stopped, "live metrics shut down");
    Ok(())
}
