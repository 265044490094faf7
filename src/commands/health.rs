use crate::error::AppError;
use crate::metrics::types::{ReconcilerStatusSnapshot, StreamConnectionState};
use crate::state::AppState;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub stream: StreamConnectionState,
    pub snapshot: &'static str,
}

pub fn build_health_response(
    started_at: Instant,
    reconciler_status: &ReconcilerStatusSnapshot,
) -> HealthResponse {
    let status = match reconciler_status.state {
        StreamConnectionState::Live | StreamConnectionState::Stopped => "ok",
        _ => "degraded",
    };
    let snapshot = match (
        reconciler_status.last_snapshot_at_ms,
        reconciler_status.snapshot_failures,
    ) {
        (None, 0) => "pending",
        (None, _) => "error",
        (Some(_), _) => "ok",
    };

    HealthResponse {
        status,
        uptime_ms: started_at.elapsed().as_millis(),
        stream: reconciler_status.state,
        snapshot,
    }
}

pub async fn health(state: &AppState) -> Result<HealthResponse, AppError> {
    let reconciler_status = state.reconciler_status.read().await.clone();
    Ok(build_health_response(state.started_at, &reconciler_status))
}
