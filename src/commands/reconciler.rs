use crate::error::AppError;
use crate::metrics::pipeline::run_reconciler;
use crate::metrics::session::MetricsSession;
use crate::metrics::types::{
    MetricValue, ReconcilerSession, ReconcilerStatusSnapshot, ReconcilerStopResult,
    StartReconcilerArgs, StreamConnectionState,
};
use crate::state::{AppState, ReconcilerHandle};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub async fn start_reconciler(
    state: &AppState,
    args: Option<StartReconcilerArgs>,
) -> Result<ReconcilerSession, AppError> {
    let config = args.unwrap_or_default().normalize()?;

    let existing_handle = {
        let mut reconciler_slot = state.reconciler.lock().await;
        reconciler_slot.take()
    };
    if let Some(handle) = existing_handle {
        handle.cancellation_token.cancel();
        let _ = handle.join_handle.await;
    }

    let session = Arc::new(MetricsSession::new(Duration::from_millis(
        config.freshness_window_ms,
    )));
    let cancellation_token = CancellationToken::new();
    let task_token = cancellation_token.clone();
    let task_session = Arc::clone(&session);
    let status_store = Arc::clone(&state.reconciler_status);
    let runtime_config = config.clone();

    let join_handle = tokio::spawn(async move {
        run_reconciler(runtime_config, task_session, status_store, task_token).await;
    });

    {
        let mut reconciler_slot = state.reconciler.lock().await;
        *reconciler_slot = Some(ReconcilerHandle {
            session,
            cancellation_token,
            join_handle,
        });
    }

    tracing::info!(
        mock_mode = config.mock_mode,
        poll_interval_ms = config.poll_interval_ms,
        "reconciler started"
    );
    Ok(ReconcilerSession::from_config(&config))
}

pub async fn stop_reconciler(state: &AppState) -> Result<ReconcilerStopResult, AppError> {
    let existing_handle = {
        let mut reconciler_slot = state.reconciler.lock().await;
        reconciler_slot.take()
    };

    let stopped = if let Some(handle) = existing_handle {
        handle.cancellation_token.cancel();
        let _ = handle.join_handle.await;
        true
    } else {
        false
    };

    {
        let mut writable = state.reconciler_status.write().await;
        writable.state = StreamConnectionState::Stopped;
        writable.reason = Some("reconciler stopped by command".to_string());
    }

    Ok(ReconcilerStopResult { stopped })
}

pub async fn reconciler_status(state: &AppState) -> Result<ReconcilerStatusSnapshot, AppError> {
    let snapshot = state.reconciler_status.read().await.clone();
    Ok(snapshot)
}

async fn current_session(state: &AppState) -> Option<Arc<MetricsSession>> {
    state
        .reconciler
        .lock()
        .await
        .as_ref()
        .map(|handle| Arc::clone(&handle.session))
}

pub async fn merged_values(state: &AppState) -> BTreeMap<String, f64> {
    match current_session(state).await {
        Some(session) => session.merged_values(),
        None => BTreeMap::new(),
    }
}

pub async fn changed_fields(state: &AppState) -> BTreeSet<String> {
    match current_session(state).await {
        Some(session) => session.changed_fields(),
        None => BTreeSet::new(),
    }
}

pub async fn metric_values(state: &AppState) -> Vec<MetricValue> {
    match current_session(state).await {
        Some(session) => session.metric_values(),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_args() -> Option<StartReconcilerArgs> {
        Some(StartReconcilerArgs {
            mock_mode: Some(true),
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_mock_reconciler() {
        let state = AppState::new();
        let session = start_reconciler(&state, mock_args())
            .await
            .expect("mock reconciler should start");
        assert!(session.running);
        assert!(session.mock_mode);

        tokio::time::sleep(Duration::from_millis(1_600)).await;
        let values = merged_values(&state).await;
        assert_eq!(values.get("total_verifications"), Some(&1_000.0));
        assert_eq!(metric_values(&state).await.len(), values.len());

        let result = stop_reconciler(&state).await.expect("stop should succeed");
        assert!(result.stopped);
        assert!(merged_values(&state).await.is_empty());
        assert!(changed_fields(&state).await.is_empty());

        let status = reconciler_status(&state).await.expect("status is readable");
        assert_eq!(status.state, StreamConnectionState::Stopped);
        assert_eq!(status.reason.as_deref(), Some("reconciler stopped by command"));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_without_running_reconciler_reports_false() {
        let state = AppState::new();
        let result = stop_reconciler(&state).await.expect("stop should succeed");
        assert!(!result.stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_running_session() {
        let state = AppState::new();
        let _ = start_reconciler(&state, mock_args())
            .await
            .expect("first start should succeed");
        tokio::time::sleep(Duration::from_millis(100)).await;
        let first = current_session(&state).await.expect("session should exist");

        let _ = start_reconciler(&state, mock_args())
            .await
            .expect("second start should succeed");
        let second = current_session(&state).await.expect("session should exist");

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!first.is_polling());
        let _ = stop_reconciler(&state).await;
    }

    #[tokio::test]
    async fn rejects_invalid_args() {
        let state = AppState::new();
        let result = start_reconciler(&state, None).await;
        assert!(result.is_err());
        assert!(current_session(&state).await.is_none());
    }
}
