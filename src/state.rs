use crate::metrics::session::MetricsSession;
use crate::metrics::types::ReconcilerStatusSnapshot;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct ReconcilerHandle {
    pub session: Arc<MetricsSession>,
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
}

pub struct AppState {
    pub started_at: Instant,
    pub reconciler: Mutex<Option<ReconcilerHandle>>,
    pub reconciler_status: Arc<RwLock<ReconcilerStatusSnapshot>>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            reconciler: Mutex::new(None),
            reconciler_status: Arc::new(RwLock::new(ReconcilerStatusSnapshot::stopped(Some(
                "reconciler idle".to_string(),
            )))),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
