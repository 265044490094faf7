use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct FreshnessState {
    changed: BTreeSet<String>,
    generation: u64,
    pending_clear: Option<JoinHandle<()>>,
}

/// Names of the metrics touched by the most recent fold, cleared by a timer.
///
/// At most one clear is pending. Marking again aborts the pending clear and
/// schedules a new one, so a burst of updates keeps its highlight steady
/// instead of flickering off half-way.
#[derive(Debug, Clone)]
pub struct FreshnessSignal {
    state: Arc<Mutex<FreshnessState>>,
    window: Duration,
}

impl FreshnessSignal {
    pub fn new(window: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(FreshnessState::default())),
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Must be called from within a tokio runtime.
    pub fn mark_changed(&self, field_names: BTreeSet<String>) {
        let mut writable = self.state.lock();
        writable.generation = writable.generation.wrapping_add(1);
        writable.changed = field_names;
        if let Some(previous) = writable.pending_clear.take() {
            previous.abort();
        }

        if writable.changed.is_empty() {
            return;
        }

        let generation = writable.generation;
        let state = Arc::clone(&self.state);
        let window = self.window;
        writable.pending_clear = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let mut writable = state.lock();
            // An aborted clear can still get here if it was already running.
            if writable.generation == generation {
                writable.changed.clear();
                writable.pending_clear = None;
            }
        }));
    }

    pub fn changed_fields(&self) -> BTreeSet<String> {
        self.state.lock().changed.clone()
    }

    pub fn has_pending_clear(&self) -> bool {
        self.state.lock().pending_clear.is_some()
    }

    pub fn cancel(&self) {
        let mut writable = self.state.lock();
        writable.generation = writable.generation.wrapping_add(1);
        writable.changed.clear();
        if let Some(pending) = writable.pending_clear.take() {
            pending.abort();
        }
    }
}
