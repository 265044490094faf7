use crate::metrics::types::{
    EventMessage, MetricSource, MetricStateSet, MetricValue, SnapshotEntry,
};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotApplyOutcome {
    /// Metrics seen for the first time.
    pub inserted: usize,
    /// Snapshot-owned metrics overwritten with the fresher snapshot value.
    pub refreshed: usize,
    /// Metrics left alone because the stream already owns them.
    pub held_by_stream: usize,
}

/// Folds stream messages in order. Every field present in a message replaces
/// the current entry, so the last message in the batch wins for a field.
/// Returns the names of every field written.
pub fn apply_stream_batch(
    state: &mut MetricStateSet,
    messages: &[EventMessage],
    now_unix_ms: i64,
) -> BTreeSet<String> {
    let mut changed = BTreeSet::new();

    for message in messages {
        for (name, value) in &message.fields {
            state.replace(MetricValue::from_stream(
                name,
                *value,
                message.sequence,
                now_unix_ms,
            ));
            changed.insert(name.clone());
        }
    }

    changed
}

/// Writes snapshot values as the baseline. Once the stream has written a
/// field it keeps ownership of it for the rest of the session.
pub fn apply_snapshot(
    state: &mut MetricStateSet,
    entries: &[SnapshotEntry],
    now_unix_ms: i64,
) -> SnapshotApplyOutcome {
    let mut outcome = SnapshotApplyOutcome::default();

    for entry in entries {
        match state.get(&entry.name).map(|current| current.source) {
            Some(MetricSource::Stream) => {
                outcome.held_by_stream += 1;
                continue;
            }
            Some(MetricSource::Snapshot) => outcome.refreshed += 1,
            None => outcome.inserted += 1,
        }

        state.replace(MetricValue::from_snapshot(
            &entry.name,
            entry.value,
            now_unix_ms,
        ));
    }

    outcome
}
