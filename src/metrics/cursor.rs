use crate::metrics::types::EventMessage;

/// Number of log messages already folded into state.
///
/// The cursor only ever hands out the contiguous suffix it has not seen, so
/// re-reading the same log from the start never re-applies a message. It
/// cannot tell that the underlying log restarted; callers reset it when the
/// source reports a new epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventCursor {
    processed: usize,
}

impl EventCursor {
    pub fn position(&self) -> usize {
        self.processed
    }

    /// True when the cursor points past the end of `log_len`, which only
    /// happens if the log shrank without the caller resetting the cursor.
    pub fn is_ahead_of(&self, log_len: usize) -> bool {
        self.processed > log_len
    }

    pub fn advance<'a>(&mut self, all_messages: &'a [EventMessage]) -> &'a [EventMessage] {
        if self.processed >= all_messages.len() {
            return &[];
        }

        let fresh = &all_messages[self.processed..];
        self.processed = all_messages.len();
        fresh
    }

    pub fn reset(&mut self) {
        self.processed = 0;
    }
}
