use crate::error::AppError;
use crate::metrics::types::{parse_event_payload, EventMessage};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

pub type MetricsWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended { gap: Option<(u64, u64)> },
    Stale { current: u64, last: u64 },
}

/// Append-only list of stream messages for one transport epoch.
///
/// The epoch advances whenever the list starts over (reconnect or
/// compaction); readers compare epochs to know their cursor is void.
#[derive(Debug, Default)]
pub struct EventLog {
    epoch: u64,
    messages: Vec<EventMessage>,
    last_sequence: Option<u64>,
}

impl EventLog {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn messages(&self) -> &[EventMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn append(&mut self, message: EventMessage) -> AppendOutcome {
        let gap = match self.last_sequence {
            Some(last) if message.sequence <= last => {
                return AppendOutcome::Stale {
                    current: message.sequence,
                    last,
                };
            }
            Some(last) if message.sequence != last.saturating_add(1) => {
                Some((last.saturating_add(1), message.sequence))
            }
            _ => None,
        };

        self.last_sequence = Some(message.sequence);
        self.messages.push(message);
        AppendOutcome::Appended { gap }
    }

    /// Starts a new, empty epoch. Sequence ordering restarts with it.
    pub fn restart(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        self.messages.clear();
        self.last_sequence = None;
    }

    /// Drops the first `consumed` messages and starts a new epoch holding the
    /// remainder. Sequence ordering carries over.
    pub fn compact_consumed(&mut self, consumed: usize) {
        let consumed = consumed.min(self.messages.len());
        self.messages.drain(..consumed);
        self.epoch = self.epoch.wrapping_add(1);
    }
}

#[derive(Debug, Clone, Default)]
pub struct SharedEventLog {
    inner: Arc<RwLock<EventLog>>,
}

impl SharedEventLog {
    pub fn read(&self) -> RwLockReadGuard<'_, EventLog> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, EventLog> {
        self.inner.write()
    }
}

pub async fn connect_event_stream(url: &str) -> Result<MetricsWsStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(16 << 20),
        max_frame_size: Some(4 << 20),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(url, Some(ws_config), true).await?;
    Ok(stream)
}

#[derive(Debug)]
pub enum FrameOutcome {
    Event(EventMessage),
    Malformed(AppError),
    Closed,
    Ignored,
}

pub fn decode_frame(message: Message) -> FrameOutcome {
    let decoded = match message {
        Message::Text(text_payload) => {
            let mut owned_payload = text_payload.into_bytes();
            parse_event_payload(owned_payload.as_mut_slice())
        }
        Message::Binary(mut binary_payload) => parse_event_payload(binary_payload.as_mut_slice()),
        Message::Close(_) => return FrameOutcome::Closed,
        _ => return FrameOutcome::Ignored,
    };

    match decoded {
        Ok(event) => FrameOutcome::Event(event),
        Err(error) => FrameOutcome::Malformed(error),
    }
}
