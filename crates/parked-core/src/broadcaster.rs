use crate::types::{CallStatus, StatusEvent};
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::trace;

pub const DEFAULT_STATUS_CAPACITY: usize = 256;

/// Fan-out of pending call lifecycle events.
///
/// Emission never blocks and never fails the caller: with no subscribers the
/// event is dropped, and slow subscribers see `Lagged` rather than holding up
/// a resolution.
#[derive(Debug, Clone)]
pub struct StatusBroadcaster {
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, conversation_id: &str, call_id: &str, status: CallStatus) {
        let event = StatusEvent {
            call_id: call_id.to_owned(),
            conversation_id: conversation_id.to_owned(),
            status,
            timestamp: Utc::now(),
        };
        if self.tx.send(event).is_err() {
            trace!(call_id, %status, "no status subscribers");
        }
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_STATUS_CAPACITY)
    }
}
