//! Status-refresh signal.
//!
//! After a reconciliation touches a record, UI components need to repaint
//! status badges without re-fetching. The engine publishes a small event on a
//! broadcast channel; delivery is fire-and-forget, at-most-once per reconcile
//! call, and dropping every receiver is fine.

use tokio::sync::broadcast;

use crate::records::EntityKind;

/// Capacity of the broadcast channel; slow subscribers lag past this.
const CHANNEL_CAPACITY: usize = 64;

/// One badge-refresh notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusEvent {
    pub kind: EntityKind,
    pub id: i64,
    pub active: bool,
}

/// Publisher handle held by the sync engine.
pub struct StatusNotifier {
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to future status events.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Send errors (no live receiver) are ignored.
    pub fn emit(&self, kind: EntityKind, id: i64, active: bool) {
        let _ = self.tx.send(StatusEvent { kind, id, active });
    }
}

impl Default for StatusNotifier {
    fn default() -> Self {
        Self::new()
    }
}
