//! Game event queue.

use parking_lot::Mutex;

use crate::events::GameEvent;

/// Buffers gameplay events until the next tick collects them.
#[derive(Debug, Default)]
pub struct EventStore {
    events: Mutex<Vec<GameEvent>>,
}

impl EventStore {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a clone of `event` for the next tick.
    pub fn add(&self, event: &GameEvent) {
        self.events.lock().push(event.clone());
    }

    /// Drain queued events in insertion order.
    pub fn consume(&self) -> Vec<GameEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}
