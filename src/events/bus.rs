//! Ordered subscription registry.
//!
//! Handlers are keyed by [`EventName`] and invoked in registration order.
//! A panicking handler is logged and skipped; the rest still run.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::identifiers::SubscriptionId;

use super::{EventName, RtviEvent, run_guarded};

// ============================================================================
// Types
// ============================================================================

/// Application handler for bus events.
pub type EventHandler = Arc<dyn Fn(&RtviEvent) + Send + Sync>;

/// Handlers of one event, in registration order.
type HandlerList = Vec<(SubscriptionId, EventHandler)>;

// ============================================================================
// EventBus
// ============================================================================

/// Typed publish/subscribe registry.
///
/// Emission snapshots the handler list first, so handlers may subscribe
/// or unsubscribe from inside a callback.
#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<FxHashMap<EventName, HandlerList>>,
}

impl EventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `handler` to `event`.
    ///
    /// Returns the ID needed to unsubscribe.
    pub fn on<F>(&self, event: EventName, handler: F) -> SubscriptionId
    where
        F: Fn(&RtviEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId::next();
        self.handlers
            .lock()
            .entry(event)
            .or_default()
            .push((id, Arc::new(handler)));

        trace!(%event, %id, "Handler subscribed");
        id
    }

    /// Unsubscribes one handler.
    ///
    /// Returns `false` if no such subscription exists.
    pub fn off(&self, event: EventName, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock();
        let Some(list) = handlers.get_mut(&event) else {
            return false;
        };

        let before = list.len();
        list.retain(|(sub, _)| *sub != id);
        let removed = list.len() != before;

        if list.is_empty() {
            handlers.remove(&event);
        }
        removed
    }

    /// Unsubscribes every handler of `event`.
    pub fn off_all(&self, event: EventName) {
        self.handlers.lock().remove(&event);
    }

    /// Number of handlers subscribed to `event`.
    #[inline]
    #[must_use]
    pub fn handler_count(&self, event: EventName) -> usize {
        self.handlers.lock().get(&event).map_or(0, Vec::len)
    }

    /// Delivers `event` to its handlers, in registration order.
    pub fn emit(&self, event: &RtviEvent) {
        let name = event.name();
        let snapshot: Vec<EventHandler> = match self.handlers.lock().get(&name) {
            Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return,
        };

        for handler in snapshot {
            run_guarded(name, || handler(event));
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
