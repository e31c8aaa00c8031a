//! Typed update events.
//!
//! The controller publishes its observable lifecycle on a broadcast
//! channel of tagged variants; consumers subscribe and receive events in
//! emission order. Slow consumers lag rather than block the controller.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::UpdateError;
use crate::manifest::Manifest;

/// Capacity of the event channel per subscriber.
const EVENT_CAPACITY: usize = 32;

/// Observable controller lifecycle events.
#[derive(Debug, Clone)]
pub enum UpdateEvent {
    /// A check cycle started.
    Checking,
    /// A newer version was found.
    Available(Arc<Manifest>),
    /// The check completed with nothing newer.
    NotAvailable,
    /// An artifact was downloaded and verified.
    Downloaded(PathBuf, Arc<Manifest>),
    /// A cycle failed; carries the responsible error.
    Error(Arc<UpdateError>),
}

/// Broadcast bus the controller emits on.
pub(crate) struct EventBus {
    sender: broadcast::Sender<UpdateEvent>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Subscribe to events emitted after this call.
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.sender.subscribe()
    }

    /// Emit an event. Having no subscribers is not an error.
    pub(crate) fn emit(&self, event: UpdateEvent) {
        tracing::debug!(?event, "emitting update event");
        let _ = self.sender.send(event);
    }
}
