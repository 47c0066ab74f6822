//! Node-wide events.

use tokio::sync::broadcast;

/// Capacity of the event channel.
///
/// Subscribers that fall further behind miss events.
const EVENT_CAPACITY: usize = 64;

/// An event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A storage backend changed its health status.
    StorageStatus { id: String, online: bool },

    /// At least one storage backend is online again.
    StorageEnable,

    /// No storage backend is online.
    StorageDisable,
}

/// A fan-out event bus.
///
/// Emitting never blocks and succeeds even without subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<NodeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn emit(&self, event: NodeEvent) {
        tracing::debug!(?event, "Emitting event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
