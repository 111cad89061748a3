//! Fan-out of [`RealtimeEvent`]s to every listener.

use std::sync::Arc;
use tokio::sync::broadcast;

use super::types::{ConnectionChange, RealtimeErrorEvent, RealtimeEvent};

/// Bus capacity when none is configured. A receiver that falls further
/// behind than this sees `Lagged` and skips the oldest events.
const DEFAULT_CAPACITY: usize = 1024;

/// Publishing side of the realtime event bus.
///
/// ```
/// use courier_core::events::{ConnectionChange, EventBroadcaster, RealtimeEvent};
///
/// let bus = EventBroadcaster::new();
/// let mut rx = bus.subscribe();
///
/// assert_eq!(bus.send_connection(ConnectionChange::Connected), 1);
/// assert_eq!(
///     rx.try_recv().ok(),
///     Some(RealtimeEvent::ConnectionChanged(ConnectionChange::Connected))
/// );
/// ```
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<RealtimeEvent>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Publish `event`. Returns how many listeners it reached; zero when
    /// nobody is listening, which is not an error.
    pub fn send(&self, event: RealtimeEvent) -> usize {
        self.sender.send(event).unwrap_or_default()
    }

    pub fn send_connection(&self, change: ConnectionChange) -> usize {
        self.send(RealtimeEvent::ConnectionChanged(change))
    }

    pub fn send_error(&self, error: RealtimeErrorEvent) -> usize {
        tracing::debug!(
            source = ?error.source,
            channel = ?error.channel,
            terminal = error.terminal,
            message = %error.message,
            "Publishing realtime error"
        );
        self.send(RealtimeEvent::Error(error))
    }

    /// New listener; it only sees events sent after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBroadcaster")
            .field("listeners", &self.subscriber_count())
            .finish()
    }
}
