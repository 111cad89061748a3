//! One live subscription per channel key.
//!
//! ## Invariants
//!
//! - At most one [`Channel`] per key. A second `subscribe` for a held key
//!   returns the same handle and issues no transport call.
//! - A failed subscribe keeps the key registered (state `Errored`) so the
//!   next reconnect retries it; callers never re-issue subscribe calls.
//! - No lock is held across a transport call.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{EventBroadcaster, RealtimeErrorEvent};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelKey, ChannelSpec, ChannelState};
use crate::transport::{Transport, TransportMessage};

/// Receives traffic for registered channels.
#[async_trait]
pub trait ChannelSink: Send + Sync {
    /// One delivery; messages of a channel arrive one at a time, in
    /// transport order.
    async fn on_message(&self, key: &ChannelKey, message: TransportMessage);

    /// Called after every successful (re)subscribe.
    async fn on_joined(&self, _channel: &Channel) {}

    /// Called once the channel has been removed from the registry.
    async fn on_closed(&self, _channel: &Channel) {}
}

pub struct ChannelRegistry {
    transport: Arc<dyn Transport>,
    sink: Arc<dyn ChannelSink>,
    events: Arc<EventBroadcaster>,
    channels: Mutex<HashMap<ChannelKey, Arc<Channel>>>,
    connection_lost: Arc<Notify>,
}

impl ChannelRegistry {
    pub fn new(
        transport: Arc<dyn Transport>,
        sink: Arc<dyn ChannelSink>,
        events: Arc<EventBroadcaster>,
        connection_lost: Arc<Notify>,
    ) -> Self {
        Self {
            transport,
            sink,
            events,
            channels: Mutex::new(HashMap::new()),
            connection_lost,
        }
    }

    /// Get or open the channel for `key`.
    pub async fn subscribe(&self, key: ChannelKey, spec: ChannelSpec) -> Arc<Channel> {
        let channel = {
            let mut channels = self.channels.lock();
            if let Some(existing) = channels.get(&key) {
                debug!(channel = %key, "Channel already registered");
                return Arc::clone(existing);
            }
            let channel = Arc::new(Channel::new(key.clone(), spec));
            channels.insert(key, Arc::clone(&channel));
            channel
        };

        self.open(&channel).await;
        channel
    }

    /// Tear down and forget the channel for `key`. No-op if absent.
    pub async fn unsubscribe(&self, key: &ChannelKey) -> bool {
        let removed = self.channels.lock().remove(key);
        match removed {
            Some(channel) => {
                self.close(&channel).await;
                true
            }
            None => false,
        }
    }

    /// Tear down every channel.
    pub async fn unsubscribe_all(&self) -> usize {
        let drained: Vec<Arc<Channel>> = self.channels.lock().drain().map(|(_, c)| c).collect();
        for channel in &drained {
            self.close(channel).await;
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "Unsubscribed from all channels");
        }
        drained.len()
    }

    /// Re-open every registered channel after a reconnect. Returns the
    /// number that joined.
    pub async fn resubscribe_all(&self) -> usize {
        let snapshot: Vec<Arc<Channel>> = self.channels.lock().values().cloned().collect();
        let mut joined = 0;

        for channel in snapshot {
            // Stale subscription from before the outage
            if let Some(old) = channel.detach() {
                if let Err(e) = self.transport.unsubscribe(old).await {
                    debug!(channel = %channel.key(), error = %e, "Dropping stale subscription failed");
                }
            }
            channel.set_state(ChannelState::Joining);
            self.open(&channel).await;
            if channel.is_joined() {
                joined += 1;
            }
        }

        info!(joined, total = self.len(), "Resubscribed channels");
        joined
    }

    pub fn get(&self, key: &ChannelKey) -> Option<Arc<Channel>> {
        self.channels.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &ChannelKey) -> bool {
        self.channels.lock().contains_key(key)
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<ChannelKey> {
        let mut keys: Vec<ChannelKey> = self.channels.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }

    /// Channels currently joined.
    pub fn active_count(&self) -> usize {
        self.channels
            .lock()
            .values()
            .filter(|c| c.is_joined())
            .count()
    }

    async fn open(&self, channel: &Arc<Channel>) {
        let key = channel.key().clone();

        match self.transport.subscribe(channel.spec()).await {
            Ok(subscription) => {
                let id = subscription.id;
                // Attach under the map lock so a concurrent unsubscribe either
                // sees the subscription or has already removed the channel.
                let attached = {
                    let channels = self.channels.lock();
                    let registered = channels
                        .get(&key)
                        .is_some_and(|current| Arc::ptr_eq(current, channel));
                    if registered {
                        let sink = Arc::clone(&self.sink);
                        let pump_key = key.clone();
                        let mut messages = subscription.messages;
                        let pump = tokio::spawn(async move {
                            while let Some(message) = messages.recv().await {
                                sink.on_message(&pump_key, message).await;
                            }
                            debug!(channel = %pump_key, "Channel stream ended");
                        });
                        channel.attach(id, pump);
                        channel.set_state(ChannelState::Joined);
                    }
                    registered
                };

                if !attached {
                    debug!(channel = %key, subscription = %id, "Channel removed while joining");
                    if let Err(e) = self.transport.unsubscribe(id).await {
                        warn!(channel = %key, error = %e, "Transport unsubscribe failed");
                    }
                    channel.set_state(ChannelState::Closed);
                    return;
                }

                debug!(channel = %key, subscription = %id, "Channel joined");
                self.sink.on_joined(channel).await;
            }
            Err(e) if !self.is_registered(channel) => {
                debug!(channel = %key, error = %e, "Subscribe failed for a removed channel");
                channel.set_state(ChannelState::Closed);
            }
            Err(e) => {
                warn!(channel = %key, error = %e, "Channel subscribe failed");
                channel.set_state(ChannelState::Errored(e.to_string()));
                self.events.send_error(
                    RealtimeErrorEvent::transport(e.to_string()).with_channel(key.to_string()),
                );
                if e.is_connection_loss() {
                    self.connection_lost.notify_one();
                }
            }
        }
    }

    fn is_registered(&self, channel: &Arc<Channel>) -> bool {
        self.channels
            .lock()
            .get(channel.key())
            .is_some_and(|current| Arc::ptr_eq(current, channel))
    }

    async fn close(&self, channel: &Arc<Channel>) {
        let key = channel.key();
        if let Some(id) = channel.detach() {
            if let Err(e) = self.transport.unsubscribe(id).await {
                warn!(channel = %key, error = %e, "Transport unsubscribe failed");
            }
        }
        channel.set_state(ChannelState::Closed);
        self.sink.on_closed(channel).await;
        debug!(channel = %key, "Channel closed");
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("transport", &self.transport.name())
            .field("channels", &self.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use courier_core::{ChangeRecord, RealtimeEvent};
    use serde_json::json;
    use tokio::sync::mpsc;

    /// Forwards everything it sees to a channel.
    struct Recorder {
        tx: mpsc::UnboundedSender<(ChannelKey, TransportMessage)>,
        closed: Mutex<Vec<ChannelKey>>,
    }

    #[async_trait]
    impl ChannelSink for Recorder {
        async fn on_message(&self, key: &ChannelKey, message: TransportMessage) {
            let _ = self.tx.send((key.clone(), message));
        }

        async fn on_closed(&self, channel: &Channel) {
            self.closed.lock().push(channel.key().clone());
        }
    }

    struct Fixture {
        transport: MemoryTransport,
        registry: ChannelRegistry,
        recorder: Arc<Recorder>,
        rx: mpsc::UnboundedReceiver<(ChannelKey, TransportMessage)>,
        events: Arc<EventBroadcaster>,
        lost: Arc<Notify>,
    }

    async fn fixture() -> Fixture {
        let transport = MemoryTransport::new();
        transport.connect().await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder {
            tx,
            closed: Mutex::new(Vec::new()),
        });
        let events = EventBroadcaster::new_shared();
        let lost = Arc::new(Notify::new());
        let registry = ChannelRegistry::new(
            Arc::new(transport.clone()),
            recorder.clone(),
            Arc::clone(&events),
            Arc::clone(&lost),
        );
        Fixture {
            transport,
            registry,
            recorder,
            rx,
            events,
            lost,
        }
    }

    fn spec(key: &ChannelKey) -> ChannelSpec {
        ChannelSpec::for_key(key, Some("u1"))
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let f = fixture().await;
        let key = ChannelKey::thread("t1");

        let first = f.registry.subscribe(key.clone(), spec(&key)).await;
        let second = f.registry.subscribe(key.clone(), spec(&key)).await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(f.transport.subscribe_calls(), 1);
        assert_eq!(f.registry.len(), 1);
        assert!(first.is_joined());
    }

    #[tokio::test]
    async fn test_messages_reach_the_sink() {
        let mut f = fixture().await;
        let key = ChannelKey::thread("t1");
        f.registry.subscribe(key.clone(), spec(&key)).await;

        let record = ChangeRecord::insert("messages", json!({"id": "m1", "thread_id": "t1"}));
        f.transport.publish_change(record.clone());

        let (got_key, message) = f.rx.recv().await.unwrap();
        assert_eq!(got_key, key);
        assert_eq!(message, TransportMessage::Change(record));
    }

    #[tokio::test]
    async fn test_unsubscribe_tears_down() {
        let f = fixture().await;
        let key = ChannelKey::notifications("u1");
        let channel = f.registry.subscribe(key.clone(), spec(&key)).await;

        assert!(f.registry.unsubscribe(&key).await);
        assert!(!f.registry.unsubscribe(&key).await);

        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(f.transport.active_subscriptions(), 0);
        assert_eq!(*f.recorder.closed.lock(), vec![key]);
    }

    #[tokio::test]
    async fn test_failed_subscribe_stays_registered_and_reports() {
        let f = fixture().await;
        let mut bus = f.events.subscribe();
        f.transport.drop_connection();

        let key = ChannelKey::thread("t1");
        let channel = f.registry.subscribe(key.clone(), spec(&key)).await;

        assert!(matches!(channel.state(), ChannelState::Errored(_)));
        assert!(f.registry.contains(&key));
        match bus.recv().await.unwrap() {
            RealtimeEvent::Error(e) => assert_eq!(e.channel.as_deref(), Some("thread:t1")),
            other => panic!("unexpected event {other:?}"),
        }
        // Connection loss wakes the supervisor
        tokio::time::timeout(std::time::Duration::from_secs(1), f.lost.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_resubscribe_all_reopens_every_channel() {
        let f = fixture().await;
        let a = ChannelKey::thread("a");
        let b = ChannelKey::notifications("b");
        f.registry.subscribe(a.clone(), spec(&a)).await;
        f.registry.subscribe(b.clone(), spec(&b)).await;

        f.transport.drop_connection();
        f.transport.connect().await.unwrap();

        assert_eq!(f.registry.resubscribe_all().await, 2);
        assert_eq!(f.registry.active_count(), 2);
        assert_eq!(f.transport.active_topics(), vec!["notifications:b", "thread:a"]);
    }

    #[tokio::test]
    async fn test_unsubscribe_all() {
        let f = fixture().await;
        for id in ["t1", "t2", "t3"] {
            let key = ChannelKey::thread(id);
            f.registry.subscribe(key.clone(), spec(&key)).await;
        }

        assert_eq!(f.registry.unsubscribe_all().await, 3);
        assert!(f.registry.is_empty());
        assert_eq!(f.transport.active_subscriptions(), 0);
    }
}
