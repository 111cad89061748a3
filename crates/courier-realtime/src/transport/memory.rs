//! In-process transport.
//!
//! Everything lives behind one mutex; cloning the transport shares the
//! same state, so a test can keep a handle for publishing changes and
//! injecting faults while the service owns another.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::ChangeRecord;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{PresenceSignal, SubscriptionId, Transport, TransportMessage, TransportSubscription};
use crate::channel::ChannelSpec;
use crate::error::TransportError;

struct Subscriber {
    spec: ChannelSpec,
    tx: mpsc::UnboundedSender<TransportMessage>,
}

#[derive(Default)]
struct State {
    connected: bool,
    /// Heartbeats fail while `is_healthy` keeps reporting true
    silent: bool,
    failing_connects: u32,
    fail_connect_forever: bool,
    fail_subscribe: bool,
    next_id: u64,
    subscribers: HashMap<SubscriptionId, Subscriber>,
    presence: HashMap<String, BTreeSet<String>>,
    broadcasts: Vec<(String, String, Value)>,
    connect_calls: Vec<Instant>,
    subscribe_calls: usize,
}

impl State {
    fn deliver(&mut self, message: TransportMessage, wants: impl Fn(&ChannelSpec) -> bool) -> usize {
        let mut delivered = 0;
        self.subscribers.retain(|_, sub| {
            if !wants(&sub.spec) {
                return true;
            }
            match sub.tx.send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                // Receiver gone, forget the subscriber
                Err(_) => false,
            }
        });
        delivered
    }
}

/// Transport that routes everything in memory.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<State>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Feed side
    // ------------------------------------------------------------------

    /// Publish a change record to every subscription whose filters match.
    /// Returns the number of subscriptions it reached.
    pub fn publish_change(&self, record: ChangeRecord) -> usize {
        let mut state = self.state.lock();
        if !state.connected {
            return 0;
        }
        let message = TransportMessage::Change(record.clone());
        state.deliver(message, |spec| spec.filters.iter().any(|f| f.matches(&record)))
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// Simulate an outage: the connection drops and every open
    /// subscription stream ends.
    pub fn drop_connection(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.subscribers.clear();
        tracing::debug!("memory transport connection dropped");
    }

    /// Keep reporting healthy while heartbeats go unanswered.
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Fail the next `n` connect attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.state.lock().failing_connects = n;
    }

    /// Fail every connect attempt until switched off.
    pub fn set_fail_connect(&self, fail: bool) {
        self.state.lock().fail_connect_forever = fail;
    }

    /// Reject subscribe calls while connected.
    pub fn set_fail_subscribe(&self, fail: bool) {
        self.state.lock().fail_subscribe = fail;
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Transport-level subscribe calls, successful or not.
    pub fn subscribe_calls(&self) -> usize {
        self.state.lock().subscribe_calls
    }

    /// Instants at which `connect` was called.
    pub fn connect_calls(&self) -> Vec<Instant> {
        self.state.lock().connect_calls.clone()
    }

    /// Topics with a live subscription, sorted.
    pub fn active_topics(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut topics: Vec<String> = state
            .subscribers
            .values()
            .filter(|s| !s.tx.is_closed())
            .map(|s| s.spec.topic.clone())
            .collect();
        topics.sort();
        topics
    }

    pub fn active_subscriptions(&self) -> usize {
        self.state
            .lock()
            .subscribers
            .values()
            .filter(|s| !s.tx.is_closed())
            .count()
    }

    /// Every broadcast sent, as `(topic, event, payload)`.
    pub fn broadcasts(&self) -> Vec<(String, String, Value)> {
        self.state.lock().broadcasts.clone()
    }

    pub fn presence_members(&self, topic: &str) -> Vec<String> {
        self.state
            .lock()
            .presence
            .get(topic)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.connect_calls.push(Instant::now());
        if state.fail_connect_forever {
            return Err(TransportError::ConnectionLost("connect refused".into()));
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(TransportError::ConnectionLost("connect refused".into()));
        }
        state.connected = true;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.state.lock().connected
    }

    async fn heartbeat(&self) -> Result<(), TransportError> {
        let state = self.state.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if state.silent {
            return Err(TransportError::ConnectionLost("heartbeat unanswered".into()));
        }
        Ok(())
    }

    async fn subscribe(&self, spec: &ChannelSpec) -> Result<TransportSubscription, TransportError> {
        let mut state = self.state.lock();
        state.subscribe_calls += 1;
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if state.fail_subscribe {
            return Err(TransportError::subscribe_failed(&spec.topic, "rejected"));
        }

        state.next_id += 1;
        let id = SubscriptionId(state.next_id);
        let (tx, rx) = mpsc::unbounded_channel();

        if spec.has_presence() {
            let members = state
                .presence
                .get(&spec.topic)
                .map(|m| m.iter().cloned().collect())
                .unwrap_or_default();
            // Receiver is alive, cannot fail
            let _ = tx.send(TransportMessage::Presence(PresenceSignal::Sync(members)));
        }

        state.subscribers.insert(
            id,
            Subscriber {
                spec: spec.clone(),
                tx,
            },
        );
        Ok(TransportSubscription { id, messages: rx })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError> {
        self.state.lock().subscribers.remove(&id);
        Ok(())
    }

    async fn broadcast(&self, topic: &str, event: &str, payload: Value) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state
            .broadcasts
            .push((topic.to_string(), event.to_string(), payload.clone()));
        let message = TransportMessage::Broadcast {
            event: event.to_string(),
            payload,
        };
        state.deliver(message, |spec| spec.broadcast && spec.topic == topic);
        Ok(())
    }

    async fn track(&self, topic: &str, key: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        let added = state
            .presence
            .entry(topic.to_string())
            .or_default()
            .insert(key.to_string());
        if added {
            let message = TransportMessage::Presence(PresenceSignal::Join(vec![key.to_string()]));
            state.deliver(message, |spec| spec.has_presence() && spec.topic == topic);
        }
        Ok(())
    }

    async fn untrack(&self, topic: &str, key: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        let removed = state
            .presence
            .get_mut(topic)
            .is_some_and(|members| members.remove(key));
        if removed {
            let message = TransportMessage::Presence(PresenceSignal::Leave(vec![key.to_string()]));
            state.deliver(message, |spec| spec.has_presence() && spec.topic == topic);
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelKey;
    use serde_json::json;

    fn thread_spec(id: &str) -> ChannelSpec {
        ChannelSpec::for_key(&ChannelKey::thread(id), None)
    }

    #[tokio::test]
    async fn test_subscribe_requires_connection() {
        let transport = MemoryTransport::new();
        let err = transport.subscribe(&thread_spec("t1")).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
        assert_eq!(transport.subscribe_calls(), 1);
    }

    #[tokio::test]
    async fn test_changes_follow_filters() {
        let transport = MemoryTransport::new();
        transport.connect().await.unwrap();
        let mut t1 = transport.subscribe(&thread_spec("t1")).await.unwrap();
        let mut t2 = transport.subscribe(&thread_spec("t2")).await.unwrap();

        let record = ChangeRecord::insert("messages", json!({"id": "m1", "thread_id": "t1"}));
        assert_eq!(transport.publish_change(record.clone()), 1);

        assert_eq!(t1.messages.recv().await, Some(TransportMessage::Change(record)));
        assert!(t2.messages.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_presence_sync_then_join_and_leave() {
        let transport = MemoryTransport::new();
        transport.connect().await.unwrap();
        transport.track("presence:room", "u2").await.unwrap();

        let spec = ChannelSpec::for_key(&ChannelKey::presence("room"), Some("u1"));
        let mut sub = transport.subscribe(&spec).await.unwrap();
        assert_eq!(
            sub.messages.recv().await,
            Some(TransportMessage::Presence(PresenceSignal::Sync(vec!["u2".into()])))
        );

        transport.track("presence:room", "u3").await.unwrap();
        transport.untrack("presence:room", "u3").await.unwrap();
        assert_eq!(
            sub.messages.recv().await,
            Some(TransportMessage::Presence(PresenceSignal::Join(vec!["u3".into()])))
        );
        assert_eq!(
            sub.messages.recv().await,
            Some(TransportMessage::Presence(PresenceSignal::Leave(vec!["u3".into()])))
        );
    }

    #[tokio::test]
    async fn test_drop_connection_ends_streams() {
        let transport = MemoryTransport::new();
        transport.connect().await.unwrap();
        let mut sub = transport.subscribe(&thread_spec("t1")).await.unwrap();

        transport.drop_connection();

        assert_eq!(sub.messages.recv().await, None);
        assert!(!transport.is_healthy());
        assert!(transport.broadcast("thread:t1", "typing", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_fault_injection() {
        let transport = MemoryTransport::new();
        transport.fail_next_connects(2);

        assert!(transport.connect().await.is_err());
        assert!(transport.connect().await.is_err());
        assert!(transport.connect().await.is_ok());
        assert_eq!(transport.connect_calls().len(), 3);

        transport.set_silent(true);
        assert!(transport.is_healthy());
        assert!(transport.heartbeat().await.is_err());
    }
}
