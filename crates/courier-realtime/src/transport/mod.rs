//! Transport abstraction for change feeds, broadcasts and presence.
//!
//! A transport carries three kinds of traffic for a topic:
//!
//! - change-feed records matching the channel's filters
//! - ephemeral broadcasts (`event` + JSON payload), never persisted
//! - presence signals (`sync`, `join`, `leave`)
//!
//! Two implementations ship with the crate: [`MemoryTransport`] for
//! in-process use and tests, and [`RedisTransport`] for multi-instance
//! deployments.

mod memory;
mod redis;

pub use memory::MemoryTransport;
pub use self::redis::{RedisTransport, RedisTransportBuilder};

use std::fmt;

use async_trait::async_trait;
use courier_core::ChangeRecord;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::channel::ChannelSpec;
use crate::error::TransportError;

/// Transport-assigned subscription handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Presence traffic on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceSignal {
    /// Full membership, replaces whatever was known
    Sync(Vec<String>),
    Join(Vec<String>),
    Leave(Vec<String>),
}

/// One delivery on a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportMessage {
    Change(ChangeRecord),
    Broadcast { event: String, payload: Value },
    Presence(PresenceSignal),
}

/// An open subscription. Messages arrive in transport order; the stream
/// ends when the transport drops the subscription.
#[derive(Debug)]
pub struct TransportSubscription {
    pub id: SubscriptionId,
    pub messages: mpsc::UnboundedReceiver<TransportMessage>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name for logs.
    fn name(&self) -> &str;

    /// Establish (or re-establish) the connection.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Cheap local view of connection health.
    fn is_healthy(&self) -> bool;

    /// Round trip to the remote end. Silent failures surface here even
    /// while [`is_healthy`](Self::is_healthy) still reports true.
    async fn heartbeat(&self) -> Result<(), TransportError>;

    async fn subscribe(&self, spec: &ChannelSpec) -> Result<TransportSubscription, TransportError>;

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError>;

    /// Send an ephemeral event to every other subscriber of `topic`.
    async fn broadcast(&self, topic: &str, event: &str, payload: Value) -> Result<(), TransportError>;

    /// Join `topic`'s presence set under `key`.
    async fn track(&self, topic: &str, key: &str) -> Result<(), TransportError>;

    /// Leave `topic`'s presence set.
    async fn untrack(&self, topic: &str, key: &str) -> Result<(), TransportError>;

    /// Drop every subscription and close the connection.
    async fn disconnect(&self);
}
