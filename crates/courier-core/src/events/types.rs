//! Event types published on the realtime bus.

use serde::{Deserialize, Serialize};

use crate::change::ChangeOp;
use crate::records::{
    MessageRecord, NotificationRecord, ReactionRecord, ReadReceiptRecord, ThreadRecord,
};

/// Connection transitions reported to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionChange {
    Connected,
    Disconnected,
}

impl ConnectionChange {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionChange::Connected => "connected",
            ConnectionChange::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for ConnectionChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A user started or stopped typing in a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingEvent {
    pub thread_id: String,
    pub user_id: String,
    pub is_typing: bool,
}

/// A peer came online or went offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub user_id: String,
    pub is_online: bool,
}

/// Where an error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSource {
    /// Subscribe, unsubscribe or broadcast failed
    Transport,
    /// A change-feed payload could not be decoded
    Decode,
    /// Reconnection gave up after the attempt cap
    Reconnect,
}

/// Error surfaced to listeners instead of being returned from a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeErrorEvent {
    pub source: ErrorSource,
    pub message: String,
    /// Channel key the error relates to, if any
    pub channel: Option<String>,
    /// True when no further automatic recovery will be attempted
    pub terminal: bool,
}

impl RealtimeErrorEvent {
    pub fn new(source: ErrorSource, message: impl Into<String>) -> Self {
        Self {
            source,
            message: message.into(),
            channel: None,
            terminal: false,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorSource::Transport, message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(ErrorSource::Decode, message)
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }
}

/// Unified event published on the realtime bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RealtimeEvent {
    NewMessage(MessageRecord),
    MessageUpdated(MessageRecord),
    NewThread(ThreadRecord),
    ThreadUpdated(ThreadRecord),
    NewNotification(NotificationRecord),
    NotificationUpdated(NotificationRecord),
    ReactionChanged {
        op: ChangeOp,
        reaction: ReactionRecord,
    },
    ReadReceiptChanged {
        op: ChangeOp,
        receipt: ReadReceiptRecord,
    },
    UserTyping(TypingEvent),
    UserOnline(PresenceEvent),
    ConnectionChanged(ConnectionChange),
    Error(RealtimeErrorEvent),
}

impl RealtimeEvent {
    /// Short name of the event kind, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            RealtimeEvent::NewMessage(_) => "new_message",
            RealtimeEvent::MessageUpdated(_) => "message_updated",
            RealtimeEvent::NewThread(_) => "new_thread",
            RealtimeEvent::ThreadUpdated(_) => "thread_updated",
            RealtimeEvent::NewNotification(_) => "new_notification",
            RealtimeEvent::NotificationUpdated(_) => "notification_updated",
            RealtimeEvent::ReactionChanged { .. } => "reaction_changed",
            RealtimeEvent::ReadReceiptChanged { .. } => "read_receipt_changed",
            RealtimeEvent::UserTyping(_) => "user_typing",
            RealtimeEvent::UserOnline(_) => "user_online",
            RealtimeEvent::ConnectionChanged(_) => "connection_changed",
            RealtimeEvent::Error(_) => "error",
        }
    }

    pub fn as_error(&self) -> Option<&RealtimeErrorEvent> {
        match self {
            RealtimeEvent::Error(e) => Some(e),
            _ => None,
        }
    }
}
