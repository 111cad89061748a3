//! Callback-style handlers for realtime events.
//!
//! A [`RealtimeHandler`] is the typed replacement for a single callback
//! object: every method has a no-op default, so implementors only override
//! the events they care about.

use async_trait::async_trait;

use super::types::{ConnectionChange, PresenceEvent, RealtimeErrorEvent, RealtimeEvent, TypingEvent};
use crate::change::ChangeOp;
use crate::records::{
    MessageRecord, NotificationRecord, ReactionRecord, ReadReceiptRecord, ThreadRecord,
};

/// Error type for handler operations.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Handler failed with a message.
    #[error("Handler execution failed: {0}")]
    Execution(String),

    /// Handler failed to forward to an internal channel.
    #[error("Channel send failed: {0}")]
    Channel(String),

    /// Generic error with source.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    /// Create an execution error from a string.
    pub fn execution(msg: impl Into<String>) -> Self {
        HandlerError::Execution(msg.into())
    }

    /// Create a channel error from a string.
    pub fn channel(msg: impl Into<String>) -> Self {
        HandlerError::Channel(msg.into())
    }
}

/// Handler for realtime events.
///
/// Handlers run one event at a time in bus order, so two events from the
/// same channel are never observed out of order.
///
/// # Example
///
/// ```ignore
/// struct UnreadBadge { count: AtomicU32 }
///
/// #[async_trait]
/// impl RealtimeHandler for UnreadBadge {
///     fn name(&self) -> &str { "unread_badge" }
///
///     async fn on_new_notification(&self, _n: &NotificationRecord) -> Result<(), HandlerError> {
///         self.count.fetch_add(1, Ordering::Relaxed);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait RealtimeHandler: Send + Sync {
    /// Unique name for this handler (for logging).
    fn name(&self) -> &str;

    async fn on_new_message(&self, _message: &MessageRecord) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn on_message_update(&self, _message: &MessageRecord) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn on_new_thread(&self, _thread: &ThreadRecord) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn on_thread_update(&self, _thread: &ThreadRecord) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn on_new_notification(
        &self,
        _notification: &NotificationRecord,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn on_notification_update(
        &self,
        _notification: &NotificationRecord,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn on_reaction(
        &self,
        _op: ChangeOp,
        _reaction: &ReactionRecord,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn on_read_receipt(
        &self,
        _op: ChangeOp,
        _receipt: &ReadReceiptRecord,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn on_user_typing(&self, _event: &TypingEvent) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn on_user_online(&self, _event: &PresenceEvent) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn on_connection_change(&self, _change: ConnectionChange) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn on_error(&self, _error: &RealtimeErrorEvent) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Route an event to the matching method.
    async fn handle(&self, event: &RealtimeEvent) -> Result<(), HandlerError> {
        match event {
            RealtimeEvent::NewMessage(m) => self.on_new_message(m).await,
            RealtimeEvent::MessageUpdated(m) => self.on_message_update(m).await,
            RealtimeEvent::NewThread(t) => self.on_new_thread(t).await,
            RealtimeEvent::ThreadUpdated(t) => self.on_thread_update(t).await,
            RealtimeEvent::NewNotification(n) => self.on_new_notification(n).await,
            RealtimeEvent::NotificationUpdated(n) => self.on_notification_update(n).await,
            RealtimeEvent::ReactionChanged { op, reaction } => self.on_reaction(*op, reaction).await,
            RealtimeEvent::ReadReceiptChanged { op, receipt } => {
                self.on_read_receipt(*op, receipt).await
            }
            RealtimeEvent::UserTyping(e) => self.on_user_typing(e).await,
            RealtimeEvent::UserOnline(e) => self.on_user_online(e).await,
            RealtimeEvent::ConnectionChanged(c) => self.on_connection_change(*c).await,
            RealtimeEvent::Error(e) => self.on_error(e).await,
        }
    }
}
