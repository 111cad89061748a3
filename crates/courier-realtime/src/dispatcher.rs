//! Change-feed routing: cache invalidation first, then the typed event.
//!
//! ## Routing Table
//!
//! | Change                 | Invalidates                               | Publishes               |
//! |------------------------|-------------------------------------------|-------------------------|
//! | message INSERT         | thread message lists                      | `NewMessage`            |
//! | message UPDATE/DELETE  | the message, thread message lists         | `MessageUpdated` (UPDATE) |
//! | thread INSERT/UPDATE/DELETE | the thread key                       | `NewThread` / `ThreadUpdated` |
//! | notification *         | the user's notification list              | `NewNotification` / `NotificationUpdated` |
//! | reaction *             | the owning thread's message lists         | `ReactionChanged`       |
//! | read receipt *         | the owning thread's message lists         | `ReadReceiptChanged`    |
//!
//! Entity DELETEs invalidate like UPDATEs but publish nothing. Reactions and
//! read receipts carry their operation, so they are published for every op.

use std::sync::Arc;

use courier_cache::{CacheCoordinator, CacheKind};
use courier_core::{
    ChangeEvent, ChangeOp, ChangeRecord, EventBroadcaster, RealtimeErrorEvent, RealtimeEvent,
};
use tracing::{debug, warn};

use crate::channel::ChannelKey;

pub struct EventDispatcher {
    cache: Option<Arc<CacheCoordinator>>,
    events: Arc<EventBroadcaster>,
}

impl EventDispatcher {
    pub fn new(cache: Option<Arc<CacheCoordinator>>, events: Arc<EventBroadcaster>) -> Self {
        Self { cache, events }
    }

    pub fn cache(&self) -> Option<&Arc<CacheCoordinator>> {
        self.cache.as_ref()
    }

    /// Decode and route one raw record received on `channel`. Records
    /// that do not decode are reported on the bus and skipped.
    pub async fn dispatch(&self, channel: &ChannelKey, record: &ChangeRecord) -> Option<RealtimeEvent> {
        match ChangeEvent::try_from(record) {
            Ok(event) => self.route(event).await,
            Err(e) => {
                warn!(
                    channel = %channel,
                    table = %record.table,
                    op = %record.event_type,
                    error = %e,
                    "Undecodable change record"
                );
                self.events.send_error(
                    RealtimeErrorEvent::decode(e.to_string()).with_channel(channel.to_string()),
                );
                None
            }
        }
    }

    /// Route a typed change. Returns the published event, if any.
    pub async fn route(&self, event: ChangeEvent) -> Option<RealtimeEvent> {
        let kind = event.kind();
        let op = event.op();

        let published = match event {
            ChangeEvent::Message { op, record, .. } => {
                if let Some(cache) = &self.cache {
                    if op != ChangeOp::Insert {
                        cache.invalidate_message(&record.id).await;
                    }
                    cache.invalidate_thread_messages(&record.thread_id).await;
                }
                match op {
                    ChangeOp::Insert => Some(RealtimeEvent::NewMessage(record)),
                    ChangeOp::Update => Some(RealtimeEvent::MessageUpdated(record)),
                    ChangeOp::Delete => None,
                }
            }
            ChangeEvent::Thread { op, record, .. } => {
                if let Some(cache) = &self.cache {
                    cache.delete(CacheKind::Thread, &record.id).await;
                }
                match op {
                    ChangeOp::Insert => Some(RealtimeEvent::NewThread(record)),
                    ChangeOp::Update => Some(RealtimeEvent::ThreadUpdated(record)),
                    ChangeOp::Delete => None,
                }
            }
            ChangeEvent::Notification { op, record, .. } => {
                if let Some(cache) = &self.cache {
                    cache.invalidate_user_notifications(&record.user_id).await;
                }
                match op {
                    ChangeOp::Insert => Some(RealtimeEvent::NewNotification(record)),
                    ChangeOp::Update => Some(RealtimeEvent::NotificationUpdated(record)),
                    ChangeOp::Delete => None,
                }
            }
            ChangeEvent::Reaction { op, record } => {
                self.invalidate_thread_lists(record.thread_id.as_deref()).await;
                Some(RealtimeEvent::ReactionChanged { op, reaction: record })
            }
            ChangeEvent::ReadReceipt { op, record } => {
                self.invalidate_thread_lists(record.thread_id.as_deref()).await;
                Some(RealtimeEvent::ReadReceiptChanged { op, receipt: record })
            }
        };

        match &published {
            Some(event) => {
                debug!(kind = %kind, op = %op, event = event.name(), "Dispatching change");
                self.events.send(event.clone());
            }
            None => {
                debug!(kind = %kind, op = %op, "Change invalidated without event");
            }
        }
        published
    }

    async fn invalidate_thread_lists(&self, thread_id: Option<&str>) {
        if let (Some(cache), Some(thread_id)) = (&self.cache, thread_id) {
            cache.invalidate_thread_messages(thread_id).await;
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("cache", &self.cache.is_some())
            .finish()
    }
}
