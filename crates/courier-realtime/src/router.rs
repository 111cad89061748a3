//! Routes channel traffic to the dispatcher, presence and typing.

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{EventBroadcaster, RealtimeErrorEvent};
use tracing::{debug, warn};

use crate::channel::{Channel, ChannelKey};
use crate::dispatcher::EventDispatcher;
use crate::presence::PresenceTracker;
use crate::registry::ChannelSink;
use crate::transport::{Transport, TransportMessage};
use crate::typing::{TYPING_EVENT, TypingIndicatorBroker, TypingPayload};

pub struct ChannelRouter {
    dispatcher: Arc<EventDispatcher>,
    presence: Arc<PresenceTracker>,
    typing: Arc<TypingIndicatorBroker>,
    transport: Arc<dyn Transport>,
    events: Arc<EventBroadcaster>,
}

impl ChannelRouter {
    pub fn new(
        dispatcher: Arc<EventDispatcher>,
        presence: Arc<PresenceTracker>,
        typing: Arc<TypingIndicatorBroker>,
        transport: Arc<dyn Transport>,
        events: Arc<EventBroadcaster>,
    ) -> Self {
        Self {
            dispatcher,
            presence,
            typing,
            transport,
            events,
        }
    }
}

#[async_trait]
impl ChannelSink for ChannelRouter {
    async fn on_message(&self, key: &ChannelKey, message: TransportMessage) {
        match (key, message) {
            (_, TransportMessage::Change(record)) => {
                self.dispatcher.dispatch(key, &record).await;
            }
            (ChannelKey::Thread(thread_id), TransportMessage::Broadcast { event, payload }) => {
                if event != TYPING_EVENT {
                    debug!(channel = %key, event = %event, "Ignoring broadcast");
                    return;
                }
                match serde_json::from_value::<TypingPayload>(payload) {
                    Ok(payload) => {
                        self.typing.receive(thread_id, payload);
                    }
                    Err(e) => {
                        warn!(channel = %key, error = %e, "Malformed typing payload");
                    }
                }
            }
            (ChannelKey::Presence(room), TransportMessage::Presence(signal)) => {
                self.presence.apply(room, signal);
            }
            (_, other) => {
                debug!(channel = %key, message = ?other, "Unrouted channel message");
            }
        }
    }

    /// Announce ourselves on presence channels after every join, so the
    /// announcement is repeated after a reconnect.
    async fn on_joined(&self, channel: &Channel) {
        let ChannelKey::Presence(_) = channel.key() else {
            return;
        };
        let Some(user_id) = &channel.spec().presence_key else {
            return;
        };
        if let Err(e) = self.transport.track(&channel.spec().topic, user_id).await {
            warn!(channel = %channel.key(), error = %e, "Presence announcement failed");
            self.events.send_error(
                RealtimeErrorEvent::transport(e.to_string()).with_channel(channel.key().to_string()),
            );
        }
    }

    async fn on_closed(&self, channel: &Channel) {
        match channel.key() {
            ChannelKey::Thread(thread_id) => self.typing.forget(thread_id),
            ChannelKey::Presence(room) => {
                if let Some(user_id) = &channel.spec().presence_key {
                    if let Err(e) = self.transport.untrack(&channel.spec().topic, user_id).await {
                        debug!(channel = %channel.key(), error = %e, "Presence leave not sent");
                    }
                }
                self.presence.clear_room(room);
            }
            ChannelKey::Notifications(_) | ChannelKey::UserThreads(_) => {}
        }
    }
}

impl std::fmt::Debug for ChannelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRouter")
            .field("transport", &self.transport.name())
            .finish_non_exhaustive()
    }
}
