//! Per-thread typing state from ephemeral broadcasts.
//!
//! Typists are removed on an explicit stop signal or when the thread
//! channel closes. With an idle timeout configured, [`prune_idle`]
//! additionally drops typists whose last signal is too old.
//!
//! [`prune_idle`]: TypingIndicatorBroker::prune_idle

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use courier_core::{EventBroadcaster, RealtimeEvent, TypingEvent};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

/// Broadcast event name for typing signals.
pub const TYPING_EVENT: &str = "typing";

/// Wire payload of a typing broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    pub user_id: String,
    pub is_typing: bool,
}

pub struct TypingIndicatorBroker {
    /// thread -> user that joined it; their own signals are not echoed
    local_users: Mutex<HashMap<String, String>>,
    /// Threads whose typing broadcasts are applied
    listening: Mutex<HashSet<String>>,
    /// thread -> user -> last signal
    typing: Mutex<HashMap<String, BTreeMap<String, Instant>>>,
    idle_timeout: Option<Duration>,
    events: Arc<EventBroadcaster>,
}

impl TypingIndicatorBroker {
    pub fn new(events: Arc<EventBroadcaster>, idle_timeout: Option<Duration>) -> Self {
        Self {
            local_users: Mutex::new(HashMap::new()),
            listening: Mutex::new(HashSet::new()),
            typing: Mutex::new(HashMap::new()),
            idle_timeout,
            events,
        }
    }

    /// Record who joined `thread_id`. The first join wins until the thread
    /// is forgotten, matching the channel it belongs to.
    pub fn set_local_user(&self, thread_id: &str, user_id: &str) {
        let mut local_users = self.local_users.lock();
        let current = local_users
            .entry(thread_id.to_string())
            .or_insert_with(|| user_id.to_string());
        if current != user_id {
            debug!(thread_id = %thread_id, user_id = %current, ignored = %user_id, "Thread already joined");
        }
    }

    pub fn local_user(&self, thread_id: &str) -> Option<String> {
        self.local_users.lock().get(thread_id).cloned()
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Start applying typing broadcasts for `thread_id`.
    pub fn listen(&self, thread_id: &str) {
        if self.listening.lock().insert(thread_id.to_string()) {
            debug!(thread_id = %thread_id, "Listening to typing");
        }
    }

    pub fn is_listening(&self, thread_id: &str) -> bool {
        self.listening.lock().contains(thread_id)
    }

    /// Apply a typing broadcast received on a thread channel. Returns the
    /// published event, or `None` when the thread is not listened to or
    /// the signal is an echo of the local user.
    pub fn receive(&self, thread_id: &str, payload: TypingPayload) -> Option<TypingEvent> {
        if !self.is_listening(thread_id) {
            return None;
        }
        if self.local_users.lock().get(thread_id) == Some(&payload.user_id) {
            return None;
        }

        {
            let mut typing = self.typing.lock();
            if payload.is_typing {
                typing
                    .entry(thread_id.to_string())
                    .or_default()
                    .insert(payload.user_id.clone(), Instant::now());
            } else if let Some(users) = typing.get_mut(thread_id) {
                users.remove(&payload.user_id);
                if users.is_empty() {
                    typing.remove(thread_id);
                }
            }
        }

        let event = TypingEvent {
            thread_id: thread_id.to_string(),
            user_id: payload.user_id,
            is_typing: payload.is_typing,
        };
        self.events.send(RealtimeEvent::UserTyping(event.clone()));
        Some(event)
    }

    /// Users currently typing in `thread_id`, sorted.
    pub fn typing_users(&self, thread_id: &str) -> Vec<String> {
        self.typing
            .lock()
            .get(thread_id)
            .map(|users| users.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop typists silent for longer than the idle timeout and publish a
    /// stop for each. No-op without a timeout.
    pub fn prune_idle(&self) -> Vec<TypingEvent> {
        let Some(timeout) = self.idle_timeout else {
            return Vec::new();
        };
        let now = Instant::now();

        let mut expired = Vec::new();
        {
            let mut typing = self.typing.lock();
            for (thread_id, users) in typing.iter_mut() {
                users.retain(|user_id, last| {
                    let idle = now.saturating_duration_since(*last) > timeout;
                    if idle {
                        expired.push(TypingEvent {
                            thread_id: thread_id.clone(),
                            user_id: user_id.clone(),
                            is_typing: false,
                        });
                    }
                    !idle
                });
            }
            typing.retain(|_, users| !users.is_empty());
        }

        for event in &expired {
            debug!(thread_id = %event.thread_id, user_id = %event.user_id, "Typing timed out");
            self.events.send(RealtimeEvent::UserTyping(event.clone()));
        }
        expired
    }

    /// Forget a thread entirely (channel torn down).
    pub fn forget(&self, thread_id: &str) {
        self.listening.lock().remove(thread_id);
        self.typing.lock().remove(thread_id);
        self.local_users.lock().remove(thread_id);
    }

    pub fn clear(&self) {
        self.listening.lock().clear();
        self.typing.lock().clear();
        self.local_users.lock().clear();
    }
}

impl std::fmt::Debug for TypingIndicatorBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypingIndicatorBroker")
            .field("idle_timeout", &self.idle_timeout)
            .field("threads", &self.typing.lock().len())
            .finish()
    }
}
