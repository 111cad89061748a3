//! Online-peer tracking per presence room.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use courier_core::{EventBroadcaster, PresenceEvent, RealtimeEvent};
use parking_lot::Mutex;
use tracing::debug;

use crate::transport::PresenceSignal;

/// Set of peers believed online, per room.
///
/// Membership is rebuilt from `sync` signals and adjusted by `join` /
/// `leave`. `UserOnline` events fire only when membership of a peer
/// actually changes, and never for the local user.
pub struct PresenceTracker {
    /// room -> user that joined it
    local_users: Mutex<HashMap<String, String>>,
    rooms: Mutex<HashMap<String, BTreeSet<String>>>,
    events: Arc<EventBroadcaster>,
}

impl PresenceTracker {
    pub fn new(events: Arc<EventBroadcaster>) -> Self {
        Self {
            local_users: Mutex::new(HashMap::new()),
            rooms: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Record who joined `room`. The first join wins until the room is
    /// cleared.
    pub fn set_local_user(&self, room: &str, user_id: &str) {
        let mut local_users = self.local_users.lock();
        let current = local_users
            .entry(room.to_string())
            .or_insert_with(|| user_id.to_string());
        if current != user_id {
            debug!(room = %room, user_id = %current, ignored = %user_id, "Presence room already joined");
        }
    }

    pub fn local_user(&self, room: &str) -> Option<String> {
        self.local_users.lock().get(room).cloned()
    }

    /// Apply a presence signal for `room`, returning the events published.
    pub fn apply(&self, room: &str, signal: PresenceSignal) -> Vec<PresenceEvent> {
        let local = self.local_user(room);
        let is_self = |user: &String| local.as_deref() == Some(user.as_str());

        let changes = {
            let mut rooms = self.rooms.lock();
            let members = rooms.entry(room.to_string()).or_default();
            match signal {
                PresenceSignal::Sync(users) => {
                    *members = users.into_iter().filter(|u| !is_self(u)).collect();
                    debug!(room = %room, online = members.len(), "Presence synced");
                    Vec::new()
                }
                PresenceSignal::Join(users) => users
                    .into_iter()
                    .filter(|u| !is_self(u))
                    .filter(|u| members.insert(u.clone()))
                    .map(|user_id| PresenceEvent {
                        user_id,
                        is_online: true,
                    })
                    .collect(),
                PresenceSignal::Leave(users) => users
                    .into_iter()
                    .filter(|u| !is_self(u))
                    .filter(|u| members.remove(u))
                    .map(|user_id| PresenceEvent {
                        user_id,
                        is_online: false,
                    })
                    .collect::<Vec<_>>(),
            }
        };

        for change in &changes {
            self.events.send(RealtimeEvent::UserOnline(change.clone()));
        }
        changes
    }

    /// Peers online in `room`, sorted.
    pub fn online_users(&self, room: &str) -> Vec<String> {
        self.rooms
            .lock()
            .get(room)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_online(&self, room: &str, user_id: &str) -> bool {
        self.rooms
            .lock()
            .get(room)
            .is_some_and(|m| m.contains(user_id))
    }

    pub fn clear_room(&self, room: &str) {
        self.rooms.lock().remove(room);
        self.local_users.lock().remove(room);
    }

    pub fn clear(&self) {
        self.rooms.lock().clear();
        self.local_users.lock().clear();
    }
}

impl std::fmt::Debug for PresenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceTracker")
            .field("local_users", &self.local_users.lock().len())
            .field("rooms", &self.rooms.lock().len())
            .finish()
    }
}
