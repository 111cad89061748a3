//! Channel keys, subscription specs and the live channel handle.
//!
//! ## Channel Categories
//!
//! | Key                     | Change feed                                       | Extras     |
//! |-------------------------|---------------------------------------------------|------------|
//! | `thread:{id}`           | messages, reactions, read receipts of the thread; the thread row | broadcast (typing) |
//! | `notifications:{user}`  | notifications of the user                         |            |
//! | `user_threads:{user}`   | threads the user participates in                  |            |
//! | `presence:{room}`       | none                                              | presence   |

use std::fmt;

use courier_core::{ChangeFilter, EntityKind};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::transport::SubscriptionId;

/// Identity of one logical subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelKey {
    Thread(String),
    Notifications(String),
    UserThreads(String),
    Presence(String),
}

impl ChannelKey {
    pub fn thread(id: impl Into<String>) -> Self {
        Self::Thread(id.into())
    }

    pub fn notifications(user_id: impl Into<String>) -> Self {
        Self::Notifications(user_id.into())
    }

    pub fn user_threads(user_id: impl Into<String>) -> Self {
        Self::UserThreads(user_id.into())
    }

    pub fn presence(room: impl Into<String>) -> Self {
        Self::Presence(room.into())
    }

    pub fn category(&self) -> &'static str {
        match self {
            Self::Thread(_) => "thread",
            Self::Notifications(_) => "notifications",
            Self::UserThreads(_) => "user_threads",
            Self::Presence(_) => "presence",
        }
    }

    /// The resource id the key is scoped to.
    pub fn id(&self) -> &str {
        match self {
            Self::Thread(id)
            | Self::Notifications(id)
            | Self::UserThreads(id)
            | Self::Presence(id) => id,
        }
    }

    /// Topic name on the transport, e.g. `thread:t1`.
    pub fn topic(&self) -> String {
        self.to_string()
    }

    /// Parse the `{category}:{id}` form.
    pub fn parse(s: &str) -> Option<Self> {
        let (category, id) = s.split_once(':')?;
        if id.is_empty() {
            return None;
        }
        match category {
            "thread" => Some(Self::thread(id)),
            "notifications" => Some(Self::notifications(id)),
            "user_threads" => Some(Self::user_threads(id)),
            "presence" => Some(Self::presence(id)),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.category(), self.id())
    }
}

/// What a transport needs to open a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub topic: String,
    /// Change-feed listeners; a record is delivered if any filter matches
    pub filters: Vec<ChangeFilter>,
    /// Receive ephemeral broadcasts on the topic
    pub broadcast: bool,
    /// Join the topic's presence set under this key
    pub presence_key: Option<String>,
}

impl ChannelSpec {
    /// The standard listener set for a key's category.
    pub fn for_key(key: &ChannelKey, user_id: Option<&str>) -> Self {
        let topic = key.topic();
        match key {
            ChannelKey::Thread(thread_id) => Self {
                topic,
                filters: vec![
                    ChangeFilter::eq(EntityKind::Message.table(), "thread_id", thread_id),
                    ChangeFilter::eq(EntityKind::Thread.table(), "id", thread_id),
                    ChangeFilter::eq(EntityKind::Reaction.table(), "thread_id", thread_id),
                    ChangeFilter::eq(EntityKind::ReadReceipt.table(), "thread_id", thread_id),
                ],
                broadcast: true,
                presence_key: None,
            },
            ChannelKey::Notifications(user) => Self {
                topic,
                filters: vec![ChangeFilter::eq(
                    EntityKind::Notification.table(),
                    "user_id",
                    user,
                )],
                broadcast: false,
                presence_key: None,
            },
            ChannelKey::UserThreads(user) => Self {
                topic,
                filters: vec![ChangeFilter::eq(
                    EntityKind::Thread.table(),
                    "participant_ids",
                    user,
                )],
                broadcast: false,
                presence_key: None,
            },
            ChannelKey::Presence(_) => Self {
                topic,
                filters: Vec::new(),
                broadcast: false,
                presence_key: user_id.map(str::to_string),
            },
        }
    }

    pub fn has_presence(&self) -> bool {
        self.presence_key.is_some()
    }
}

/// Lifecycle of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Joining,
    Joined,
    /// Last subscribe failed; retried on the next reconnect
    Errored(String),
    Closed,
}

/// A registered channel.
///
/// Held behind `Arc` by the registry; callers receive clones of the same
/// handle for the same key.
pub struct Channel {
    key: ChannelKey,
    spec: ChannelSpec,
    state: Mutex<ChannelState>,
    subscription: Mutex<Option<SubscriptionId>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    pub(crate) fn new(key: ChannelKey, spec: ChannelSpec) -> Self {
        Self {
            key,
            spec,
            state: Mutex::new(ChannelState::Joining),
            subscription: Mutex::new(None),
            pump: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn spec(&self) -> &ChannelSpec {
        &self.spec
    }

    pub fn state(&self) -> ChannelState {
        self.state.lock().clone()
    }

    pub fn is_joined(&self) -> bool {
        *self.state.lock() == ChannelState::Joined
    }

    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        *self.subscription.lock()
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
    }

    pub(crate) fn attach(&self, id: SubscriptionId, pump: JoinHandle<()>) {
        *self.subscription.lock() = Some(id);
        if let Some(old) = self.pump.lock().replace(pump) {
            old.abort();
        }
    }

    /// Stop the message pump and hand back the transport subscription, if any.
    pub(crate) fn detach(&self) -> Option<SubscriptionId> {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.subscription.lock().take()
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("subscription", &self.subscription_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_round_trip() {
        for key in [
            ChannelKey::thread("t1"),
            ChannelKey::notifications("u1"),
            ChannelKey::user_threads("u1"),
            ChannelKey::presence("online_users"),
        ] {
            assert_eq!(ChannelKey::parse(&key.to_string()), Some(key));
        }
        assert_eq!(ChannelKey::thread("t1").topic(), "thread:t1");
        assert_eq!(ChannelKey::parse("thread:"), None);
        assert_eq!(ChannelKey::parse("inbox:u1"), None);
    }

    #[test]
    fn test_thread_spec_listens_to_thread_tables() {
        let spec = ChannelSpec::for_key(&ChannelKey::thread("t1"), Some("u1"));
        let tables: Vec<&str> = spec.filters.iter().map(|f| f.table.as_str()).collect();
        assert_eq!(
            tables,
            vec!["messages", "threads", "message_reactions", "message_read_receipts"]
        );
        assert!(spec.broadcast);
        assert!(!spec.has_presence());
        assert_eq!(spec.filters[0].expression().as_deref(), Some("thread_id=eq.t1"));
    }

    #[test]
    fn test_presence_spec_carries_user() {
        let spec = ChannelSpec::for_key(&ChannelKey::presence("online_users"), Some("u1"));
        assert!(spec.filters.is_empty());
        assert_eq!(spec.presence_key.as_deref(), Some("u1"));
    }

    #[test]
    fn test_user_threads_spec_filters_participants() {
        let spec = ChannelSpec::for_key(&ChannelKey::user_threads("u7"), None);
        assert_eq!(spec.filters.len(), 1);
        assert_eq!(spec.filters[0].table, "threads");
        assert_eq!(
            spec.filters[0].expression().as_deref(),
            Some("participant_ids=eq.u7")
        );
    }
}
