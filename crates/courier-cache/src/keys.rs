//! Cache key format and per-entity TTL policy.
//!
//! ## Key Format
//!
//! `{kind}:{id}`, e.g. `message:m1`, `thread:t1`, `thread_messages:t1`,
//! `user_notifications:u1`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Cached entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    Message,
    Thread,
    /// Message list of one thread
    ThreadMessages,
    /// Notification list of one user
    UserNotifications,
}

impl CacheKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::Message => "message",
            CacheKind::Thread => "thread",
            CacheKind::ThreadMessages => "thread_messages",
            CacheKind::UserNotifications => "user_notifications",
        }
    }

    /// Build the cache key for an id of this kind.
    #[inline]
    pub fn key(&self, id: &str) -> String {
        format!("{}:{id}", self.as_str())
    }
}

impl std::fmt::Display for CacheKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Time-to-live per entity kind. List-shaped entries churn faster and so
/// expire sooner than single entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub message: Duration,
    pub thread: Duration,
    pub thread_messages: Duration,
    pub user_notifications: Duration,
}

impl TtlPolicy {
    pub fn for_kind(&self, kind: CacheKind) -> Duration {
        match kind {
            CacheKind::Message => self.message,
            CacheKind::Thread => self.thread,
            CacheKind::ThreadMessages => self.thread_messages,
            CacheKind::UserNotifications => self.user_notifications,
        }
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            message: Duration::from_secs(300),
            thread: Duration::from_secs(600),
            thread_messages: Duration::from_secs(300),
            user_notifications: Duration::from_secs(180),
        }
    }
}
