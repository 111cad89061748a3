//! Entity records carried by the change feed.
//!
//! The persistent store owns these rows; Courier only decodes them from
//! change-feed payloads, hands them to listeners and caches them.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A chat message. Immutable after creation except `is_read` and
/// `edited_content`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub thread_id: String,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub edited_content: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
}

/// A conversation context with its participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub participant_ids: Vec<String>,
    /// Append-only, ordered by send time.
    #[serde(default)]
    pub message_ids: Vec<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_activity_at: Option<OffsetDateTime>,
}

impl ThreadRecord {
    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participant_ids.iter().any(|p| p == user_id)
    }
}

/// Per-user notification referencing a message or thread event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
}

/// A reaction on a message. Not part of the cached message payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionRecord {
    pub id: String,
    pub message_id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    pub user_id: String,
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadReceiptRecord {
    pub message_id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    pub user_id: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub read_at: Option<OffsetDateTime>,
}
