//! Change-data-capture payloads and their typed decoding.
//!
//! The store emits raw row-level records (`ChangeRecord`) keyed by
//! `(schema, table)`. `ChangeEvent` is the decoded, exhaustively matchable
//! form the dispatcher routes on.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::{CoreError, Result};
use crate::records::{
    MessageRecord, NotificationRecord, ReactionRecord, ReadReceiptRecord, ThreadRecord,
};

/// Default schema for change-feed tables.
pub const DEFAULT_SCHEMA: &str = "public";

// ============================================================================
// Raw change records
// ============================================================================

/// Row-level operation reported by the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl ChangeOp {
    /// Returns the string representation of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Insert => "INSERT",
            ChangeOp::Update => "UPDATE",
            ChangeOp::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A raw `{eventType, new, old}` record from the change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
    #[serde(rename = "eventType", alias = "event_type")]
    pub event_type: ChangeOp,
    /// Row after the change (None for deletions)
    #[serde(default)]
    pub new: Option<Value>,
    /// Row before the change, when the store reports it
    #[serde(default)]
    pub old: Option<Value>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub commit_timestamp: Option<OffsetDateTime>,
}

fn default_schema() -> String {
    DEFAULT_SCHEMA.to_string()
}

impl ChangeRecord {
    /// Create a new change record in the default schema.
    pub fn new(
        event_type: ChangeOp,
        table: impl Into<String>,
        new: Option<Value>,
        old: Option<Value>,
    ) -> Self {
        Self {
            schema: default_schema(),
            table: table.into(),
            event_type,
            new,
            old,
            commit_timestamp: Some(OffsetDateTime::now_utc()),
        }
    }

    /// Create an INSERT record.
    pub fn insert(table: impl Into<String>, new: Value) -> Self {
        Self::new(ChangeOp::Insert, table, Some(new), None)
    }

    /// Create an UPDATE record.
    pub fn update(table: impl Into<String>, new: Value, old: Option<Value>) -> Self {
        Self::new(ChangeOp::Update, table, Some(new), old)
    }

    /// Create a DELETE record.
    pub fn delete(table: impl Into<String>, old: Value) -> Self {
        Self::new(ChangeOp::Delete, table, None, Some(old))
    }

    /// Set the schema.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// The row the operation is about: `new`, or `old` for deletions.
    pub fn row(&self) -> Option<&Value> {
        match self.event_type {
            ChangeOp::Delete => self.old.as_ref().or(self.new.as_ref()),
            _ => self.new.as_ref().or(self.old.as_ref()),
        }
    }

    /// Entity kind of the table this record came from.
    pub fn entity_kind(&self) -> Option<EntityKind> {
        EntityKind::from_table(&self.table)
    }
}

// ============================================================================
// Filters
// ============================================================================

/// Subscription filter over the change feed: `(schema, table, column=eq.value)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeFilter {
    pub schema: String,
    pub table: String,
    /// Equality predicate on one column of the row
    pub column: Option<String>,
    pub value: Option<String>,
}

impl ChangeFilter {
    /// Match every row of a table.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            schema: default_schema(),
            table: table.into(),
            column: None,
            value: None,
        }
    }

    /// Match rows where `column` equals `value`.
    pub fn eq(table: impl Into<String>, column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            schema: default_schema(),
            table: table.into(),
            column: Some(column.into()),
            value: Some(value.into()),
        }
    }

    /// Parse a filter expression of the form `column=eq.value`.
    pub fn parse(table: impl Into<String>, expr: &str) -> Result<Self> {
        let (column, rest) = expr
            .split_once('=')
            .ok_or_else(|| CoreError::invalid_filter(expr))?;
        let value = rest
            .strip_prefix("eq.")
            .ok_or_else(|| CoreError::invalid_filter(expr))?;
        if column.is_empty() || value.is_empty() {
            return Err(CoreError::invalid_filter(expr));
        }
        Ok(Self::eq(table, column, value))
    }

    /// Set the schema.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Render the predicate back to `column=eq.value`, if any.
    pub fn expression(&self) -> Option<String> {
        match (&self.column, &self.value) {
            (Some(c), Some(v)) => Some(format!("{c}=eq.{v}")),
            _ => None,
        }
    }

    /// Check whether a change record passes this filter.
    pub fn matches(&self, record: &ChangeRecord) -> bool {
        if record.schema != self.schema || record.table != self.table {
            return false;
        }
        let (Some(column), Some(expected)) = (&self.column, &self.value) else {
            return true;
        };
        let Some(actual) = record.row().and_then(|row| row.get(column)) else {
            return false;
        };
        match actual {
            Value::String(s) => s == expected,
            Value::Number(n) => n.to_string() == *expected,
            Value::Bool(b) => b.to_string() == *expected,
            Value::Array(items) => items
                .iter()
                .any(|item| item.as_str().is_some_and(|s| s == expected)),
            _ => false,
        }
    }
}

// ============================================================================
// Typed change events
// ============================================================================

/// Entity kinds carried on the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Message,
    Thread,
    Notification,
    Reaction,
    ReadReceipt,
}

impl EntityKind {
    /// Map a change-feed table name to its entity kind.
    pub fn from_table(table: &str) -> Option<Self> {
        match table {
            "messages" => Some(EntityKind::Message),
            "threads" => Some(EntityKind::Thread),
            "notifications" => Some(EntityKind::Notification),
            "message_reactions" => Some(EntityKind::Reaction),
            "message_read_receipts" => Some(EntityKind::ReadReceipt),
            _ => None,
        }
    }

    /// Table the entity lives in.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Message => "messages",
            EntityKind::Thread => "threads",
            EntityKind::Notification => "notifications",
            EntityKind::Reaction => "message_reactions",
            EntityKind::ReadReceipt => "message_read_receipts",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Message => "message",
            EntityKind::Thread => "thread",
            EntityKind::Notification => "notification",
            EntityKind::Reaction => "reaction",
            EntityKind::ReadReceipt => "read_receipt",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A decoded change-feed event.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Message {
        op: ChangeOp,
        record: MessageRecord,
        previous: Option<MessageRecord>,
    },
    Thread {
        op: ChangeOp,
        record: ThreadRecord,
        previous: Option<ThreadRecord>,
    },
    Notification {
        op: ChangeOp,
        record: NotificationRecord,
        previous: Option<NotificationRecord>,
    },
    Reaction {
        op: ChangeOp,
        record: ReactionRecord,
    },
    ReadReceipt {
        op: ChangeOp,
        record: ReadReceiptRecord,
    },
}

impl ChangeEvent {
    pub fn op(&self) -> ChangeOp {
        match self {
            ChangeEvent::Message { op, .. }
            | ChangeEvent::Thread { op, .. }
            | ChangeEvent::Notification { op, .. }
            | ChangeEvent::Reaction { op, .. }
            | ChangeEvent::ReadReceipt { op, .. } => *op,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            ChangeEvent::Message { .. } => EntityKind::Message,
            ChangeEvent::Thread { .. } => EntityKind::Thread,
            ChangeEvent::Notification { .. } => EntityKind::Notification,
            ChangeEvent::Reaction { .. } => EntityKind::Reaction,
            ChangeEvent::ReadReceipt { .. } => EntityKind::ReadReceipt,
        }
    }
}

impl TryFrom<&ChangeRecord> for ChangeEvent {
    type Error = CoreError;

    fn try_from(raw: &ChangeRecord) -> Result<Self> {
        let kind = raw
            .entity_kind()
            .ok_or_else(|| CoreError::unknown_table(&raw.schema, &raw.table))?;
        let row = raw
            .row()
            .ok_or_else(|| CoreError::missing_record(&raw.table))?;
        let op = raw.event_type;

        let event = match kind {
            EntityKind::Message => ChangeEvent::Message {
                op,
                record: decode(kind, row)?,
                previous: previous_row(raw),
            },
            EntityKind::Thread => ChangeEvent::Thread {
                op,
                record: decode(kind, row)?,
                previous: previous_row(raw),
            },
            EntityKind::Notification => ChangeEvent::Notification {
                op,
                record: decode(kind, row)?,
                previous: previous_row(raw),
            },
            EntityKind::Reaction => ChangeEvent::Reaction {
                op,
                record: decode(kind, row)?,
            },
            EntityKind::ReadReceipt => ChangeEvent::ReadReceipt {
                op,
                record: decode(kind, row)?,
            },
        };
        Ok(event)
    }
}

fn decode<T: DeserializeOwned>(kind: EntityKind, row: &Value) -> Result<T> {
    serde_json::from_value(row.clone())
        .map_err(|e| CoreError::invalid_record(kind.as_str(), e.to_string()))
}

/// The pre-change row, only meaningful for updates. Stores that only ship
/// the primary key in `old` yield None here.
fn previous_row<T: DeserializeOwned>(raw: &ChangeRecord) -> Option<T> {
    if raw.event_type != ChangeOp::Update {
        return None;
    }
    raw.old
        .as_ref()
        .and_then(|old| serde_json::from_value(old.clone()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_record_wire_format() {
        let raw: ChangeRecord = serde_json::from_value(json!({
            "schema": "public",
            "table": "messages",
            "eventType": "INSERT",
            "new": {"id": "m1", "thread_id": "t1", "content": "hi"},
            "old": null
        }))
        .unwrap();
        assert_eq!(raw.event_type, ChangeOp::Insert);
        assert_eq!(raw.entity_kind(), Some(EntityKind::Message));
    }

    #[test]
    fn test_row_prefers_old_for_delete() {
        let raw = ChangeRecord::delete("messages", json!({"id": "m1", "thread_id": "t1"}));
        assert_eq!(raw.row().unwrap()["id"], "m1");
    }

    #[test]
    fn test_decode_message_update_with_previous() {
        let raw = ChangeRecord::update(
            "messages",
            json!({"id": "m1", "thread_id": "t1", "content": "hi", "is_read": true}),
            Some(json!({"id": "m1", "thread_id": "t1", "content": "hi"})),
        );
        let event = ChangeEvent::try_from(&raw).unwrap();
        match event {
            ChangeEvent::Message {
                op,
                record,
                previous,
            } => {
                assert_eq!(op, ChangeOp::Update);
                assert!(record.is_read);
                assert!(!previous.unwrap().is_read);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_decode_partial_old_row_drops_previous() {
        let raw = ChangeRecord::update(
            "threads",
            json!({"id": "t1", "title": "Renamed"}),
            Some(json!({"title": 5})),
        );
        let event = ChangeEvent::try_from(&raw).unwrap();
        assert!(matches!(event, ChangeEvent::Thread { previous: None, .. }));
    }

    #[test]
    fn test_decode_unknown_table() {
        let raw = ChangeRecord::insert("invoices", json!({"id": "i1"}));
        let err = ChangeEvent::try_from(&raw).unwrap_err();
        assert!(matches!(err, CoreError::UnknownTable { .. }));
    }

    #[test]
    fn test_decode_invalid_record() {
        let raw = ChangeRecord::insert("messages", json!({"id": "m1"}));
        let err = ChangeEvent::try_from(&raw).unwrap_err();
        assert!(matches!(err, CoreError::InvalidRecord { kind: "message", .. }));
    }

    #[test]
    fn test_filter_parse() {
        let filter = ChangeFilter::parse("messages", "thread_id=eq.t1").unwrap();
        assert_eq!(filter.column.as_deref(), Some("thread_id"));
        assert_eq!(filter.value.as_deref(), Some("t1"));
        assert_eq!(filter.expression().as_deref(), Some("thread_id=eq.t1"));

        assert!(ChangeFilter::parse("messages", "thread_id").is_err());
        assert!(ChangeFilter::parse("messages", "thread_id=gt.4").is_err());
        assert!(ChangeFilter::parse("messages", "=eq.t1").is_err());
    }

    #[test]
    fn test_filter_matches() {
        let filter = ChangeFilter::eq("messages", "thread_id", "t1");
        let hit = ChangeRecord::insert("messages", json!({"id": "m1", "thread_id": "t1"}));
        let other_thread = ChangeRecord::insert("messages", json!({"id": "m2", "thread_id": "t2"}));
        let other_table = ChangeRecord::insert("threads", json!({"id": "t1", "thread_id": "t1"}));
        let other_schema = hit.clone().with_schema("audit");

        assert!(filter.matches(&hit));
        assert!(!filter.matches(&other_thread));
        assert!(!filter.matches(&other_table));
        assert!(!filter.matches(&other_schema));
    }

    #[test]
    fn test_filter_matches_array_membership() {
        let filter = ChangeFilter::eq("threads", "participant_ids", "u2");
        let raw = ChangeRecord::insert("threads", json!({"id": "t1", "participant_ids": ["u1", "u2"]}));
        assert!(filter.matches(&raw));
    }

    #[test]
    fn test_filter_matches_delete_against_old_row() {
        let filter = ChangeFilter::eq("notifications", "user_id", "u1");
        let raw = ChangeRecord::delete("notifications", json!({"id": "n1", "user_id": "u1"}));
        assert!(filter.matches(&raw));
    }

    #[test]
    fn test_table_filter_matches_everything() {
        let filter = ChangeFilter::table("threads");
        let raw = ChangeRecord::insert("threads", json!({"id": "t9"}));
        assert!(filter.matches(&raw));
        assert!(filter.expression().is_none());
    }
}
