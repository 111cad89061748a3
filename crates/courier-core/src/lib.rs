pub mod change;
pub mod error;
pub mod events;
pub mod records;

pub use change::{ChangeEvent, ChangeFilter, ChangeOp, ChangeRecord, EntityKind};
pub use error::{CoreError, Result};
pub use events::{
    ConnectionChange, ErrorSource, EventBroadcaster, HandlerDispatcher, HandlerError,
    HandlerRegistry, PresenceEvent, RealtimeErrorEvent, RealtimeEvent, RealtimeHandler,
    TypingEvent,
};
pub use records::{MessageRecord, NotificationRecord, ReactionRecord, ReadReceiptRecord, ThreadRecord};
