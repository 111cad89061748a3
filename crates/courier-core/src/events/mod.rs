//! Typed realtime event bus.
//!
//! Every application-facing notification (new message, thread update,
//! typing, presence, connection change, error) is a [`RealtimeEvent`]
//! pushed through the [`EventBroadcaster`]. Consumers either read the
//! broadcast channel directly or register a [`RealtimeHandler`] with a
//! [`HandlerRegistry`] that a [`HandlerDispatcher`] drives.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                       Event Broadcaster                              │
//! │              (tokio::sync::broadcast channel)                        │
//! └─────────────────────────────────────────────────────────────────────┘
//!          │                    │                    │
//!          ▼                    ▼                    ▼
//!   HandlerDispatcher     raw subscriber        raw subscriber
//!          │
//!          ▼
//!   RealtimeHandler(s)  (sequential, timeout + panic isolation)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use courier_core::events::{EventBroadcaster, HandlerRegistry, HandlerDispatcher};
//!
//! let broadcaster = EventBroadcaster::new_shared();
//! let registry = Arc::new(HandlerRegistry::new());
//! registry.register(Arc::new(MyHandler)).await;
//!
//! tokio::spawn(HandlerDispatcher::new(registry.clone()).run(broadcaster.subscribe()));
//! ```

pub mod broadcaster;
pub mod handlers;
pub mod registry;
pub mod types;

pub use broadcaster::EventBroadcaster;
pub use handlers::{HandlerError, RealtimeHandler};
pub use registry::{HandlerDispatcher, HandlerRegistry};
pub use types::{
    ConnectionChange, ErrorSource, PresenceEvent, RealtimeErrorEvent, RealtimeEvent, TypingEvent,
};
