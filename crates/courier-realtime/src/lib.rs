//! Realtime distribution for Courier.
//!
//! ## Architecture
//!
//! ```text
//!             ┌────────────────────── RealtimeService ──────────────────────┐
//! caller ───► │ ChannelRegistry ──► Transport (memory | redis)              │
//!             │      │  ▲                   │                              │
//!             │      │  └─ resubscribe ── ConnectionSupervisor (heartbeat,  │
//!             │      ▼                      monitor, backoff)              │
//!             │ ChannelRouter ─┬─► EventDispatcher ──► CacheCoordinator     │
//!             │                ├─► PresenceTracker                          │
//!             │                └─► TypingIndicatorBroker                    │
//!             │                         │                                   │
//!             │                  EventBroadcaster ──► RealtimeHandler(s)    │
//!             └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every change that reaches the dispatcher invalidates the cache before
//! the typed event is published, so a handler that re-reads through the
//! cache never sees the previous version.

pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod presence;
pub mod registry;
pub mod router;
pub mod service;
pub mod supervisor;
pub mod transport;
pub mod typing;

pub use channel::{Channel, ChannelKey, ChannelSpec, ChannelState};
pub use config::RealtimeConfig;
pub use dispatcher::EventDispatcher;
pub use error::{RealtimeError, Result, TransportError};
pub use presence::PresenceTracker;
pub use registry::{ChannelRegistry, ChannelSink};
pub use router::ChannelRouter;
pub use service::RealtimeService;
pub use supervisor::{
    ConnectionPhase, ConnectionState, ConnectionSupervisor, SupervisorSettings, backoff_delay,
};
pub use transport::{
    MemoryTransport, PresenceSignal, RedisTransport, RedisTransportBuilder, SubscriptionId,
    Transport, TransportMessage, TransportSubscription,
};
pub use typing::{TYPING_EVENT, TypingIndicatorBroker, TypingPayload};
