//! Two-tier caching for messages, threads and notifications.
//!
//! ## Architecture
//!
//! - **Local tier (DashMap)**: In-process, microsecond latency, capacity-bounded
//! - **Shared tier (Redis)**: Optional, network, shared across instances
//! - **Pub/Sub**: Cross-instance local-tier invalidation
//!
//! ## Cache Hierarchy
//!
//! ```text
//! get → Local (DashMap) → Shared (Redis) → absent
//!            ↓                 ↓
//!        <1µs latency     ~5ms latency, promoted into Local on hit
//! ```
//!
//! ## Graceful Degradation
//!
//! Shared-tier failures are logged and swallowed. If Redis is unavailable
//! or disabled the coordinator runs on the local tier alone.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod keys;
pub mod local;
pub mod pubsub;
pub mod redis_tier;
pub mod shared;

pub use config::{CacheConfig, RedisConfig, create_cache_coordinator};
pub use coordinator::{CacheCoordinator, CacheStats};
pub use error::CacheError;
pub use keys::{CacheKind, TtlPolicy};
pub use local::{CachedEntry, LocalTier};
pub use pubsub::{InvalidationListener, InvalidationMessage};
pub use redis_tier::RedisTier;
pub use shared::SharedTier;
