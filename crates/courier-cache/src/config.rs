//! Cache and Redis settings plus the coordinator factory.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::coordinator::CacheCoordinator;
use crate::keys::TtlPolicy;
use crate::local::LocalTier;
use crate::pubsub::InvalidationListener;
use crate::redis_tier::RedisTier;
use crate::shared::SharedTier;

/// Local-tier sizing and per-kind TTLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum entries held in the local tier
    #[serde(default = "default_local_capacity")]
    pub local_capacity: usize,

    #[serde(default = "default_message_ttl_secs")]
    pub message_ttl_secs: u64,

    #[serde(default = "default_thread_ttl_secs")]
    pub thread_ttl_secs: u64,

    #[serde(default = "default_thread_messages_ttl_secs")]
    pub thread_messages_ttl_secs: u64,

    #[serde(default = "default_user_notifications_ttl_secs")]
    pub user_notifications_ttl_secs: u64,
}

fn default_local_capacity() -> usize {
    1000
}

fn default_message_ttl_secs() -> u64 {
    300
}

fn default_thread_ttl_secs() -> u64 {
    600
}

fn default_thread_messages_ttl_secs() -> u64 {
    300
}

fn default_user_notifications_ttl_secs() -> u64 {
    180
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_capacity: default_local_capacity(),
            message_ttl_secs: default_message_ttl_secs(),
            thread_ttl_secs: default_thread_ttl_secs(),
            thread_messages_ttl_secs: default_thread_messages_ttl_secs(),
            user_notifications_ttl_secs: default_user_notifications_ttl_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl_policy(&self) -> TtlPolicy {
        TtlPolicy {
            message: Duration::from_secs(self.message_ttl_secs),
            thread: Duration::from_secs(self.thread_ttl_secs),
            thread_messages: Duration::from_secs(self.thread_messages_ttl_secs),
            user_notifications: Duration::from_secs(self.user_notifications_ttl_secs),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.local_capacity == 0 {
            return Err("cache.local_capacity must be > 0".into());
        }
        for (name, secs) in [
            ("message_ttl_secs", self.message_ttl_secs),
            ("thread_ttl_secs", self.thread_ttl_secs),
            ("thread_messages_ttl_secs", self.thread_messages_ttl_secs),
            ("user_notifications_ttl_secs", self.user_notifications_ttl_secs),
        ] {
            if secs == 0 {
                return Err(format!("cache.{name} must be > 0"));
            }
        }
        Ok(())
    }
}

/// Redis configuration for horizontal scaling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable Redis (gracefully degrades without it)
    /// Default: false (single-instance deployments)
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,

    /// Namespace for every key and channel this service touches
    #[serde(default = "default_redis_key_prefix")]
    pub key_prefix: String,
}

fn default_redis_enabled() -> bool {
    false
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

fn default_redis_key_prefix() -> String {
    "courier".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
            key_prefix: default_redis_key_prefix(),
        }
    }
}

impl RedisConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }
        if self.url.trim().is_empty() {
            return Err("redis.url must not be empty when redis is enabled".into());
        }
        if self.pool_size == 0 {
            return Err("redis.pool_size must be > 0".into());
        }
        if self.key_prefix.is_empty() || self.key_prefix.contains(char::is_whitespace) {
            return Err("redis.key_prefix must be non-empty and contain no whitespace".into());
        }
        Ok(())
    }

    /// Build a deadpool pool from these settings. Does not connect.
    pub fn create_pool(&self) -> Result<deadpool_redis::Pool, String> {
        let mut redis_config = deadpool_redis::Config::from_url(&self.url);
        let timeout = Some(Duration::from_millis(self.timeout_ms));
        let mut pool_config = deadpool_redis::PoolConfig::new(self.pool_size);
        pool_config.timeouts.wait = timeout;
        pool_config.timeouts.create = timeout;
        pool_config.timeouts.recycle = timeout;
        redis_config.pool = Some(pool_config);

        redis_config
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| e.to_string())
    }
}

/// Create a cache coordinator based on configuration.
///
/// ## Cache Modes
///
/// - **Redis disabled**: local tier only
/// - **Redis enabled**: local + Redis tiers, plus the invalidation listener;
///   falls back to local only if Redis is unreachable at startup
pub async fn create_cache_coordinator(cache: &CacheConfig, redis: &RedisConfig) -> CacheCoordinator {
    let local = Arc::new(LocalTier::new(cache.local_capacity));
    let ttl = cache.ttl_policy();

    if !redis.enabled {
        tracing::info!("Redis disabled, using local cache only");
        return CacheCoordinator::new(local, None, ttl);
    }

    tracing::info!(url = %redis.url, "Connecting to Redis");

    let pool = match redis.create_pool() {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to create Redis pool. Falling back to local cache."
            );
            return CacheCoordinator::new(local, None, ttl);
        }
    };

    // Test connection
    if let Err(e) = pool.get().await {
        tracing::warn!(
            error = %e,
            "Failed to connect to Redis. Falling back to local cache."
        );
        return CacheCoordinator::new(local, None, ttl);
    }
    tracing::info!("Connected to Redis");

    let shared: Arc<dyn SharedTier> = Arc::new(RedisTier::new(pool, redis.key_prefix.clone()));
    let coordinator = CacheCoordinator::new(Arc::clone(&local), Some(shared), ttl);

    InvalidationListener::new(redis.url.clone(), &redis.key_prefix, local)
        .start(coordinator.shutdown_token().child_token());

    coordinator
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cache = CacheConfig::default();
        assert_eq!(cache.local_capacity, 1000);
        assert_eq!(cache.ttl_policy(), TtlPolicy::default());
        assert!(cache.validate().is_ok());

        let redis = RedisConfig::default();
        assert!(!redis.enabled);
        assert_eq!(redis.key_prefix, "courier");
        assert!(redis.validate().is_ok());
    }

    #[test]
    fn test_partial_section_fills_defaults() {
        let cache: CacheConfig = serde_json::from_str(r#"{"local_capacity": 5}"#).unwrap();
        assert_eq!(cache.local_capacity, 5);
        assert_eq!(cache.thread_ttl_secs, 600);
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let cache = CacheConfig {
            local_capacity: 0,
            ..Default::default()
        };
        assert!(cache.validate().is_err());

        let cache = CacheConfig {
            message_ttl_secs: 0,
            ..Default::default()
        };
        let err = cache.validate().unwrap_err();
        assert!(err.contains("message_ttl_secs"));

        let redis = RedisConfig {
            enabled: true,
            key_prefix: "has space".into(),
            ..Default::default()
        };
        assert!(redis.validate().is_err());
    }

    #[tokio::test]
    async fn test_disabled_redis_gives_local_only() {
        let coordinator =
            create_cache_coordinator(&CacheConfig::default(), &RedisConfig::default()).await;
        assert!(!coordinator.has_shared_tier());
        assert_eq!(coordinator.local().capacity(), 1000);
    }
}
