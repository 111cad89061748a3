//! Redis implementation of the shared cache tier.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::AsyncCommands;

use crate::error::CacheError;
use crate::pubsub::{InvalidationMessage, invalidation_channel};
use crate::shared::SharedTier;

/// Shared tier backed by a Redis connection pool.
///
/// Keys are stored as `{prefix}:{kind}:{id}`. Deletes and pattern
/// invalidations are published on `{prefix}:cache:invalidate` so every
/// instance's local tier drops the same keys.
#[derive(Clone)]
pub struct RedisTier {
    pool: Pool,
    prefix: String,
    channel: String,
}

impl RedisTier {
    pub fn new(pool: Pool, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let channel = invalidation_channel(&prefix);
        Self {
            pool,
            prefix,
            channel,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Channel invalidations are published on.
    pub fn invalidation_channel(&self) -> &str {
        &self.channel
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    #[inline]
    fn namespaced(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }

    fn strip_prefix<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
    }

    async fn publish(&self, message: InvalidationMessage) -> Result<(), CacheError> {
        let mut conn = self.pool.get().await?;
        conn.publish::<_, _, ()>(&self.channel, message.encode())
            .await?;
        tracing::debug!(channel = %self.channel, "published cache invalidation");
        Ok(())
    }
}

impl std::fmt::Debug for RedisTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTier")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SharedTier for RedisTier {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.pool.get().await?;
        let data = conn
            .get::<_, Option<Vec<u8>>>(self.namespaced(key))
            .await?;
        Ok(data)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.pool.get().await?;
        // SETEX rejects 0; round sub-second TTLs up.
        let ttl_secs = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(self.namespaced(key), value, ttl_secs)
            .await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let namespaced: Vec<String> = keys.iter().map(|k| self.namespaced(k)).collect();
        let removed = {
            let mut conn = self.pool.get().await?;
            conn.del::<_, u64>(namespaced).await?
        };

        for key in keys {
            if let Err(e) = self.publish(InvalidationMessage::Key(key.clone())).await {
                tracing::warn!(key = %key, error = %e, "Redis PUBLISH error");
            }
        }
        Ok(removed)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.pool.get().await?;
        let glob = format!("{}:*{}*", escape_glob(&self.prefix), escape_glob(pattern));
        let found: Vec<String> = conn.keys(glob).await?;
        Ok(found
            .iter()
            .filter_map(|k| self.strip_prefix(k))
            .map(str::to_string)
            .collect())
    }

    async fn announce_pattern(&self, pattern: &str) -> Result<(), CacheError> {
        self.publish(InvalidationMessage::Pattern(pattern.to_string()))
            .await
    }

    async fn is_available(&self) -> bool {
        match self.pool.get().await {
            Ok(mut conn) => {
                let pong: redis::RedisResult<String> =
                    redis::cmd("PING").query_async(&mut conn).await;
                pong.is_ok()
            }
            Err(_) => false,
        }
    }
}

/// Escape Redis glob metacharacters so a substring matches literally.
fn escape_glob(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
