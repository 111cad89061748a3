//! Pluggable shared (second) cache tier.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::CacheError;

/// External key/value store reachable over the network.
///
/// Every call may fail independently of the local process; the
/// coordinator logs and swallows those failures. Keys passed in are the
/// unprefixed `{kind}:{id}` form; namespacing is up to the implementation.
#[async_trait]
pub trait SharedTier: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Store with a TTL; the backend expires the key on its own.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError>;

    /// List held keys containing `pattern` as a substring.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError>;

    /// Called after a pattern invalidation so peers can mirror it.
    async fn announce_pattern(&self, _pattern: &str) -> Result<(), CacheError> {
        Ok(())
    }

    /// Health probe.
    async fn is_available(&self) -> bool;
}
