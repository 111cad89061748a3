//! Read-through / write-through coordination of the two cache tiers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use courier_core::{MessageRecord, NotificationRecord, ThreadRecord};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::keys::{CacheKind, TtlPolicy};
use crate::local::LocalTier;
use crate::shared::SharedTier;

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries currently held in the local tier
    pub size: usize,
    /// Approximate bytes held in the local tier
    pub memory_usage: usize,
    /// Local-tier evictions due to capacity
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Single entry point for cache reads, writes and invalidations.
///
/// ## Lookup Order
///
/// 1. Local tier (a hit on a live entry returns immediately)
/// 2. Shared tier, if configured (a hit is promoted into the local tier)
/// 3. Absent
///
/// ## Write Strategy
///
/// Writes always land in the local tier. Shared-tier writes are spawned and
/// never awaited; their failures are logged. Deletes and pattern
/// invalidations do await the shared tier (errors still swallowed) so a
/// read issued right after cannot promote the stale shared copy back.
pub struct CacheCoordinator {
    local: Arc<LocalTier>,
    shared: Option<Arc<dyn SharedTier>>,
    ttl: TtlPolicy,
    hits: AtomicU64,
    misses: AtomicU64,
    shutdown: CancellationToken,
}

impl CacheCoordinator {
    pub fn new(local: Arc<LocalTier>, shared: Option<Arc<dyn SharedTier>>, ttl: TtlPolicy) -> Self {
        Self {
            local,
            shared,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Local tier only.
    pub fn local_only(capacity: usize, ttl: TtlPolicy) -> Self {
        Self::new(Arc::new(LocalTier::new(capacity)), None, ttl)
    }

    pub fn local(&self) -> &Arc<LocalTier> {
        &self.local
    }

    pub fn has_shared_tier(&self) -> bool {
        self.shared.is_some()
    }

    pub fn ttl_policy(&self) -> &TtlPolicy {
        &self.ttl
    }

    /// Token cancelled by [`close`](Self::close); background tasks tied to
    /// this cache listen on child tokens of it.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Raw lookup returning the encoded payload.
    pub async fn get_raw(&self, kind: CacheKind, id: &str) -> Option<Arc<Vec<u8>>> {
        let key = kind.key(id);

        if let Some(data) = self.local.get(&key) {
            tracing::debug!(key = %key, "cache hit (local)");
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(data);
        }

        if let Some(shared) = &self.shared {
            match shared.get(&key).await {
                Ok(Some(data)) => {
                    tracing::debug!(key = %key, tier = shared.name(), "cache hit (shared)");
                    let data = Arc::new(data);
                    self.local
                        .insert(key, Arc::clone(&data), self.ttl.for_kind(kind));
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(data);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(key = %key, tier = shared.name(), error = %e, "shared cache GET error");
                }
            }
        }

        tracing::debug!(key = %key, "cache miss");
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Typed lookup. A payload that no longer decodes is dropped and
    /// reported as absent.
    pub async fn get<T: DeserializeOwned>(&self, kind: CacheKind, id: &str) -> Option<T> {
        let data = self.get_raw(kind, id).await?;
        match rmp_serde::from_slice::<T>(&data) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(kind = %kind, id = %id, error = %e, "Failed to decode cached value");
                self.delete(kind, id).await;
                None
            }
        }
    }

    /// Store a value. `ttl` overrides the per-kind policy.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        kind: CacheKind,
        id: &str,
        value: &T,
        ttl: Option<Duration>,
    ) {
        let key = kind.key(id);
        let data = match rmp_serde::to_vec_named(value) {
            Ok(data) => Arc::new(data),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to encode value for cache");
                return;
            }
        };
        let ttl = ttl.unwrap_or_else(|| self.ttl.for_kind(kind));

        self.local.insert(key.clone(), Arc::clone(&data), ttl);

        if let Some(shared) = &self.shared {
            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                match shared.set(&key, &data, ttl).await {
                    Ok(()) => {
                        tracing::debug!(key = %key, ttl_secs = ttl.as_secs(), "cache set (local+shared)");
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, tier = shared.name(), error = %e, "shared cache SET error");
                    }
                }
            });
        }
    }

    /// Remove one key from both tiers.
    pub async fn delete(&self, kind: CacheKind, id: &str) {
        let key = kind.key(id);
        self.local.remove(&key);

        if let Some(shared) = &self.shared {
            if let Err(e) = shared.delete(std::slice::from_ref(&key)).await {
                tracing::warn!(key = %key, tier = shared.name(), error = %e, "shared cache DEL error");
            }
        }
        tracing::debug!(key = %key, "cache invalidated");
    }

    /// Remove every key containing `pattern` from both tiers. Returns the
    /// number of local entries dropped.
    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        let removed = self.local.remove_matching(pattern);

        if let Some(shared) = &self.shared {
            match shared.keys(pattern).await {
                Ok(keys) if !keys.is_empty() => {
                    if let Err(e) = shared.delete(&keys).await {
                        tracing::warn!(pattern = %pattern, tier = shared.name(), error = %e, "shared cache DEL error");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(pattern = %pattern, tier = shared.name(), error = %e, "shared cache KEYS error");
                }
            }
            if let Err(e) = shared.announce_pattern(pattern).await {
                tracing::warn!(pattern = %pattern, error = %e, "failed to announce pattern invalidation");
            }
        }
        tracing::debug!(pattern = %pattern, removed, "cache pattern invalidated");
        removed
    }

    // ------------------------------------------------------------------
    // Entity helpers
    // ------------------------------------------------------------------

    pub async fn get_message(&self, message_id: &str) -> Option<MessageRecord> {
        self.get(CacheKind::Message, message_id).await
    }

    pub async fn set_message(&self, message: &MessageRecord) {
        self.set(CacheKind::Message, &message.id, message, None).await;
    }

    pub async fn get_thread(&self, thread_id: &str) -> Option<ThreadRecord> {
        self.get(CacheKind::Thread, thread_id).await
    }

    pub async fn set_thread(&self, thread: &ThreadRecord) {
        self.set(CacheKind::Thread, &thread.id, thread, None).await;
    }

    pub async fn get_thread_messages(&self, thread_id: &str) -> Option<Vec<MessageRecord>> {
        self.get(CacheKind::ThreadMessages, thread_id).await
    }

    pub async fn set_thread_messages(&self, thread_id: &str, messages: &[MessageRecord]) {
        self.set(CacheKind::ThreadMessages, thread_id, messages, None)
            .await;
    }

    pub async fn get_user_notifications(&self, user_id: &str) -> Option<Vec<NotificationRecord>> {
        self.get(CacheKind::UserNotifications, user_id).await
    }

    pub async fn set_user_notifications(&self, user_id: &str, notifications: &[NotificationRecord]) {
        self.set(CacheKind::UserNotifications, user_id, notifications, None)
            .await;
    }

    pub async fn invalidate_message(&self, message_id: &str) {
        self.delete(CacheKind::Message, message_id).await;
    }

    /// Drop a thread and every cached message list of it.
    pub async fn invalidate_thread(&self, thread_id: &str) {
        self.delete(CacheKind::Thread, thread_id).await;
        self.invalidate_thread_messages(thread_id).await;
    }

    /// Pattern-based, so paginated list keys (`thread_messages:{id}:...`) go too.
    pub async fn invalidate_thread_messages(&self, thread_id: &str) -> usize {
        self.invalidate_pattern(&CacheKind::ThreadMessages.key(thread_id))
            .await
    }

    pub async fn invalidate_user_notifications(&self, user_id: &str) -> usize {
        self.invalidate_pattern(&CacheKind::UserNotifications.key(user_id))
            .await
    }

    // ------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.local.len(),
            memory_usage: self.local.memory_usage(),
            evictions: self.local.evictions(),
        }
    }

    /// Empty the local tier and reset counters. The shared tier keeps its
    /// entries; they expire on their own TTL.
    pub fn clear(&self) {
        self.local.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// Check if the shared tier answers (for health checks).
    pub async fn is_shared_available(&self) -> bool {
        match &self.shared {
            Some(shared) => shared.is_available().await,
            None => false,
        }
    }

    /// Stop background tasks tied to this cache.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for CacheCoordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for CacheCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("local_entries", &self.local.len())
            .field("shared", &self.shared.as_ref().map(|s| s.name().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Text {
        text: String,
    }

    fn hi() -> Text {
        Text { text: "hi".into() }
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip_and_expiry() {
        let cache = CacheCoordinator::local_only(100, TtlPolicy::default());
        cache
            .set(CacheKind::Message, "m1", &hi(), Some(Duration::from_secs(5)))
            .await;

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(cache.get::<Text>(CacheKind::Message, "m1").await, Some(hi()));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get::<Text>(CacheKind::Message, "m1").await, None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < 0.001);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_ttl_comes_from_policy() {
        let cache = CacheCoordinator::local_only(100, TtlPolicy::default());
        cache
            .set_user_notifications("u1", &[])
            .await;

        tokio::time::advance(Duration::from_secs(179)).await;
        assert!(cache.get_user_notifications("u1").await.is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get_user_notifications("u1").await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_thread_drops_thread_and_lists() {
        let cache = CacheCoordinator::local_only(100, TtlPolicy::default());
        let thread = ThreadRecord {
            id: "t1".into(),
            title: Some("Quote 42".into()),
            participant_ids: vec!["u1".into()],
            message_ids: vec![],
            last_activity_at: None,
        };
        cache.set_thread(&thread).await;
        cache.set_thread_messages("t1", &[]).await;
        cache
            .set(CacheKind::ThreadMessages, "t1:page2", &Vec::<MessageRecord>::new(), None)
            .await;
        cache.set_thread_messages("t2", &[]).await;

        cache.invalidate_thread("t1").await;

        assert!(cache.get_thread("t1").await.is_none());
        assert!(cache.get_thread_messages("t1").await.is_none());
        assert!(cache.get_thread_messages("t2").await.is_some());
        assert_eq!(cache.stats().size, 1);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_dropped() {
        let cache = CacheCoordinator::local_only(100, TtlPolicy::default());
        cache.set(CacheKind::Message, "m1", &42u32, None).await;

        assert!(cache.get_message("m1").await.is_none());
        assert_eq!(cache.stats().size, 0);
    }

    #[tokio::test]
    async fn test_clear_resets_counters() {
        let cache = CacheCoordinator::local_only(100, TtlPolicy::default());
        cache.set(CacheKind::Thread, "t1", &hi(), None).await;
        let _ = cache.get::<Text>(CacheKind::Thread, "t1").await;
        let _ = cache.get::<Text>(CacheKind::Thread, "t2").await;

        cache.clear();

        assert_eq!(cache.stats(), CacheStats::default());
        assert!(!cache.is_shared_available().await);
    }
}
