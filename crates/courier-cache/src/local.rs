//! In-process cache tier.
//!
//! Entries carry their own TTL and are treated as absent once expired, no
//! matter when the sweep runs. Capacity is enforced after every write by
//! dropping the oldest entries by insertion time (not LRU).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// A cached entry with TTL support.
///
/// The data is wrapped in `Arc` so hits hand out a cheap clone.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    pub data: Arc<Vec<u8>>,
    pub cached_at: Instant,
    pub ttl: Duration,
    /// Insertion order, breaks ties between entries cached at the same instant
    seq: u64,
}

impl CachedEntry {
    fn new(data: Arc<Vec<u8>>, ttl: Duration, seq: u64) -> Self {
        Self {
            data,
            cached_at: Instant::now(),
            ttl,
            seq,
        }
    }

    /// Check if this entry has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.cached_at) > self.ttl
    }
}

/// Capacity-bounded in-memory tier keyed by `{kind}:{id}` strings.
#[derive(Debug)]
pub struct LocalTier {
    entries: DashMap<String, CachedEntry>,
    capacity: usize,
    next_seq: AtomicU64,
    evictions: AtomicU64,
}

impl LocalTier {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
            next_seq: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Look up a live entry. Expired entries are removed on the way.
    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let entry = self.entries.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired());
            return None;
        }
        Some(Arc::clone(&entry.data))
    }

    /// Store a value and run the eviction sweep.
    pub fn insert(&self, key: impl Into<String>, data: Arc<Vec<u8>>, ttl: Duration) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.entries
            .insert(key.into(), CachedEntry::new(data, ttl, seq));
        self.sweep();
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every key containing `pattern`. Linear in the number of held
    /// keys, which the capacity bound keeps small.
    pub fn remove_matching(&self, pattern: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.contains(pattern));
        before.saturating_sub(self.entries.len())
    }

    /// Drop expired entries, then the oldest survivors until at or under
    /// capacity. Returns how many entries were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired_at(now));
        let mut dropped = before.saturating_sub(self.entries.len());

        let len = self.entries.len();
        if len > self.capacity {
            let mut by_age: Vec<(Instant, u64, String)> = self
                .entries
                .iter()
                .map(|e| (e.cached_at, e.seq, e.key().clone()))
                .collect();
            by_age.sort_unstable_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

            let excess = len - self.capacity;
            for (_, _, key) in by_age.into_iter().take(excess) {
                if self.entries.remove(&key).is_some() {
                    dropped += 1;
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
            tracing::debug!(excess, capacity = self.capacity, "local cache over capacity, evicted oldest");
        }
        dropped
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Approximate bytes held: keys plus payloads.
    pub fn memory_usage(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.key().len() + e.data.len())
            .sum()
    }

    /// Entries evicted for capacity since creation.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Snapshot of held keys, expired ones included until swept.
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
