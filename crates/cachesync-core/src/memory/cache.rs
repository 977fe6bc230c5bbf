//! Process-local cache backend on top of `DashMap`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::backend::CacheBackend;
use crate::error::CacheResult;

/// A cached entry with optional expiry.
///
/// The data is wrapped in `Arc` so hits clone a pointer, not the bytes.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    pub data: Arc<Vec<u8>>,
    pub cached_at: Instant,
    pub ttl: Option<Duration>,
}

impl CachedEntry {
    /// Entries with a non-positive TTL never expire.
    pub fn new(data: Vec<u8>, ttl_seconds: i64) -> Self {
        let ttl = u64::try_from(ttl_seconds)
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        Self {
            data: Arc::new(data),
            cached_at: Instant::now(),
            ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.ttl
            .is_some_and(|ttl| self.cached_at.elapsed() >= ttl)
    }
}

/// In-memory backend for single-instance deployments and tests.
///
/// Expired entries are dropped lazily on read. `ttl_seconds <= 0` stores the
/// entry without expiry.
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<DashMap<String, CachedEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired())
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        before.saturating_sub(self.entries.len())
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                tracing::debug!(key = %key, "cache hit");
                return Ok(Some(entry.data.as_ref().clone()));
            }
            // Release the shard guard before removing.
            drop(entry);
            self.entries.remove(key);
        }
        tracing::debug!(key = %key, "cache miss");
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl_seconds: i64) -> CacheResult<()> {
        self.entries
            .insert(key.to_string(), CachedEntry::new(value.to_vec(), ttl_seconds));
        tracing::debug!(key = %key, ttl_secs = ttl_seconds, "cache set");
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> CacheResult<()> {
        self.entries.remove(key);
        tracing::debug!(key = %key, "cache invalidated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set_invalidate() {
        let cache = MemoryCache::new();
        assert_eq!(cache.get("k").await.unwrap(), None);

        cache.set("k", b"v", 60).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(b"v".to_vec()));

        cache.invalidate("k").await.unwrap();
        cache.invalidate("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[test]
    fn test_non_positive_ttl_never_expires() {
        assert_eq!(CachedEntry::new(vec![], 0).ttl, None);
        assert_eq!(CachedEntry::new(vec![], -10).ttl, None);
        assert_eq!(
            CachedEntry::new(vec![], 5).ttl,
            Some(Duration::from_secs(5))
        );
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = MemoryCache::new();
        cache.set("k", b"v", 60).await.unwrap();
        cache.entries.alter("k", |_, mut entry| {
            entry.ttl = Some(Duration::ZERO);
            entry
        });

        assert!(!cache.contains_key("k"));
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let cache = MemoryCache::new();
        cache.set("keep", b"1", 0).await.unwrap();
        cache.set("drop", b"2", 60).await.unwrap();
        cache.entries.alter("drop", |_, mut entry| {
            entry.ttl = Some(Duration::ZERO);
            entry
        });

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains_key("keep"));
    }
}
