//! Cache orchestration service.

use std::sync::Arc;

use crate::backend::CacheBackend;
use crate::error::CacheResult;
use crate::strategy::InvalidationStrategy;

/// Single entry point for cache reads, writes and invalidations.
///
/// Every call resolves the physical key through the strategy and goes
/// straight to the backend. The service holds no cache state, never retries
/// and never publishes: broadcasting an invalidation to peers is the
/// caller's job (see [`EventBroker::publish`](crate::EventBroker::publish)).
#[derive(Clone)]
pub struct CacheService {
    backend: Arc<dyn CacheBackend>,
    strategy: Arc<dyn InvalidationStrategy>,
}

impl CacheService {
    pub fn new(backend: Arc<dyn CacheBackend>, strategy: Arc<dyn InvalidationStrategy>) -> Self {
        Self { backend, strategy }
    }

    /// Physical key the backend sees for `(topic, key)`.
    pub fn physical_key(&self, topic: &str, key: &str) -> String {
        self.strategy.generate_key(topic, key)
    }

    /// `Ok(None)` on a miss.
    pub async fn get(&self, topic: &str, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let physical = self.physical_key(topic, key);
        self.backend.get(&physical).await
    }

    pub async fn set(
        &self,
        topic: &str,
        key: &str,
        value: &[u8],
        ttl_seconds: i64,
    ) -> CacheResult<()> {
        let physical = self.physical_key(topic, key);
        let ttl = self.strategy.compute_ttl(ttl_seconds);
        self.backend.set(&physical, value, ttl).await
    }

    pub async fn invalidate(&self, topic: &str, key: &str) -> CacheResult<()> {
        let physical = self.physical_key(topic, key);
        self.backend.invalidate(&physical).await
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn strategy(&self) -> &Arc<dyn InvalidationStrategy> {
        &self.strategy
    }
}

impl std::fmt::Debug for CacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheService")
            .field("backend", &self.backend.name())
            .field("strategy", &self.strategy.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use crate::memory::MemoryCache;
    use crate::strategy::{TtlPolicy, VersionedKeyStrategy};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every call, stores nothing.
    #[derive(Default)]
    struct RecordingBackend {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl CacheBackend for RecordingBackend {
        fn name(&self) -> &str {
            "recording"
        }

        async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
            self.calls.lock().unwrap().push(format!("get {key}"));
            if self.fail {
                return Err(CacheError::backend("connection refused"));
            }
            Ok(None)
        }

        async fn set(&self, key: &str, _value: &[u8], ttl_seconds: i64) -> CacheResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("set {key} ttl={ttl_seconds}"));
            Ok(())
        }

        async fn invalidate(&self, key: &str) -> CacheResult<()> {
            self.calls.lock().unwrap().push(format!("del {key}"));
            Ok(())
        }
    }

    /// Fixed keys and doubled TTLs.
    struct FakeStrategy;

    impl InvalidationStrategy for FakeStrategy {
        fn name(&self) -> &str {
            "fake"
        }

        fn generate_key(&self, topic: &str, key: &str) -> String {
            format!("{topic}/{key}")
        }

        fn compute_ttl(&self, requested_ttl: i64) -> i64 {
            requested_ttl * 2
        }
    }

    fn memory_service(version: u64, cache: MemoryCache) -> CacheService {
        CacheService::new(
            Arc::new(cache),
            Arc::new(VersionedKeyStrategy::new(":v", version).unwrap()),
        )
    }

    #[tokio::test]
    async fn test_delegates_through_strategy() {
        let backend = Arc::new(RecordingBackend::default());
        let service = CacheService::new(backend.clone(), Arc::new(FakeStrategy));

        service.set("orders", "42", b"shipped", 30).await.unwrap();
        service.get("orders", "42").await.unwrap();
        service.invalidate("orders", "42").await.unwrap();

        assert_eq!(
            *backend.calls.lock().unwrap(),
            vec![
                "set orders/42 ttl=60".to_string(),
                "get orders/42".to_string(),
                "del orders/42".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_backend_failure_is_surfaced_without_retry() {
        let backend = Arc::new(RecordingBackend {
            fail: true,
            ..Default::default()
        });
        let service = CacheService::new(backend.clone(), Arc::new(FakeStrategy));

        assert!(matches!(
            service.get("orders", "42").await,
            Err(CacheError::Backend(_))
        ));
        assert_eq!(backend.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_set_then_get_round_trip() {
        let service = memory_service(1, MemoryCache::new());
        service.set("orders", "42", b"shipped", 60).await.unwrap();
        assert_eq!(
            service.get("orders", "42").await.unwrap(),
            Some(b"shipped".to_vec())
        );
    }

    #[tokio::test]
    async fn test_miss_is_not_an_error() {
        let service = memory_service(1, MemoryCache::new());
        assert_eq!(service.get("orders", "missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalidate_is_idempotent() {
        let service = memory_service(1, MemoryCache::new());
        service.set("orders", "42", b"shipped", 60).await.unwrap();

        service.invalidate("orders", "42").await.unwrap();
        service.invalidate("orders", "42").await.unwrap();
        assert_eq!(service.get("orders", "42").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_version_bump_misses_old_entries() {
        let cache = MemoryCache::new();
        let v1 = memory_service(1, cache.clone());
        let v2 = memory_service(2, cache.clone());

        v1.set("orders", "42", b"shipped", 60).await.unwrap();
        assert_ne!(v1.physical_key("orders", "42"), v2.physical_key("orders", "42"));

        assert_eq!(v2.get("orders", "42").await.unwrap(), None);
        // The old generation is untouched in the backend.
        assert!(cache.contains_key(&v1.physical_key("orders", "42")));
    }

    #[tokio::test]
    async fn test_ttl_policy_applies_to_writes() {
        let backend = Arc::new(RecordingBackend::default());
        let strategy = VersionedKeyStrategy::with_ttl_policy(
            ":v",
            1,
            TtlPolicy::Clamp {
                max: 100,
                default: 10,
            },
        )
        .unwrap();
        let service = CacheService::new(backend.clone(), Arc::new(strategy));

        service.set("t", "k", b"x", 500).await.unwrap();
        service.set("t", "k", b"x", 0).await.unwrap();

        assert_eq!(
            *backend.calls.lock().unwrap(),
            vec!["set t:k:v1 ttl=100".to_string(), "set t:k:v1 ttl=10".to_string()]
        );
    }
}
