//! Event listener: applies remote invalidations to the local view.

use std::sync::Arc;

use async_trait::async_trait;

use crate::broker::{EventBroker, InvalidationHandler, Subscription};
use crate::error::BrokerResult;
use crate::service::CacheService;

/// Standing subscription that invalidates `(topic, key)` for every event the
/// broker delivers.
///
/// ## Example Flow
///
/// ```text
/// Instance 1: service.invalidate("orders", "42") + broker.publish("orders", "42")
///   ↓
/// Broker: {"topic":"orders","key":"42"}
///   ↓
/// Instance 2: listener → service.invalidate("orders", "42")
/// ```
pub struct EventListener {
    broker: Arc<dyn EventBroker>,
    cache: Arc<CacheService>,
}

impl EventListener {
    pub fn new(broker: Arc<dyn EventBroker>, cache: Arc<CacheService>) -> Self {
        Self { broker, cache }
    }

    /// Start consuming. The returned subscription runs for the process
    /// lifetime; its `wait()` resolves only on cancellation or exhaustion.
    pub async fn start(&self) -> BrokerResult<Subscription> {
        let handler = Arc::new(LocalInvalidation {
            cache: Arc::clone(&self.cache),
        });
        let subscription = self.broker.subscribe(handler).await?;
        tracing::info!(broker = self.broker.name(), "event listener started");
        Ok(subscription)
    }
}

/// Best-effort local invalidation.
struct LocalInvalidation {
    cache: Arc<CacheService>,
}

#[async_trait]
impl InvalidationHandler for LocalInvalidation {
    fn name(&self) -> &str {
        "local_invalidation"
    }

    async fn handle(&self, topic: &str, key: &str) {
        match self.cache.invalidate(topic, key).await {
            Ok(()) => tracing::debug!(topic = %topic, key = %key, "remote invalidation applied"),
            Err(e) => tracing::warn!(
                topic = %topic,
                key = %key,
                error = %e,
                "remote invalidation failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CacheBackend;
    use crate::consumer::RetryPolicy;
    use crate::error::{CacheError, CacheResult};
    use crate::memory::{MemoryBroker, MemoryBus, MemoryCache};
    use crate::strategy::VersionedKeyStrategy;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Fails the first invalidation, then succeeds.
    struct FlakyBackend {
        inner: MemoryCache,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl CacheBackend for FlakyBackend {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &[u8], ttl_seconds: i64) -> CacheResult<()> {
            self.inner.set(key, value, ttl_seconds).await
        }

        async fn invalidate(&self, key: &str) -> CacheResult<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(CacheError::backend("DEL failed"));
            }
            self.inner.invalidate(key).await
        }
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_failed_local_invalidation_does_not_stop_listener() {
        let backend = Arc::new(FlakyBackend {
            inner: MemoryCache::new(),
            failures_left: AtomicU32::new(1),
        });
        let cache = Arc::new(CacheService::new(
            backend,
            Arc::new(VersionedKeyStrategy::new(":v", 1).unwrap()),
        ));
        cache.set("orders", "1", b"a", 60).await.unwrap();
        cache.set("orders", "2", b"b", 60).await.unwrap();

        let bus = MemoryBus::new();
        let broker: Arc<dyn EventBroker> =
            Arc::new(MemoryBroker::new(bus.clone(), Vec::new(), RetryPolicy::default()));
        let listener = EventListener::new(Arc::clone(&broker), Arc::clone(&cache));
        let subscription = listener.start().await.unwrap();
        let state = subscription.state();

        let publisher = MemoryBroker::new(bus, Vec::new(), RetryPolicy::default());
        publisher.publish("orders", "1").await.unwrap();
        publisher.publish("orders", "2").await.unwrap();

        eventually(|| {
            let state = Arc::clone(&state);
            async move { state.messages_handled() == 2 }
        })
        .await;

        // First invalidation failed and was discarded; the second went through.
        assert_eq!(cache.get("orders", "1").await.unwrap(), Some(b"a".to_vec()));
        assert_eq!(cache.get("orders", "2").await.unwrap(), None);
        assert_eq!(state.total_failures(), 0);
        assert!(!subscription.is_finished());
    }
}
