//! Builds the configured backend, strategy and broker.

use std::sync::Arc;

use cachesync_core::{
    BrokerError, CacheError, CacheService, DynCacheBackend, DynEventBroker, InvalidationStrategy,
    MemoryBroker, MemoryBus, MemoryCache, StrategyError, TtlPolicy, VersionedKeyStrategy,
};
use cachesync_redis::{RedisCache, RedisStreamBroker};
use thiserror::Error;
use tracing::info;

use crate::config::{
    AppConfig, BrokerType, CacheConfig, CacheType, EventBrokerConfig, InvalidationConfig,
    StrategyType,
};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("cache backend: {0}")]
    Cache(#[from] CacheError),
    #[error("invalidation strategy: {0}")]
    Strategy(#[from] StrategyError),
    #[error("event broker: {0}")]
    Broker(#[from] BrokerError),
}

/// Everything the HTTP layer and the listener share.
#[derive(Clone)]
pub struct Components {
    pub cache: Arc<CacheService>,
    pub broker: DynEventBroker,
}

pub fn build_strategy(
    config: &InvalidationConfig,
) -> Result<Arc<dyn InvalidationStrategy>, StrategyError> {
    let policy = match config.strategy {
        StrategyType::VersionedKey => TtlPolicy::Passthrough,
        StrategyType::TtlAware => TtlPolicy::Clamp {
            max: config.ttl_aware.max_ttl_seconds,
            default: config.ttl_aware.default_ttl_seconds,
        },
    };
    let strategy = VersionedKeyStrategy::with_ttl_policy(
        config.versioned.delimiter.clone(),
        config.versioned.default_version,
        policy,
    )?;
    info!(
        strategy = strategy.name(),
        version = strategy.version(),
        "invalidation strategy ready"
    );
    Ok(Arc::new(strategy))
}

/// Redis probes with bounded retries; an exhausted probe is returned as
/// [`CacheError::Unavailable`].
pub async fn build_cache_backend(config: &CacheConfig) -> Result<DynCacheBackend, CacheError> {
    let backend: DynCacheBackend = match config.backend {
        CacheType::Redis => Arc::new(RedisCache::connect(&config.redis).await?),
        CacheType::Memory => Arc::new(MemoryCache::new()),
    };
    info!(backend = backend.name(), "cache backend ready");
    Ok(backend)
}

/// `bus` is only used by the in-process broker.
pub async fn build_event_broker(
    config: &EventBrokerConfig,
    bus: &MemoryBus,
) -> Result<DynEventBroker, BrokerError> {
    let policy = config.consumer.retry_policy();
    let broker: DynEventBroker = match config.broker {
        BrokerType::RedisStreams => {
            Arc::new(RedisStreamBroker::connect(config.redis.clone(), policy).await?)
        }
        BrokerType::Memory => Arc::new(MemoryBroker::new(
            bus.clone(),
            config.memory_topics.clone(),
            policy,
        )),
    };
    info!(broker = broker.name(), "event broker ready");
    Ok(broker)
}

pub async fn build_components(
    config: &AppConfig,
    bus: &MemoryBus,
) -> Result<Components, BootstrapError> {
    let strategy = build_strategy(&config.invalidation)?;
    let backend = build_cache_backend(&config.cache).await?;
    let broker = build_event_broker(&config.event_broker, bus).await?;

    Ok(Components {
        cache: Arc::new(CacheService::new(backend, strategy)),
        broker,
    })
}
