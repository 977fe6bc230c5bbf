//! Redis-backed [`CacheBackend`].

use std::time::Duration;

use async_trait::async_trait;
use cachesync_core::{CacheBackend, CacheError, CacheResult};
use deadpool_redis::Pool;
use redis::AsyncCommands;
use tracing::{debug, info};

use crate::config::RedisCacheConfig;
use crate::pool::{build_pool, mask_password, ping, probe};

/// Shared cache in Redis.
///
/// Values are stored as raw bytes. A TTL of zero or less means the key never
/// expires; positive TTLs map to `SET key value EX ttl`.
#[derive(Clone)]
pub struct RedisCache {
    pool: Pool,
}

impl RedisCache {
    /// Wrap an existing pool.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build the pool and probe the server until it answers or the
    /// configured attempts run out.
    pub async fn connect(config: &RedisCacheConfig) -> CacheResult<Self> {
        let url = config.url();
        info!(url = %mask_password(&url), pool_size = config.pool_size, "connecting Redis cache");

        let pool = build_pool(
            &url,
            config.pool_size,
            Duration::from_millis(config.timeout_ms),
        )?;
        probe(
            &pool,
            &url,
            config.connect_attempts,
            Duration::from_millis(config.connect_backoff_ms),
            Duration::from_millis(config.timeout_ms),
        )
        .await?;

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn conn(&self) -> CacheResult<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::pool(e.to_string()))
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = conn
            .get(key)
            .await
            .map_err(|e| CacheError::backend(e.to_string()))?;
        debug!(key = %key, hit = value.is_some(), "cache get");
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl_seconds: i64) -> CacheResult<()> {
        let mut conn = self.conn().await?;
        if ttl_seconds > 0 {
            let _: () = conn
                .set_ex(key, value, ttl_seconds as u64)
                .await
                .map_err(|e| CacheError::backend(e.to_string()))?;
        } else {
            let _: () = conn
                .set(key, value)
                .await
                .map_err(|e| CacheError::backend(e.to_string()))?;
        }
        debug!(key = %key, ttl_seconds, "cache set");
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn
            .del(key)
            .await
            .map_err(|e| CacheError::backend(e.to_string()))?;
        debug!(key = %key, removed, "cache invalidate");
        Ok(())
    }

    async fn ping(&self) -> CacheResult<()> {
        ping(&self.pool).await
    }
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.pool.status();
        f.debug_struct("RedisCache")
            .field("max_size", &status.max_size)
            .field("size", &status.size)
            .field("available", &status.available)
            .finish()
    }
}
