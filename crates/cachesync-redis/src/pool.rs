//! Redis connection pool setup and startup probing.

use std::time::Duration;

use cachesync_core::{CacheError, CacheResult};
use deadpool_redis::{Config, Pool, Runtime};
use tracing::{debug, info, instrument, warn};

/// Build a pool from a URL without touching the network.
pub fn build_pool(url: &str, max_size: usize, timeout: Duration) -> CacheResult<Pool> {
    let mut config = Config::from_url(url);
    if let Some(ref mut pool_config) = config.pool {
        pool_config.max_size = max_size;
        pool_config.timeouts.wait = Some(timeout);
        pool_config.timeouts.create = Some(timeout);
        pool_config.timeouts.recycle = Some(timeout);
    } else {
        let mut pool_config = deadpool_redis::PoolConfig::new(max_size);
        pool_config.timeouts.wait = Some(timeout);
        pool_config.timeouts.create = Some(timeout);
        pool_config.timeouts.recycle = Some(timeout);
        config.pool = Some(pool_config);
    }

    config
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| CacheError::pool(e.to_string()))
}

/// Single PING through the pool.
pub async fn ping(pool: &Pool) -> CacheResult<()> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| CacheError::pool(e.to_string()))?;
    let _: String = redis::cmd("PING")
        .query_async(&mut *conn)
        .await
        .map_err(|e| CacheError::backend(e.to_string()))?;
    Ok(())
}

/// PING bounded by `timeout`.
pub async fn ping_within(pool: &Pool, timeout: Duration) -> CacheResult<()> {
    match tokio::time::timeout(timeout, ping(pool)).await {
        Ok(result) => result,
        Err(_) => Err(CacheError::Timeout(timeout.as_millis() as u64)),
    }
}

/// Probe the server up to `attempts` times, pausing `backoff` between tries.
/// Each attempt is cut off after `attempt_timeout`.
///
/// Returns [`CacheError::Unavailable`] carrying the last error once every
/// attempt failed.
#[instrument(skip(pool, url), fields(url = %mask_password(url)))]
pub async fn probe(
    pool: &Pool,
    url: &str,
    attempts: u32,
    backoff: Duration,
    attempt_timeout: Duration,
) -> CacheResult<()> {
    let attempts = attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match ping_within(pool, attempt_timeout).await {
            Ok(()) => {
                info!(attempt, "connected to Redis");
                return Ok(());
            }
            Err(e) => {
                warn!(attempt, max = attempts, error = %e, "Redis connection attempt failed");
                last_error = e.to_string();
                if attempt < attempts {
                    debug!(backoff_ms = backoff.as_millis() as u64, "retrying Redis connection");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    Err(CacheError::Unavailable {
        attempts,
        last_error,
    })
}

/// Mask the password in a connection URL for logging.
pub fn mask_password(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let rest = &url[scheme_end + 3..];
    let Some(at_pos) = rest.rfind('@') else {
        return url.to_string();
    };

    let credentials = &rest[..at_pos];
    let masked = match credentials.find(':') {
        Some(colon) => format!("{}:****", &credentials[..colon]),
        None => credentials.to_string(),
    };
    format!("{}{}{}", &url[..scheme_end + 3], masked, &rest[at_pos..])
}
