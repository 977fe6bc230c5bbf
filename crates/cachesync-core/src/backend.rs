//! Cache backend abstraction.
//!
//! Backends store opaque bytes under physical keys. They know nothing about
//! topics or versions; [`CacheService`](crate::CacheService) resolves those
//! through the active strategy before calling in.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CacheResult;

/// Uniform get/set/invalidate over an external key-value store.
///
/// Implementations must be safe for concurrent use from many tasks.
///
/// # TTL
///
/// `ttl_seconds <= 0` is backend-defined. Every backend shipped in this
/// workspace stores such entries without expiry.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short name for logging and health output.
    fn name(&self) -> &str;

    /// Fetch a value. A missing key is `Ok(None)`, never an error.
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Store a value with the given TTL.
    async fn set(&self, key: &str, value: &[u8], ttl_seconds: i64) -> CacheResult<()>;

    /// Remove a value. Removing an absent key succeeds.
    async fn invalidate(&self, key: &str) -> CacheResult<()>;

    /// Cheap connectivity check.
    async fn ping(&self) -> CacheResult<()> {
        Ok(())
    }
}

/// Type alias for a shareable cache backend.
pub type DynCacheBackend = Arc<dyn CacheBackend>;
