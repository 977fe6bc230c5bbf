//! In-process cache backend and broker.
//!
//! Used for single-instance deployments and for exercising the full
//! invalidation path in tests without external services.

pub mod broker;
pub mod cache;

pub use broker::{MemoryBroker, MemoryBus, MemoryTopicWriter};
pub use cache::{CachedEntry, MemoryCache};
