//! Redis adapters for cachesync.
//!
//! - [`RedisCache`]: [`CacheBackend`](cachesync_core::CacheBackend) over a
//!   deadpool connection pool
//! - [`RedisStreamBroker`]: [`EventBroker`](cachesync_core::EventBroker) over
//!   Redis Streams consumer groups

pub mod broker;
pub mod cache;
pub mod config;
pub mod pool;
mod source;

pub use broker::{RedisStreamBroker, StreamTopicWriter};
pub use cache::RedisCache;
pub use config::{RedisCacheConfig, StreamBrokerConfig, StreamReaderConfig};
pub use pool::mask_password;
pub use source::PAYLOAD_FIELD;
