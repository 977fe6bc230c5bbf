//! Distributed cache-invalidation coordination.
//!
//! ## Architecture
//!
//! ```text
//!              ┌──────────────────────────┐
//!  request ──► │       CacheService       │ ──► CacheBackend (Redis, memory)
//!              │ (strategy → physical key)│
//!              └──────────────────────────┘
//!                          ▲
//!                          │ invalidate(topic, key)
//!              ┌──────────────────────────┐
//!              │      EventListener       │ ◄── EventBroker (Redis Streams, memory)
//!              └──────────────────────────┘        ▲
//!                                                   │ publish(topic, key)
//!                                              peer instances
//! ```
//!
//! - [`strategy`]: logical `(topic, key)` → physical key, TTL policy
//! - [`backend`]: cache backend trait
//! - [`service`]: orchestration over strategy + backend
//! - [`broker`]: publish/subscribe trait, lazily created topic writers
//! - [`consumer`]: consumption loop with fixed-backoff retries
//! - [`listener`]: applies received invalidations locally
//! - [`memory`]: in-process backend and broker

pub mod backend;
pub mod broker;
pub mod consumer;
pub mod error;
pub mod event;
pub mod listener;
pub mod memory;
pub mod service;
pub mod strategy;

pub use backend::{CacheBackend, DynCacheBackend};
pub use broker::{
    DEFAULT_CHANNEL, DynEventBroker, EventBroker, InvalidationHandler, Subscription, TopicWriters,
    aggregate_close, default_channel,
};
pub use consumer::{ConsumerState, EventSource, RetryPolicy, run_consumer, spawn_consumer};
pub use error::{BrokerError, BrokerResult, CacheError, CacheResult, StrategyError};
pub use event::InvalidationEvent;
pub use listener::EventListener;
pub use memory::{MemoryBroker, MemoryBus, MemoryCache};
pub use service::CacheService;
pub use strategy::{InvalidationStrategy, TtlPolicy, VersionedKeyStrategy};
