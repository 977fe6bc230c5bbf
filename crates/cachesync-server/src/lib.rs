//! HTTP front end and process wiring for cachesync.
//!
//! - [`config`]: TOML + environment configuration with validation
//! - [`bootstrap`]: builds the configured backend, strategy and broker
//! - [`server`]: axum router over [`CacheService`](cachesync_core::CacheService)
//! - [`observability`]: tracing subscriber setup

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod observability;
pub mod server;

pub use bootstrap::{BootstrapError, Components, build_components};
pub use config::AppConfig;
pub use error::ApiError;
pub use observability::shutdown_tracing;
pub use server::{AppState, CachesyncServer, ServerBuilder, build_app};
