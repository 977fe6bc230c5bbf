use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use cachesync_core::RetryPolicy;
use cachesync_core::consumer::{DEFAULT_MAX_CONSECUTIVE_FAILURES, DEFAULT_RETRY_BACKOFF};
use cachesync_redis::{RedisCacheConfig, StreamBrokerConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub event_broker: EventBrokerConfig,
    #[serde(default)]
    pub invalidation: InvalidationConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Server
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.server.body_limit_bytes == 0 {
            return Err("server.body_limit_bytes must be > 0".into());
        }
        // Logging
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        // Cache
        if self.cache.backend == CacheType::Redis {
            let redis = &self.cache.redis;
            if redis.address.is_empty() {
                return Err("cache.redis.address must not be empty".into());
            }
            if redis.pool_size == 0 {
                return Err("cache.redis.pool_size must be > 0".into());
            }
            if redis.connect_attempts == 0 {
                return Err("cache.redis.connect_attempts must be > 0".into());
            }
        }
        // Broker
        if self.event_broker.consumer.max_consecutive_failures == 0 {
            return Err("event_broker.consumer.max_consecutive_failures must be > 0".into());
        }
        if self.event_broker.topics().iter().any(|t| t.trim().is_empty()) {
            return Err("event_broker topic names must not be empty".into());
        }
        if self.event_broker.broker == BrokerType::RedisStreams {
            let redis = &self.event_broker.redis;
            if redis.url.is_empty() {
                return Err("event_broker.redis.url must not be empty".into());
            }
            if redis.group_id.is_empty() {
                return Err("event_broker.redis.group_id must not be empty".into());
            }
            if redis.reader.batch_size == 0 {
                return Err("event_broker.redis.reader.batch_size must be > 0".into());
            }
            // BLOCK 0 waits forever on an idle stream.
            if redis.reader.max_wait_ms == 0 {
                return Err("event_broker.redis.reader.max_wait_ms must be > 0".into());
            }
        }
        // Invalidation
        if self.invalidation.versioned.delimiter.is_empty() {
            return Err("invalidation.versioned.delimiter must not be empty".into());
        }
        if self.invalidation.strategy == StrategyType::TtlAware {
            let ttl = &self.invalidation.ttl_aware;
            if ttl.max_ttl_seconds <= 0 {
                return Err("invalidation.ttl_aware.max_ttl_seconds must be > 0".into());
            }
            if ttl.default_ttl_seconds <= 0 || ttl.default_ttl_seconds > ttl.max_ttl_seconds {
                return Err(
                    "invalidation.ttl_aware.default_ttl_seconds must be in 1..=max_ttl_seconds"
                        .into(),
                );
            }
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_body_limit() -> usize {
    1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CacheType {
    Redis,
    #[default]
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(rename = "type", default)]
    pub backend: CacheType,
    /// TTL used by the HTTP layer when a write does not carry one.
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_seconds: i64,
    #[serde(default)]
    pub redis: RedisCacheConfig,
}

fn default_cache_ttl() -> i64 {
    300
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheType::default(),
            default_ttl_seconds: default_cache_ttl(),
            redis: RedisCacheConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BrokerType {
    RedisStreams,
    #[default]
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventBrokerConfig {
    #[serde(rename = "type", default)]
    pub broker: BrokerType,
    #[serde(default)]
    pub redis: StreamBrokerConfig,
    /// Channels for the in-process broker. Empty means every channel.
    #[serde(default)]
    pub memory_topics: Vec<String>,
    #[serde(default)]
    pub consumer: ConsumerConfig,
}

impl EventBrokerConfig {
    /// Topic list of the selected broker.
    pub fn topics(&self) -> &[String] {
        match self.broker {
            BrokerType::RedisStreams => &self.redis.topics,
            BrokerType::Memory => &self.memory_topics,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_max_failures() -> u32 {
    DEFAULT_MAX_CONSECUTIVE_FAILURES
}
fn default_retry_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF.as_millis() as u64
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: default_max_failures(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl ConsumerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_consecutive_failures,
            Duration::from_millis(self.retry_backoff_ms),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyType {
    #[default]
    VersionedKey,
    TtlAware,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InvalidationConfig {
    #[serde(default)]
    pub strategy: StrategyType,
    #[serde(default)]
    pub versioned: VersionedConfig,
    #[serde(default)]
    pub ttl_aware: TtlAwareConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionedConfig {
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default = "default_version")]
    pub default_version: u64,
}

fn default_delimiter() -> String {
    ":v".into()
}
fn default_version() -> u64 {
    1
}

impl Default for VersionedConfig {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            default_version: default_version(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlAwareConfig {
    #[serde(default = "default_max_ttl")]
    pub max_ttl_seconds: i64,
    #[serde(default = "default_strategy_ttl")]
    pub default_ttl_seconds: i64,
}

fn default_max_ttl() -> i64 {
    3600
}
fn default_strategy_ttl() -> i64 {
    300
}

impl Default for TtlAwareConfig {
    fn default() -> Self {
        Self {
            max_ttl_seconds: default_max_ttl(),
            default_ttl_seconds: default_strategy_ttl(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::{Path, PathBuf};

    /// Default file name looked up in the working directory.
    pub const DEFAULT_CONFIG_FILE: &str = "cachesync.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        } else if path.is_some() {
            return Err(format!("config file not found: {}", pathbuf.display()));
        }
        // Environment variable overrides, e.g., CACHESYNC__SERVER__PORT=9090
        builder = builder.add_source(
            Environment::with_prefix("CACHESYNC")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("event_broker.redis.topics")
                .with_list_parse_key("event_broker.memory_topics"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }

    pub fn load_config_with_default_path<P: AsRef<Path>>(
        path: Option<P>,
    ) -> Result<AppConfig, String> {
        let p = path
            .as_ref()
            .map(|p| p.as_ref().to_string_lossy().to_string());
        load_config(p.as_deref())
    }
}
