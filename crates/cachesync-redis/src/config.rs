//! Configuration types for the Redis cache backend and stream broker.

use serde::{Deserialize, Serialize};

/// Connection settings for the Redis cache backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisCacheConfig {
    /// `host:port` of the Redis server.
    #[serde(default = "default_address")]
    pub address: String,

    /// Optional password (AUTH).
    #[serde(default)]
    pub password: Option<String>,

    /// Database index.
    #[serde(default)]
    pub db: i64,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Per-operation pool timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Connectivity probes before giving up at startup.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Pause between startup probes in milliseconds.
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,
}

fn default_address() -> String {
    "localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_connect_backoff_ms() -> u64 {
    2000
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            password: None,
            db: 0,
            pool_size: default_pool_size(),
            timeout_ms: default_timeout_ms(),
            connect_attempts: default_connect_attempts(),
            connect_backoff_ms: default_connect_backoff_ms(),
        }
    }
}

impl RedisCacheConfig {
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn with_db(mut self, db: i64) -> Self {
        self.db = db;
        self
    }

    #[must_use]
    pub fn with_connect_attempts(mut self, attempts: u32, backoff_ms: u64) -> Self {
        self.connect_attempts = attempts;
        self.connect_backoff_ms = backoff_ms;
        self
    }

    /// `redis://[:password@]address/db`
    pub fn url(&self) -> String {
        match self.password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => format!(
                "redis://:{}@{}/{}",
                urlencoding::encode(password),
                self.address,
                self.db
            ),
            None => format!("redis://{}/{}", self.address, self.db),
        }
    }
}

/// Reader tuning for the consumer-group subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamReaderConfig {
    /// Maximum entries fetched per XREADGROUP (COUNT).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum time a read blocks waiting for entries (BLOCK), in milliseconds.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    /// Entries with a larger payload are acknowledged and skipped.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

fn default_batch_size() -> usize {
    64
}

fn default_max_wait_ms() -> u64 {
    1000
}

fn default_max_payload_bytes() -> usize {
    64 * 1024
}

impl Default for StreamReaderConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_wait_ms: default_max_wait_ms(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

/// Settings for the Redis Streams broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamBrokerConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379/0").
    #[serde(default = "default_url")]
    pub url: String,

    /// Topics consumed by the listener; the first one is the default publish topic.
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,

    /// Prefix applied to every topic to form the stream key.
    #[serde(default = "default_stream_prefix")]
    pub stream_prefix: String,

    /// Consumer group shared by cooperating listeners.
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Consumer name inside the group. Defaults to `hostname-pid`.
    ///
    /// Pending entries are replayed only to a consumer with the same name, so
    /// set a stable name per instance to recover them after a restart.
    #[serde(default)]
    pub consumer_name: Option<String>,

    /// Approximate MAXLEN applied on every XADD.
    #[serde(default)]
    pub stream_maxlen: Option<usize>,

    /// Timeout for the startup probe in milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    #[serde(default)]
    pub reader: StreamReaderConfig,
}

fn default_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_topics() -> Vec<String> {
    vec!["invalidations".to_string()]
}

fn default_stream_prefix() -> String {
    "cachesync:".to_string()
}

fn default_group_id() -> String {
    "cachesync".to_string()
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

impl Default for StreamBrokerConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            topics: default_topics(),
            stream_prefix: default_stream_prefix(),
            group_id: default_group_id(),
            consumer_name: None,
            stream_maxlen: None,
            probe_timeout_ms: default_probe_timeout_ms(),
            reader: StreamReaderConfig::default(),
        }
    }
}

impl StreamBrokerConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_topics(mut self, topics: Vec<String>) -> Self {
        self.topics = topics;
        self
    }

    #[must_use]
    pub fn with_group(mut self, group_id: impl Into<String>, consumer: impl Into<String>) -> Self {
        self.group_id = group_id.into();
        self.consumer_name = Some(consumer.into());
        self
    }

    /// Stream key for a topic.
    pub fn stream_key(&self, topic: &str) -> String {
        format!("{}{}", self.stream_prefix, topic)
    }

    /// Configured consumer name, or `hostname-pid`.
    pub fn resolve_consumer_name(&self) -> String {
        if let Some(name) = self.consumer_name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        format!("{}-{}", host, std::process::id())
    }
}
