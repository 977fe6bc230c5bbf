use thiserror::Error;

/// Errors raised by cache backends.
///
/// A miss is never an error: backends report it as `Ok(None)`.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache backend error: {0}")]
    Backend(String),

    #[error("Cache pool error: {0}")]
    Pool(String),

    #[error("Cache operation timed out after {0}ms")]
    Timeout(u64),

    /// Connectivity could not be established during construction.
    ///
    /// The owning process cannot serve requests without its backend, so the
    /// entry point treats this as fatal.
    #[error("Cache backend unavailable after {attempts} attempts: {last_error}")]
    Unavailable { attempts: u32, last_error: String },
}

impl CacheError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn pool(msg: impl Into<String>) -> Self {
        Self::Pool(msg.into())
    }
}

/// Errors raised by event brokers and the consumption loop.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker connection error: {0}")]
    Connection(String),

    #[error("Broker publish error [channel={channel}]: {message}")]
    Publish { channel: String, message: String },

    #[error("Broker read error: {0}")]
    Read(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Broker already has an active subscription")]
    AlreadySubscribed,

    #[error("Broker is closed")]
    Closed,

    /// The consumption loop hit its consecutive-failure limit.
    ///
    /// An instance that cannot read invalidations would serve stale data
    /// indefinitely; the entry point terminates the process on this value.
    #[error("Consumer aborted after {failures} consecutive read failures: {last_error}")]
    ConsumerExhausted { failures: u32, last_error: String },

    /// One or more sub-resources failed to close. Every sub-resource was
    /// still attempted.
    #[error("Broker close failed: {}", .0.join("; "))]
    Close(Vec<String>),
}

impl BrokerError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn read(msg: impl Into<String>) -> Self {
        Self::Read(msg.into())
    }

    pub fn publish(channel: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Publish {
            channel: channel.into(),
            message: msg.into(),
        }
    }

    /// Whether this error must terminate the owning process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConsumerExhausted { .. })
    }
}

/// Errors raised while constructing an invalidation strategy.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("Invalid strategy configuration: {0}")]
    InvalidConfig(String),
}

impl StrategyError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;
