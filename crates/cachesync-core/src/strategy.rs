//! Key-versioning strategies.
//!
//! A strategy maps a logical `(topic, key)` pair onto the physical key stored
//! in the backend, and derives the effective TTL for writes. It is the single
//! seam for changing key layout or TTL policy without touching
//! [`CacheService`](crate::CacheService).
//!
//! Derivation is a pure function of `(topic, key, configuration)`: no clock,
//! no hidden state. Bumping the version yields a fresh generation of physical
//! keys, which invalidates every entry of the previous epoch without a single
//! backend call.

use crate::error::StrategyError;

/// Separator between topic and key in every physical key.
pub const TOPIC_SEPARATOR: &str = ":";

/// Pluggable key and TTL policy.
pub trait InvalidationStrategy: Send + Sync {
    /// Short name for logging.
    fn name(&self) -> &str;

    /// Physical backend key for a logical `(topic, key)`.
    fn generate_key(&self, topic: &str, key: &str) -> String;

    /// Effective TTL in seconds for a requested TTL.
    fn compute_ttl(&self, requested_ttl: i64) -> i64;
}

/// How requested TTLs are turned into effective TTLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TtlPolicy {
    /// Effective TTL equals the requested TTL.
    #[default]
    Passthrough,
    /// Cap TTLs at `max`; non-positive requests get `default`.
    Clamp { max: i64, default: i64 },
    /// Ignore the request and always use `seconds`.
    Fixed { seconds: i64 },
}

impl TtlPolicy {
    fn validate(&self) -> Result<(), StrategyError> {
        match *self {
            TtlPolicy::Passthrough => Ok(()),
            TtlPolicy::Clamp { max, default } => {
                if max <= 0 {
                    return Err(StrategyError::invalid_config("ttl max must be > 0"));
                }
                if default <= 0 || default > max {
                    return Err(StrategyError::invalid_config(format!(
                        "ttl default must be within 1..={max}"
                    )));
                }
                Ok(())
            }
            TtlPolicy::Fixed { seconds } => {
                if seconds <= 0 {
                    return Err(StrategyError::invalid_config("fixed ttl must be > 0"));
                }
                Ok(())
            }
        }
    }

    pub fn apply(&self, requested_ttl: i64) -> i64 {
        match *self {
            TtlPolicy::Passthrough => requested_ttl,
            TtlPolicy::Clamp { max, default } => {
                if requested_ttl <= 0 {
                    default
                } else {
                    requested_ttl.min(max)
                }
            }
            TtlPolicy::Fixed { seconds } => seconds,
        }
    }
}

/// `topic:key<delimiter><version>` keys.
///
/// The delimiter and version are fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedKeyStrategy {
    delimiter: String,
    version: u64,
    ttl_policy: TtlPolicy,
}

impl VersionedKeyStrategy {
    /// Versioned keys with identity TTL.
    pub fn new(delimiter: impl Into<String>, version: u64) -> Result<Self, StrategyError> {
        Self::with_ttl_policy(delimiter, version, TtlPolicy::Passthrough)
    }

    pub fn with_ttl_policy(
        delimiter: impl Into<String>,
        version: u64,
        ttl_policy: TtlPolicy,
    ) -> Result<Self, StrategyError> {
        let delimiter = delimiter.into();
        // An empty delimiter makes "k1" + "2" collide with "k" + "12".
        if delimiter.is_empty() {
            return Err(StrategyError::invalid_config("delimiter must not be empty"));
        }
        if delimiter.chars().any(|c| c.is_ascii_digit()) {
            return Err(StrategyError::invalid_config(
                "delimiter must not contain digits",
            ));
        }
        ttl_policy.validate()?;

        Ok(Self {
            delimiter,
            version,
            ttl_policy,
        })
    }

    /// Same configuration for another epoch.
    pub fn with_version(&self, version: u64) -> Self {
        Self {
            version,
            ..self.clone()
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    pub fn ttl_policy(&self) -> TtlPolicy {
        self.ttl_policy
    }
}

impl InvalidationStrategy for VersionedKeyStrategy {
    fn name(&self) -> &str {
        match self.ttl_policy {
            TtlPolicy::Passthrough => "versioned-key",
            _ => "ttl-aware",
        }
    }

    fn generate_key(&self, topic: &str, key: &str) -> String {
        let version = self.version.to_string();
        let mut out = String::with_capacity(
            topic.len() + TOPIC_SEPARATOR.len() + key.len() + self.delimiter.len() + version.len(),
        );
        out.push_str(topic);
        out.push_str(TOPIC_SEPARATOR);
        out.push_str(key);
        out.push_str(&self.delimiter);
        out.push_str(&version);
        out
    }

    fn compute_ttl(&self, requested_ttl: i64) -> i64 {
        self.ttl_policy.apply(requested_ttl)
    }
}
