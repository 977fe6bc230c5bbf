//! Invalidation events exchanged between broker publishers and subscribers.

use serde::{Deserialize, Serialize};

use crate::error::BrokerResult;

/// Advisory notification that `(topic, key)` changed on some instance.
///
/// Carries no version or payload: receivers only drop their view of the
/// logical key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub topic: String,
    pub key: String,
}

impl InvalidationEvent {
    pub fn new(topic: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
        }
    }

    /// Encode for transmission.
    pub fn to_payload(&self) -> BrokerResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a payload received from a broker.
    pub fn from_payload(payload: &[u8]) -> BrokerResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

impl std::fmt::Display for InvalidationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.topic, self.key)
    }
}
