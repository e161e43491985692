//! Error taxonomy shared by the broker, topology and request layers.
//!
//! Startup errors (`TopologyError`, `ConfigError`) are fatal to the process.
//! Request errors (`DecodeError`, `PublishError`) are turned into responses.

use std::time::Duration;

use thiserror::Error;

/// Errors reported by a broker backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// Declaration disagrees with what the broker already holds under that name.
    #[error("inequivalent declaration: {0}")]
    Conflict(String),

    /// Connection or channel could not be used.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// Referenced exchange or queue does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Broker negatively acknowledged a message.
    #[error("message rejected: {0}")]
    Rejected(String),

    #[error("broker call timed out after {0:?}")]
    Timeout(Duration),
}

/// Failures while establishing the exchange/queue/binding graph.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("topology conflict on {entity}: {source}")]
    Conflict {
        entity: String,
        #[source]
        source: BrokerError,
    },

    #[error("topology unavailable while declaring {entity}: {source}")]
    Unavailable {
        entity: String,
        #[source]
        source: BrokerError,
    },

    /// Declaration rejected locally before reaching the broker.
    #[error("invalid topology: {0}")]
    Invalid(String),
}

impl TopologyError {
    /// Classify a broker error raised while working on `entity`.
    pub fn from_broker(entity: impl Into<String>, source: BrokerError) -> Self {
        let entity = entity.into();
        match source {
            BrokerError::Conflict(_) | BrokerError::NotFound(_) => {
                TopologyError::Conflict { entity, source }
            }
            BrokerError::Unavailable(_) | BrokerError::Rejected(_) | BrokerError::Timeout(_) => {
                TopologyError::Unavailable { entity, source }
            }
        }
    }

    /// Only an unreachable broker is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TopologyError::Unavailable { .. })
    }
}

/// Failures of a single publish call. Never retried by the publisher.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("exchange '{0}' is not part of the declared topology")]
    UnknownExchange(String),

    #[error("publish to '{exchange}' failed: {source}")]
    Failed {
        exchange: String,
        #[source]
        source: BrokerError,
    },
}

/// Failures interpreting an inbound request body.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("payload does not match the item schema: {0}")]
    InvalidItem(#[source] serde_json::Error),
}

/// Invalid configuration detected at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("QUEUE_MAX_LENGTH must be between 1 and {}", i32::MAX)]
    MaxLength,

    #[error("invalid AMQP URL: {0}")]
    Url(String),

    #[error("unknown exchange type '{0}' (expected fanout, direct, topic or headers)")]
    ExchangeKind(String),

    #[error("unknown broker backend '{0}' (expected amqp or memory)")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_is_not_retryable() {
        let err = TopologyError::from_broker(
            "exchange my_exchange",
            BrokerError::Conflict("type".to_string()),
        );
        assert!(matches!(err, TopologyError::Conflict { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_timeout_is_retryable_unavailable() {
        let err = TopologyError::from_broker(
            "queue my_queue",
            BrokerError::Timeout(Duration::from_secs(5)),
        );
        assert!(matches!(err, TopologyError::Unavailable { .. }));
        assert!(err.is_retryable());
    }
}
