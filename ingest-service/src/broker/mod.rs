//! Broker module for the exchange/queue session.
//!
//! This module provides:
//! - The `Broker` trait every backend implements
//! - Declaration types for exchanges and queues
//! - A lapin-backed AMQP backend and an in-process backend
//!
//! A single `Arc<dyn Broker>` is created at startup and shared by the topology
//! manager and every publish call.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{BrokerError, ConfigError};

pub mod amqp;
pub mod memory;

pub use amqp::AmqpBroker;
pub use memory::{InMemoryBroker, StoredMessage};

/// Routing semantics of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Every bound queue receives every message
    Fanout,
    /// Routing key must equal the binding key
    Direct,
    /// Routing key is matched against a dotted pattern
    Topic,
    /// Routing by message headers
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }

    /// Whether bindings and publishes on this kind carry a meaningful routing key.
    pub fn uses_routing_key(&self) -> bool {
        matches!(self, ExchangeKind::Direct | ExchangeKind::Topic)
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fanout" => Ok(ExchangeKind::Fanout),
            "direct" => Ok(ExchangeKind::Direct),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            _ => Err(ConfigError::ExchangeKind(s.to_string())),
        }
    }
}

/// Parameters of an exchange declaration.
///
/// Two declarations are equivalent only if every field matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeSpec {
    /// A non-durable, non-auto-deleted exchange.
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: false,
            auto_delete: false,
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }
}

/// Parameters of a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// Sent as `x-max-length`; the broker drops the oldest message once exceeded
    pub max_length: u32,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>, durable: bool, max_length: u32) -> Self {
        Self {
            name: name.into(),
            durable,
            max_length,
        }
    }
}

/// A message handed to the broker. The payload is forwarded byte for byte.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub exchange: String,
    /// Empty for fan-out exchanges
    pub routing_key: String,
    pub payload: Bytes,
    pub content_type: Option<String>,
    /// Delivery mode 2 when set
    pub persistent: bool,
}

/// Broker session shared by the topology manager and the publisher.
///
/// Declarations are idempotent: repeating an identical declaration succeeds,
/// while reusing a name with different parameters fails with
/// `BrokerError::Conflict`.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Create or confirm an exchange.
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError>;

    /// Create or confirm a queue.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError>;

    /// Bind a queue to an exchange. Re-binding is a no-op.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Deliver one message. Returns once the broker has accepted it.
    async fn publish(&self, message: OutboundMessage) -> Result<(), BrokerError>;

    /// Release the session.
    async fn close(&self);
}
