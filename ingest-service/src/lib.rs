//! Transaction ingest - HTTP front door for a RabbitMQ fan-out topology.
//!
//! The service boots in two phases:
//! 1. The topology manager declares the exchange, the bounded queue and the binding
//! 2. Only then is a publisher installed and are requests accepted
//!
//! ## Architecture
//!
//! ```text
//! POST /post-data → decode → Publisher → my_exchange (fanout) → my_queue (max 1000)
//! ```

pub mod broker;
pub mod config;
pub mod decode;
pub mod error;
pub mod pipeline;
pub mod publisher;
pub mod topology;
pub mod web;

// Re-export commonly used types
pub use broker::{AmqpBroker, Broker, ExchangeKind, ExchangeSpec, InMemoryBroker, QueueSpec};
pub use config::{BrokerBackend, Config};
pub use error::{BrokerError, ConfigError, DecodeError, PublishError, TopologyError};
pub use publisher::{PublishReceipt, Publisher};
pub use topology::{Topology, TopologyManager, TopologyPlan};
pub use web::AppState;
