//! Publisher for forwarding payloads onto the established exchange.
//!
//! The publisher never declares topology and never retries. It can only be
//! built from a [`Topology`], and it refuses exchanges outside of it.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::broker::{Broker, OutboundMessage};
use crate::error::PublishError;
use crate::topology::Topology;

/// Content type attached to forwarded payloads. The body is forwarded as text,
/// which is how existing consumers expect to decode it.
pub const PAYLOAD_CONTENT_TYPE: &str = "text/plain";

/// Broker acceptance of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub exchange: String,
    pub routing_key: String,
    pub body_length: usize,
}

/// Cheaply cloneable handle shared by all request tasks.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    topology: Arc<Topology>,
    persistent: bool,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, topology: Topology) -> Self {
        Self {
            broker,
            topology: Arc::new(topology),
            persistent: false,
        }
    }

    /// Mark messages persistent (delivery mode 2).
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Publish `payload` to `exchange`.
    pub async fn publish(
        &self,
        payload: Bytes,
        exchange: &str,
    ) -> Result<PublishReceipt, PublishError> {
        self.publish_to(payload, exchange, None).await
    }

    /// Publish `payload` to `exchange`, naming the intended queue.
    ///
    /// For fan-out and headers exchanges the queue is informational only.
    /// For direct and topic exchanges it becomes the routing key, defaulting
    /// to the bound queue.
    pub async fn publish_to(
        &self,
        payload: Bytes,
        exchange: &str,
        queue: Option<&str>,
    ) -> Result<PublishReceipt, PublishError> {
        let declared = self.topology.exchange();
        if declared.name() != exchange {
            warn!(exchange = %exchange, "publish_unknown_exchange");
            return Err(PublishError::UnknownExchange(exchange.to_string()));
        }

        let routing_key = if declared.kind().uses_routing_key() {
            queue.unwrap_or(self.topology.queue().name()).to_string()
        } else {
            if let Some(queue) = queue {
                debug!(queue = %queue, exchange_type = %declared.kind(), "publish_queue_not_used_for_routing");
            }
            String::new()
        };

        let body_length = payload.len();
        let message = OutboundMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.clone(),
            payload,
            content_type: Some(PAYLOAD_CONTENT_TYPE.to_string()),
            persistent: self.persistent,
        };

        self.broker
            .publish(message)
            .await
            .map_err(|source| PublishError::Failed {
                exchange: exchange.to_string(),
                source,
            })?;

        info!(
            exchange = %exchange,
            routing_key = %routing_key,
            body_length,
            "message_published"
        );

        Ok(PublishReceipt {
            exchange: exchange.to_string(),
            routing_key,
            body_length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ExchangeKind, ExchangeSpec, InMemoryBroker, QueueSpec};
    use crate::config::Config;
    use crate::error::BrokerError;
    use crate::topology::{TopologyManager, TopologyPlan};

    async fn ready(broker: &InMemoryBroker, plan: TopologyPlan) -> Publisher {
        let broker: Arc<dyn Broker> = Arc::new(broker.clone());
        let topology = TopologyManager::new(broker.clone(), plan)
            .initialize()
            .await
            .unwrap();
        Publisher::new(broker, topology)
    }

    fn default_plan() -> TopologyPlan {
        TopologyPlan::from_config(&Config::default())
    }

    #[tokio::test]
    async fn test_publish_forwards_exact_bytes() {
        let broker = InMemoryBroker::new();
        let publisher = ready(&broker, default_plan()).await;
        let body = Bytes::from_static(br#"{"name":"widget","price":9.99,"quantity":3}"#);

        let receipt = publisher
            .publish_to(body.clone(), "my_exchange", Some("my_queue"))
            .await
            .unwrap();

        assert_eq!(receipt.routing_key, "");
        assert_eq!(receipt.body_length, body.len());

        let messages = broker.messages("my_queue");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, body);
        assert_eq!(messages[0].content_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_unknown_exchange_never_reaches_broker() {
        let broker = InMemoryBroker::new();
        let publisher = ready(&broker, default_plan()).await;

        let err = publisher
            .publish(Bytes::from_static(b"x"), "other_exchange")
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::UnknownExchange(ref name) if name == "other_exchange"));
        assert_eq!(broker.published_count(), 0);
    }

    #[tokio::test]
    async fn test_broker_failure_surfaces() {
        let broker = InMemoryBroker::new();
        let publisher = ready(&broker, default_plan()).await;
        broker.disconnect();

        let err = publisher
            .publish(Bytes::from_static(b"x"), "my_exchange")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PublishError::Failed {
                source: BrokerError::Unavailable(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_direct_exchange_routes_by_queue_name() {
        let broker = InMemoryBroker::new();
        let plan = TopologyPlan::new(
            ExchangeSpec::new("orders", ExchangeKind::Direct),
            QueueSpec::new("orders_queue", true, 10),
        );
        let publisher = ready(&broker, plan).await;

        let receipt = publisher
            .publish(Bytes::from_static(b"{}"), "orders")
            .await
            .unwrap();

        assert_eq!(receipt.routing_key, "orders_queue");
        assert_eq!(broker.depth("orders_queue"), 1);
    }

    #[tokio::test]
    async fn test_overflow_keeps_publishing() {
        let broker = InMemoryBroker::new();
        let publisher = ready(&broker, default_plan()).await;

        for i in 0..1005u32 {
            publisher
                .publish(Bytes::from(i.to_string()), "my_exchange")
                .await
                .unwrap();
        }

        assert_eq!(broker.depth("my_queue"), 1000);
        assert_eq!(broker.dropped_count(), 5);
        let oldest = &broker.messages("my_queue")[0];
        assert_eq!(oldest.payload, Bytes::from("5"));
    }

    #[tokio::test]
    async fn test_concurrent_publishes() {
        let broker = InMemoryBroker::new();
        let publisher = ready(&broker, default_plan()).await;

        let tasks = (0..50).map(|i| {
            let publisher = publisher.clone();
            async move {
                publisher
                    .publish(Bytes::from(format!("msg-{i}")), "my_exchange")
                    .await
            }
        });
        let results = futures::future::join_all(tasks).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(broker.depth("my_queue"), 50);
    }
}
