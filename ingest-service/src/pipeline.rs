//! Per-request ingest pipeline.
//!
//! ```text
//! Received → Decoded → Published → Acknowledged
//!                    ↘ PublishFailed
//! ```
//!
//! Decoding always finishes before the publish starts, and the caller only
//! gets a result once the broker has answered.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, warn};

use crate::decode::{decode, validate_item};
use crate::error::{DecodeError, PublishError};
use crate::publisher::{PublishReceipt, Publisher};

/// Lifecycle stage of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Decoded,
    Published,
    Acknowledged,
    PublishFailed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::Decoded => "decoded",
            Stage::Published => "published",
            Stage::Acknowledged => "acknowledged",
            Stage::PublishFailed => "publish_failed",
        };
        f.write_str(name)
    }
}

/// Where the pipeline sends a request.
#[derive(Debug, Clone)]
pub struct Target {
    pub exchange: String,
    pub queue: Option<String>,
}

/// Successfully acknowledged request.
#[derive(Debug, Clone)]
pub struct Accepted {
    /// Decoded body, echoed back to the caller
    pub text: String,
    pub receipt: PublishReceipt,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Decode `body` and publish it unchanged to `target`.
pub async fn ingest(
    publisher: &Publisher,
    target: &Target,
    body: Bytes,
) -> Result<Accepted, IngestError> {
    debug!(stage = %Stage::Received, body_length = body.len(), "ingest_stage");

    let text = decode(&body)?;
    validate_item(&text)?;
    debug!(stage = %Stage::Decoded, "ingest_stage");

    let receipt = match publisher
        .publish_to(body, &target.exchange, target.queue.as_deref())
        .await
    {
        Ok(receipt) => receipt,
        Err(e) => {
            warn!(stage = %Stage::PublishFailed, error = %e, "ingest_stage");
            return Err(e.into());
        }
    };
    debug!(stage = %Stage::Published, exchange = %receipt.exchange, "ingest_stage");
    debug!(stage = %Stage::Acknowledged, "ingest_stage");

    Ok(Accepted { text, receipt })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::broker::{Broker, InMemoryBroker};
    use crate::config::Config;
    use crate::topology::{TopologyManager, TopologyPlan};

    const BODY: &str = r#"{"name":"widget","price":9.99,"quantity":3}"#;

    async fn ready(broker: &InMemoryBroker) -> Publisher {
        let broker: Arc<dyn Broker> = Arc::new(broker.clone());
        let topology = TopologyManager::new(broker.clone(), TopologyPlan::from_config(&Config::default()))
            .initialize()
            .await
            .unwrap();
        Publisher::new(broker, topology)
    }

    fn target() -> Target {
        Target {
            exchange: "my_exchange".to_string(),
            queue: Some("my_queue".to_string()),
        }
    }

    #[tokio::test]
    async fn test_ingest_publishes_and_echoes() {
        let broker = InMemoryBroker::new();
        let publisher = ready(&broker).await;

        let accepted = ingest(&publisher, &target(), Bytes::from_static(BODY.as_bytes()))
            .await
            .unwrap();

        assert_eq!(accepted.text, BODY);
        assert_eq!(accepted.receipt.exchange, "my_exchange");
        assert_eq!(broker.messages("my_queue")[0].payload.as_ref(), BODY.as_bytes());
    }

    #[tokio::test]
    async fn test_decode_failure_never_publishes() {
        let broker = InMemoryBroker::new();
        let publisher = ready(&broker).await;

        let err = ingest(&publisher, &target(), Bytes::from_static(&[0xff, 0xfe]))
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::Decode(DecodeError::InvalidUtf8(_))));
        assert_eq!(broker.published_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_item_never_publishes() {
        let broker = InMemoryBroker::new();
        let publisher = ready(&broker).await;

        let err = ingest(&publisher, &target(), Bytes::from_static(b"{\"name\":\"widget\"}"))
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::Decode(DecodeError::InvalidItem(_))));
        assert_eq!(broker.published_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported() {
        let broker = InMemoryBroker::new();
        let publisher = ready(&broker).await;
        broker.disconnect();

        let err = ingest(&publisher, &target(), Bytes::from_static(BODY.as_bytes()))
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::Publish(_)));
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::PublishFailed.to_string(), "publish_failed");
        assert_eq!(Stage::Acknowledged.to_string(), "acknowledged");
    }
}
