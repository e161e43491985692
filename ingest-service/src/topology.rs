//! Topology manager: declares the exchange, the bounded queue and their binding.
//!
//! `TopologyManager::initialize` runs once at startup, before the service
//! accepts requests. It returns a [`Topology`], the only value a
//! [`Publisher`](crate::publisher::Publisher) can be built from, so nothing
//! can publish against a topology that was never established.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{error, info, warn};

use crate::broker::{Broker, ExchangeKind, ExchangeSpec, QueueSpec};
use crate::config::Config;
use crate::error::TopologyError;

/// Confirmed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeHandle {
    name: String,
    kind: ExchangeKind,
}

impl ExchangeHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }
}

/// Confirmed queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    name: String,
    max_length: u32,
}

impl QueueHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_length(&self) -> u32 {
        self.max_length
    }
}

/// What startup should declare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyPlan {
    pub exchange: ExchangeSpec,
    pub queue: QueueSpec,
}

impl TopologyPlan {
    pub fn new(exchange: ExchangeSpec, queue: QueueSpec) -> Self {
        Self { exchange, queue }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            exchange: ExchangeSpec::new(config.exchange_name.clone(), config.exchange_kind)
                .durable(config.exchange_durable),
            queue: QueueSpec::new(
                config.queue_name.clone(),
                config.queue_durable,
                config.queue_max_length,
            ),
        }
    }
}

/// Established exchange/queue/binding triple.
#[derive(Debug, Clone)]
pub struct Topology {
    exchange: ExchangeHandle,
    queue: QueueHandle,
    binding_key: String,
}

impl Topology {
    pub fn exchange(&self) -> &ExchangeHandle {
        &self.exchange
    }

    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    /// Routing key used for the binding (empty for fan-out).
    pub fn binding_key(&self) -> &str {
        &self.binding_key
    }
}

/// Bounded retry with exponential backoff for an unreachable broker.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Fail on the first error.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.startup_max_attempts.max(1),
            initial_backoff: config.startup_backoff(),
            max_backoff: Duration::from_secs(10),
        }
    }

    /// Delay after the given failed attempt (1-based), with up to 25% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let base = self
            .initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff);
        let jitter_ms = base.as_millis() as u64 / 4;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Declares and binds the topology the publisher depends on.
pub struct TopologyManager {
    broker: Arc<dyn Broker>,
    plan: TopologyPlan,
    retry: RetryPolicy,
}

impl TopologyManager {
    pub fn new(broker: Arc<dyn Broker>, plan: TopologyPlan) -> Self {
        Self {
            broker,
            plan,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn plan(&self) -> &TopologyPlan {
        &self.plan
    }

    /// Create or confirm an exchange.
    ///
    /// Redeclaring with the same parameters returns an equal handle; reusing
    /// the name with another kind fails with `TopologyError::Conflict`.
    pub async fn declare_exchange(
        &self,
        spec: &ExchangeSpec,
    ) -> Result<ExchangeHandle, TopologyError> {
        if spec.name.trim().is_empty() {
            return Err(TopologyError::Invalid("exchange name must not be empty".to_string()));
        }

        self.broker
            .declare_exchange(spec)
            .await
            .map_err(|e| TopologyError::from_broker(format!("exchange '{}'", spec.name), e))?;

        Ok(ExchangeHandle {
            name: spec.name.clone(),
            kind: spec.kind,
        })
    }

    /// Create or confirm a bounded queue.
    pub async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueHandle, TopologyError> {
        if spec.name.trim().is_empty() {
            return Err(TopologyError::Invalid("queue name must not be empty".to_string()));
        }
        if spec.max_length == 0 || spec.max_length > i32::MAX as u32 {
            return Err(TopologyError::Invalid(format!(
                "queue '{}' max length must be between 1 and {}",
                spec.name,
                i32::MAX
            )));
        }

        self.broker
            .declare_queue(spec)
            .await
            .map_err(|e| TopologyError::from_broker(format!("queue '{}'", spec.name), e))?;

        Ok(QueueHandle {
            name: spec.name.clone(),
            max_length: spec.max_length,
        })
    }

    /// Bind `queue` to `exchange`. Rebinding is a no-op.
    ///
    /// Fan-out and headers exchanges bind with an empty key; direct and topic
    /// exchanges bind with the queue name.
    pub async fn bind(
        &self,
        queue: &QueueHandle,
        exchange: &ExchangeHandle,
    ) -> Result<String, TopologyError> {
        let routing_key = binding_key(queue, exchange);

        self.broker
            .bind_queue(queue.name(), exchange.name(), &routing_key)
            .await
            .map_err(|e| {
                TopologyError::from_broker(
                    format!("binding '{}' -> '{}'", queue.name(), exchange.name()),
                    e,
                )
            })?;

        Ok(routing_key)
    }

    /// Declare exchange, then queue, then binding. One attempt.
    pub async fn declare_all(&self) -> Result<Topology, TopologyError> {
        let exchange = self.declare_exchange(&self.plan.exchange).await?;
        let queue = self.declare_queue(&self.plan.queue).await?;
        let binding_key = self.bind(&queue, &exchange).await?;

        Ok(Topology {
            exchange,
            queue,
            binding_key,
        })
    }

    /// Establish the topology, retrying only while the broker is unreachable.
    pub async fn initialize(&self) -> Result<Topology, TopologyError> {
        let mut attempt = 1;
        loop {
            match self.declare_all().await {
                Ok(topology) => {
                    info!(
                        exchange = topology.exchange().name(),
                        exchange_type = %topology.exchange().kind(),
                        queue = topology.queue().name(),
                        max_length = topology.queue().max_length(),
                        attempt,
                        "topology_ready"
                    );
                    return Ok(topology);
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        error = %e,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "topology_setup_retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(error = %e, attempt, "topology_setup_failed");
                    return Err(e);
                }
            }
        }
    }
}

fn binding_key(queue: &QueueHandle, exchange: &ExchangeHandle) -> String {
    if exchange.kind().uses_routing_key() {
        queue.name().to_string()
    } else {
        String::new()
    }
}
