//! In-process broker with RabbitMQ declaration and routing semantics.
//!
//! Used by the test suite and by `BROKER=memory` dry runs. It reproduces the
//! behaviour the service relies on: idempotent declarations, conflict on
//! inequivalent redeclaration, set-semantics bindings, exchange routing and
//! drop-head overflow once a queue exceeds its `x-max-length`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};

use super::{Broker, ExchangeKind, ExchangeSpec, OutboundMessage, QueueSpec};
use crate::error::BrokerError;

/// A message sitting in an in-memory queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Bytes,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

struct MemoryQueue {
    spec: QueueSpec,
    messages: VecDeque<StoredMessage>,
}

struct State {
    connected: bool,
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, MemoryQueue>,
    bindings: HashSet<Binding>,
    published: u64,
    dropped: u64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            connected: true,
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            bindings: HashSet::new(),
            published: 0,
            dropped: 0,
        }
    }
}

/// Shared in-memory broker. Clones observe the same state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate a severed connection: every call fails until `reconnect`.
    pub fn disconnect(&self) {
        self.state().connected = false;
        info!("memory_broker_disconnected");
    }

    pub fn reconnect(&self) {
        self.state().connected = true;
        info!("memory_broker_reconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.state().exchanges.get(name).cloned()
    }

    pub fn queue(&self, name: &str) -> Option<QueueSpec> {
        self.state().queues.get(name).map(|q| q.spec.clone())
    }

    pub fn exchange_count(&self) -> usize {
        self.state().exchanges.len()
    }

    pub fn queue_count(&self) -> usize {
        self.state().queues.len()
    }

    pub fn binding_count(&self) -> usize {
        self.state().bindings.len()
    }

    pub fn is_bound(&self, queue: &str, exchange: &str) -> bool {
        self.state()
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange)
    }

    /// Messages currently held by `queue`, oldest first.
    pub fn messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn depth(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.messages.len())
    }

    /// Total messages accepted by any exchange.
    pub fn published_count(&self) -> u64 {
        self.state().published
    }

    /// Messages evicted because a queue was over its bound.
    pub fn dropped_count(&self) -> u64 {
        self.state().dropped
    }
}

fn ensure_connected(state: &State) -> Result<(), BrokerError> {
    if state.connected {
        Ok(())
    } else {
        Err(BrokerError::Unavailable("connection closed".to_string()))
    }
}

/// Describe the fields on which two exchange declarations disagree.
fn exchange_mismatch(existing: &ExchangeSpec, requested: &ExchangeSpec) -> Option<String> {
    if existing.kind != requested.kind {
        return Some(format!(
            "inequivalent arg 'type' for exchange '{}': received '{}' but current is '{}'",
            requested.name, requested.kind, existing.kind
        ));
    }
    if existing.durable != requested.durable {
        return Some(format!(
            "inequivalent arg 'durable' for exchange '{}': received '{}' but current is '{}'",
            requested.name, requested.durable, existing.durable
        ));
    }
    if existing.auto_delete != requested.auto_delete {
        return Some(format!(
            "inequivalent arg 'auto_delete' for exchange '{}': received '{}' but current is '{}'",
            requested.name, requested.auto_delete, existing.auto_delete
        ));
    }
    None
}

fn queue_mismatch(existing: &QueueSpec, requested: &QueueSpec) -> Option<String> {
    if existing.durable != requested.durable {
        return Some(format!(
            "inequivalent arg 'durable' for queue '{}': received '{}' but current is '{}'",
            requested.name, requested.durable, existing.durable
        ));
    }
    if existing.max_length != requested.max_length {
        return Some(format!(
            "inequivalent arg 'x-max-length' for queue '{}': received '{}' but current is '{}'",
            requested.name, requested.max_length, existing.max_length
        ));
    }
    None
}

/// Whether a binding key on `kind` accepts `routing_key`.
fn routes(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        // Bindings carry no header arguments, which matches every message
        ExchangeKind::Fanout | ExchangeKind::Headers => true,
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = binding_key.split('.').collect();
            let words: Vec<&str> = routing_key.split('.').collect();
            topic_matches(&pattern, &words)
        }
    }
}

/// `*` matches exactly one word, `#` matches zero or more.
fn topic_matches(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| topic_matches(rest, &words[skip..])),
        Some((&head, rest)) => match words.split_first() {
            Some((&word, remaining)) if head == "*" || head == word => {
                topic_matches(rest, remaining)
            }
            _ => false,
        },
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        let mut state = self.state();
        ensure_connected(&state)?;

        if let Some(existing) = state.exchanges.get(&spec.name) {
            return match exchange_mismatch(existing, spec) {
                Some(reason) => Err(BrokerError::Conflict(reason)),
                None => Ok(()),
            };
        }

        state.exchanges.insert(spec.name.clone(), spec.clone());
        debug!(exchange = %spec.name, kind = %spec.kind, "memory_exchange_declared");
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        let mut state = self.state();
        ensure_connected(&state)?;

        if let Some(existing) = state.queues.get(&spec.name) {
            return match queue_mismatch(&existing.spec, spec) {
                Some(reason) => Err(BrokerError::Conflict(reason)),
                None => Ok(()),
            };
        }

        state.queues.insert(
            spec.name.clone(),
            MemoryQueue {
                spec: spec.clone(),
                messages: VecDeque::new(),
            },
        );
        debug!(queue = %spec.name, max_length = spec.max_length, "memory_queue_declared");
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.state();
        ensure_connected(&state)?;

        if !state.queues.contains_key(queue) {
            return Err(BrokerError::NotFound(format!("no queue '{queue}'")));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound(format!("no exchange '{exchange}'")));
        }

        state.bindings.insert(Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        let mut guard = self.state();
        ensure_connected(&guard)?;

        let state = &mut *guard;
        let kind = state
            .exchanges
            .get(&message.exchange)
            .map(|e| e.kind)
            .ok_or_else(|| BrokerError::NotFound(format!("no exchange '{}'", message.exchange)))?;

        let targets: HashSet<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == message.exchange)
            .filter(|b| routes(kind, &b.routing_key, &message.routing_key))
            .map(|b| b.queue.clone())
            .collect();

        let stored = StoredMessage {
            exchange: message.exchange,
            routing_key: message.routing_key,
            payload: message.payload,
            content_type: message.content_type,
        };

        for name in &targets {
            if let Some(queue) = state.queues.get_mut(name) {
                queue.messages.push_back(stored.clone());
                while queue.messages.len() > queue.spec.max_length as usize {
                    queue.messages.pop_front();
                    state.dropped += 1;
                }
            }
        }

        state.published += 1;
        Ok(())
    }

    async fn close(&self) {
        self.state().connected = false;
        info!("memory_broker_closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(exchange: &str, routing_key: &str, body: &'static str) -> OutboundMessage {
        OutboundMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: Bytes::from_static(body.as_bytes()),
            content_type: None,
            persistent: false,
        }
    }

    #[tokio::test]
    async fn test_redeclare_identical_is_noop() {
        let broker = InMemoryBroker::new();
        let spec = ExchangeSpec::new("my_exchange", ExchangeKind::Fanout);

        broker.declare_exchange(&spec).await.unwrap();
        broker.declare_exchange(&spec).await.unwrap();

        assert_eq!(broker.exchange_count(), 1);
    }

    #[tokio::test]
    async fn test_redeclare_with_other_type_conflicts() {
        let broker = InMemoryBroker::new();
        broker
            .declare_exchange(&ExchangeSpec::new("my_exchange", ExchangeKind::Fanout))
            .await
            .unwrap();

        let err = broker
            .declare_exchange(&ExchangeSpec::new("my_exchange", ExchangeKind::Direct))
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerError::Conflict(ref reason) if reason.contains("'type'")));
        assert_eq!(broker.exchange("my_exchange").unwrap().kind, ExchangeKind::Fanout);
    }

    #[tokio::test]
    async fn test_queue_bound_conflict() {
        let broker = InMemoryBroker::new();
        broker
            .declare_queue(&QueueSpec::new("my_queue", true, 1000))
            .await
            .unwrap();

        let err = broker
            .declare_queue(&QueueSpec::new("my_queue", true, 50))
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_bind_requires_both_ends() {
        let broker = InMemoryBroker::new();
        let err = broker.bind_queue("my_queue", "my_exchange", "").await.unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_fanout_ignores_routing_key() {
        let broker = InMemoryBroker::new();
        broker
            .declare_exchange(&ExchangeSpec::new("fan", ExchangeKind::Fanout))
            .await
            .unwrap();
        for queue in ["a", "b"] {
            broker.declare_queue(&QueueSpec::new(queue, true, 10)).await.unwrap();
            broker.bind_queue(queue, "fan", "").await.unwrap();
        }

        broker.publish(message("fan", "whatever", "hello")).await.unwrap();

        assert_eq!(broker.depth("a"), 1);
        assert_eq!(broker.depth("b"), 1);
    }

    #[tokio::test]
    async fn test_direct_routes_by_key() {
        let broker = InMemoryBroker::new();
        broker
            .declare_exchange(&ExchangeSpec::new("direct", ExchangeKind::Direct))
            .await
            .unwrap();
        broker.declare_queue(&QueueSpec::new("a", true, 10)).await.unwrap();
        broker.bind_queue("a", "direct", "a").await.unwrap();

        broker.publish(message("direct", "b", "miss")).await.unwrap();
        broker.publish(message("direct", "a", "hit")).await.unwrap();

        let messages = broker.messages("a");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, Bytes::from_static(b"hit"));
    }

    #[test]
    fn test_topic_patterns() {
        assert!(routes(ExchangeKind::Topic, "orders.*", "orders.created"));
        assert!(!routes(ExchangeKind::Topic, "orders.*", "orders.created.eu"));
        assert!(routes(ExchangeKind::Topic, "orders.#", "orders"));
        assert!(routes(ExchangeKind::Topic, "#.eu", "orders.created.eu"));
        assert!(!routes(ExchangeKind::Topic, "orders", "refunds"));
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let broker = InMemoryBroker::new();
        broker
            .declare_exchange(&ExchangeSpec::new("fan", ExchangeKind::Fanout))
            .await
            .unwrap();
        broker.declare_queue(&QueueSpec::new("q", true, 2)).await.unwrap();
        broker.bind_queue("q", "fan", "").await.unwrap();

        for body in ["one", "two", "three"] {
            broker.publish(message("fan", "", body)).await.unwrap();
        }

        let bodies: Vec<Bytes> = broker.messages("q").into_iter().map(|m| m.payload).collect();
        assert_eq!(bodies, vec![Bytes::from_static(b"two"), Bytes::from_static(b"three")]);
        assert_eq!(broker.dropped_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnected_broker_is_unavailable() {
        let broker = InMemoryBroker::new();
        broker
            .declare_exchange(&ExchangeSpec::new("fan", ExchangeKind::Fanout))
            .await
            .unwrap();
        broker.disconnect();

        let err = broker.publish(message("fan", "", "lost")).await.unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable(_)));

        broker.reconnect();
        broker.publish(message("fan", "", "kept")).await.unwrap();
        assert_eq!(broker.published_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_to_missing_exchange() {
        let broker = InMemoryBroker::new();
        let err = broker.publish(message("nowhere", "", "x")).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));
    }
}
