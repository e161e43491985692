//! RabbitMQ backend built on lapin.
//!
//! The broker keeps one connection and one confirm-mode channel that every
//! task shares. A dropped connection is re-established lazily on the next
//! call, and all declarations accepted so far are replayed onto it so the
//! topology outlives broker restarts of non-durable entities.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use lapin::{
    options::{
        BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{Broker, ExchangeKind, ExchangeSpec, OutboundMessage, QueueSpec};
use crate::error::BrokerError;

/// Queue argument carrying the message bound.
pub const MAX_LENGTH_ARG: &str = "x-max-length";

/// Async RabbitMQ session with connection management.
#[derive(Clone)]
pub struct AmqpBroker {
    inner: Arc<AmqpInner>,
}

struct AmqpInner {
    url: String,
    call_timeout: Duration,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
    replay: Mutex<ReplayLog>,
}

/// Declarations accepted so far, and whether the current connection still lacks them.
///
/// A replay stays pending until every declaration has been applied on the
/// current connection, so a replay cut short by an error or a timeout is
/// retried by the next call.
#[derive(Debug, Default)]
struct ReplayLog {
    declarations: Vec<Declaration>,
    pending: bool,
}

impl ReplayLog {
    fn remember(&mut self, declaration: Declaration) {
        if !self.declarations.contains(&declaration) {
            self.declarations.push(declaration);
        }
    }

    /// A new connection was opened; nothing is known to exist on it.
    fn connection_opened(&mut self) {
        self.pending = true;
    }

    /// Declarations still to be applied on the current connection.
    fn pending(&self) -> Option<Vec<Declaration>> {
        self.pending.then(|| self.declarations.clone())
    }

    fn replayed(&mut self) {
        self.pending = false;
    }
}

/// A declaration the broker accepted, kept for replay after reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Declaration {
    Exchange(ExchangeSpec),
    Queue(QueueSpec),
    Binding {
        queue: String,
        exchange: String,
        routing_key: String,
    },
}

impl AmqpBroker {
    /// Create a broker for the given RabbitMQ URL. No connection is made until first use.
    pub fn new(url: String, call_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(AmqpInner {
                url,
                call_timeout,
                connection: RwLock::new(None),
                channel: RwLock::new(None),
                replay: Mutex::new(ReplayLog::default()),
            }),
        }
    }

    /// Ensure we have a valid connection and channel.
    async fn ensure_connected(&self) -> Result<Channel, BrokerError> {
        {
            let channel = self.inner.channel.read().await;
            if let Some(ch) = channel.as_ref() {
                if ch.status().connected() {
                    return Ok(ch.clone());
                }
            }
        }

        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        // Double-check after acquiring write lock
        if let Some(ch) = channel.as_ref() {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
        }

        let fresh = !matches!(connection.as_ref(), Some(conn) if conn.status().connected());
        if fresh {
            info!("rabbitmq_connecting");
            let conn = Connection::connect(&self.inner.url, ConnectionProperties::default())
                .await
                .map_err(map_lapin_error)?;
            info!("rabbitmq_connected");
            *connection = Some(conn);
            self.replay_log().connection_opened();
        }

        let conn = connection
            .as_ref()
            .ok_or_else(|| BrokerError::Unavailable("connection missing".to_string()))?;

        let ch = conn.create_channel().await.map_err(map_lapin_error)?;
        ch.confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(map_lapin_error)?;

        info!(channel_id = ch.id(), "rabbitmq_channel_created");

        let pending = self.replay_log().pending();
        if let Some(replay) = pending {
            for declaration in &replay {
                apply(&ch, declaration).await?;
            }
            self.replay_log().replayed();
            if !replay.is_empty() {
                info!(declarations = replay.len(), "rabbitmq_topology_restored");
            }
        }

        *channel = Some(ch.clone());

        Ok(ch)
    }

    fn replay_log(&self) -> MutexGuard<'_, ReplayLog> {
        self.inner.replay.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `fut` under the per-call timeout.
    async fn bounded<T, F>(&self, fut: F) -> Result<T, BrokerError>
    where
        F: Future<Output = Result<T, BrokerError>> + Send,
    {
        match tokio::time::timeout(self.inner.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                // Channel state is unknown after an abandoned call
                self.inner.channel.write().await.take();
                warn!(timeout_ms = self.inner.call_timeout.as_millis() as u64, "rabbitmq_call_timeout");
                Err(BrokerError::Timeout(self.inner.call_timeout))
            }
        }
    }

    async fn declare(&self, declaration: Declaration) -> Result<(), BrokerError> {
        self.bounded(async {
            let channel = self.ensure_connected().await?;
            apply(&channel, &declaration).await
        })
        .await?;

        self.replay_log().remember(declaration);
        Ok(())
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        self.declare(Declaration::Exchange(spec.clone())).await
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        self.declare(Declaration::Queue(spec.clone())).await
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.declare(Declaration::Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        })
        .await
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        self.bounded(async {
            let channel = self.ensure_connected().await?;

            let mut properties = BasicProperties::default()
                .with_delivery_mode(if message.persistent { 2 } else { 1 });
            if let Some(content_type) = &message.content_type {
                properties = properties.with_content_type(content_type.as_str().into());
            }

            let confirmation = channel
                .basic_publish(
                    &message.exchange,
                    &message.routing_key,
                    BasicPublishOptions::default(),
                    &message.payload,
                    properties,
                )
                .await
                .map_err(map_lapin_error)?
                .await
                .map_err(map_lapin_error)?;

            if confirmation.is_nack() {
                return Err(BrokerError::Rejected(format!(
                    "broker nacked message for exchange '{}'",
                    message.exchange
                )));
            }

            debug!(
                exchange = %message.exchange,
                body_length = message.payload.len(),
                "rabbitmq_publish_confirmed"
            );
            Ok(())
        })
        .await
    }

    /// Close the connection gracefully.
    async fn close(&self) {
        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        if let Some(ch) = channel.take() {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        }

        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!("rabbitmq_session_closed");
    }
}

/// Send one declaration over `channel`.
async fn apply(channel: &Channel, declaration: &Declaration) -> Result<(), BrokerError> {
    match declaration {
        Declaration::Exchange(spec) => {
            channel
                .exchange_declare(
                    &spec.name,
                    lapin_kind(spec.kind),
                    ExchangeDeclareOptions {
                        durable: spec.durable,
                        auto_delete: spec.auto_delete,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(map_lapin_error)?;

            info!(exchange = %spec.name, kind = %spec.kind, durable = spec.durable, "rabbitmq_exchange_declared");
        }
        Declaration::Queue(spec) => {
            channel
                .queue_declare(
                    &spec.name,
                    QueueDeclareOptions {
                        durable: spec.durable,
                        ..Default::default()
                    },
                    queue_arguments(spec),
                )
                .await
                .map_err(map_lapin_error)?;

            info!(queue = %spec.name, durable = spec.durable, max_length = spec.max_length, "rabbitmq_queue_declared");
        }
        Declaration::Binding {
            queue,
            exchange,
            routing_key,
        } => {
            channel
                .queue_bind(
                    queue,
                    exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(map_lapin_error)?;

            info!(queue = %queue, exchange = %exchange, routing_key = %routing_key, "rabbitmq_queue_bound");
        }
    }
    Ok(())
}

fn lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

/// Arguments sent with a queue declaration. The bound travels as a signed 32-bit int.
fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut arguments = FieldTable::default();
    let bound = i32::try_from(spec.max_length).unwrap_or(i32::MAX);
    arguments.insert(MAX_LENGTH_ARG.into(), AMQPValue::LongInt(bound));
    arguments
}

/// Translate lapin failures into the broker taxonomy.
fn map_lapin_error(err: lapin::Error) -> BrokerError {
    match &err {
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                BrokerError::Conflict(err.to_string())
            }
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => BrokerError::NotFound(err.to_string()),
            _ => BrokerError::Unavailable(err.to_string()),
        },
        _ => BrokerError::Unavailable(err.to_string()),
    }
}
