//! Transaction ingest server.
//!
//! Boots in two phases:
//! 1. Declare the exchange, the bounded queue and the binding (fatal on failure)
//! 2. Install the publisher, bind the listener and serve `POST /post-data`

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use txn_ingest::topology::RetryPolicy;
use txn_ingest::web::router;
use txn_ingest::{
    AmqpBroker, AppState, Broker, BrokerBackend, Config, InMemoryBroker, Publisher,
    TopologyManager, TopologyPlan,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("ingest_starting");

    // Load configuration
    let config = Config::from_env().context("Invalid configuration")?;
    config.validate().context("Invalid configuration")?;
    info!(
        broker = ?config.broker_backend,
        broker_endpoint = %config.amqp_endpoint(),
        host = %config.host,
        port = config.port,
        exchange = %config.exchange_name,
        exchange_type = %config.exchange_kind,
        queue = %config.queue_name,
        queue_max_length = config.queue_max_length,
        "config_loaded"
    );

    let broker: Arc<dyn Broker> = match config.broker_backend {
        BrokerBackend::Amqp => Arc::new(AmqpBroker::new(
            config.amqp_url.clone(),
            config.broker_timeout(),
        )),
        BrokerBackend::Memory => Arc::new(InMemoryBroker::new()),
    };

    let state = AppState::new(config.clone());

    // Phase one: topology must exist before any request is accepted
    let manager = TopologyManager::new(broker.clone(), TopologyPlan::from_config(&config))
        .with_retry(RetryPolicy::from_config(&config));

    let topology = match manager.initialize().await {
        Ok(topology) => topology,
        Err(e) => {
            error!(error = %e, "ingest_startup_aborted");
            broker.close().await;
            return Err(e).context("Failed to establish broker topology");
        }
    };

    let publisher = Publisher::new(broker.clone(), topology).persistent(config.message_persistent);
    state.mark_ready(publisher);

    // Phase two: serve
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    info!(address = %addr, "ingest_listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Close broker session
    broker.close().await;

    info!("ingest_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("ingest_shutting_down");
}
