//! Conversion worker entry point.
//!
//! Hosts the three background services of the sales backend: the
//! outbox processor, the resume sweeper and the retention janitors.
//! Conversions themselves are initiated by the API tier; this process
//! makes sure they finish and that their events reach the broker.

mod config;
mod directories;

use std::sync::Arc;
use std::time::Duration;

use conversion::{ConversionEngine, EngineConfig, ResumeSweeper, StepRegistry, SweeperConfig};
use messaging::{OutboxProcessor, ProcessorConfig, RabbitConfig, RabbitPublisher};
use store::PostgresStore;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::Config;
use crate::directories::{PgContactDirectory, PgCustomerDirectory};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .expect("failed to install Prometheus exporter");

    let store = Arc::new(
        PostgresStore::connect(&config.database_url, config.database_max_connections)
            .await
            .expect("failed to connect to database"),
    );
    store.run_migrations().await.expect("migrations failed");

    let publisher = Arc::new(
        RabbitPublisher::start(RabbitConfig {
            url: config.amqp_url.clone(),
            ..Default::default()
        })
        .await
        .expect("failed to connect to broker"),
    );

    let processor = Arc::new(OutboxProcessor::new(
        Arc::clone(&store),
        Arc::clone(&publisher),
        ProcessorConfig {
            poll_interval: config.outbox_poll,
            ..Default::default()
        },
    ));
    let processor_handle = processor.start();

    let customers = Arc::new(PgCustomerDirectory::new(store.pool().clone()));
    let contacts = Arc::new(PgContactDirectory::new(store.pool().clone()));
    let registry = StepRegistry::standard(customers, contacts, Duration::from_secs(10));
    let engine = Arc::new(ConversionEngine::new(
        Arc::clone(&store),
        registry,
        EngineConfig {
            stale_after: config.saga_stale_after,
            ..Default::default()
        },
    ));

    let sweeper = Arc::new(ResumeSweeper::new(
        engine,
        Arc::clone(&store),
        SweeperConfig {
            sweep_interval: config.sweep_interval,
            ..Default::default()
        },
    ));
    let sweeper_handle = sweeper.start();

    tracing::info!(metrics_port = config.metrics_port, "worker started");

    shutdown_signal().await;

    // Stop producers of outbox rows before the processor draining them.
    sweeper_handle.stop().await;
    processor_handle.stop().await;
    publisher.stop().await;

    tracing::info!("worker shut down gracefully");
}
