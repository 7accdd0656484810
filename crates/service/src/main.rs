//! Saga relay entry point.

use std::sync::Arc;

use messaging::{AmqpBroker, ConnectionState, ConnectionSupervisor, MessagingClient};
use saga_store::PostgresSagaStore;
use service::config::Config;
use service::error::{Result, ServiceError};
use service::relay::SagaRelay;
use service::{HealthState, routes};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::{oneshot, watch};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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

/// Resolves with the reason once the broker connection is terminally lost.
async fn connection_terminated(mut connection: watch::Receiver<ConnectionState>) -> String {
    let terminal = connection
        .wait_for(ConnectionState::is_terminal)
        .await
        .ok()
        .map(|state| match &*state {
            ConnectionState::Terminal { reason } => reason.clone(),
            other => other.as_str().to_string(),
        });

    match terminal {
        Some(reason) => reason,
        // The supervisor stopped first.
        None => std::future::pending().await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;
    routes::metrics::describe();

    // 3. Saga store
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    let store = PostgresSagaStore::new(pool);
    store.run_migrations().await?;

    // 4. Broker connection, supervised per the configured loss policy
    let broker = Arc::new(AmqpBroker::connect(config.amqp_url.clone()).await?);
    let client = MessagingClient::with_topology_config(
        config.app_id.as_str(),
        broker.clone(),
        config.topology.clone(),
    );
    let supervisor = ConnectionSupervisor::spawn(client.clone(), config.connection_loss.clone());

    // 5. Saga relay
    let relay = Arc::new(SagaRelay::start(&config.saga, client.clone(), store).await?);
    relay.subscribe().await?;
    let resubscriber = Arc::clone(&relay).spawn_resubscriber(supervisor.subscribe_state());
    metrics::gauge!("broker_connected").set(1.0);

    // 6. Build the application
    let health = HealthState {
        app_id: config.app_id.clone(),
        connection: supervisor.subscribe_state(),
    };
    let app = service::create_app(health, metrics_handle);

    // 7. Start server, stopping on a signal or a terminal connection loss
    let addr = config.addr();
    tracing::info!(%addr, app_id = %config.app_id, "starting saga service");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let (terminated_tx, terminated_rx) = oneshot::channel();
    let connection = supervisor.subscribe_state();
    let shutdown = async move {
        tokio::select! {
            () = shutdown_signal() => {}
            reason = connection_terminated(connection) => {
                tracing::error!(%reason, "broker connection lost, shutting down");
                let _ = terminated_tx.send(reason);
            }
        }
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    // 8. Stop consuming, letting in-flight handlers settle their messages
    resubscriber.abort();
    client.clean_up().await;
    supervisor.shutdown().await;
    if let Err(err) = broker.close().await {
        tracing::warn!(error = %err, "failed to close broker connection");
    }

    if let Ok(reason) = terminated_rx.await {
        return Err(ServiceError::ConnectionLost(reason));
    }
    tracing::info!("server shut down gracefully");
    Ok(())
}
