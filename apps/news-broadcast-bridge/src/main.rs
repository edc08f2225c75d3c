//! News Broadcast Bridge Binary
//!
//! Starts the live news WebSocket bridge.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin news-broadcast-bridge
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `RABBIT_HOST`: Broker host
//! - `RABBIT_USER`: Broker username
//! - `RABBIT_PASSWORD`: Broker password
//!
//! ## Optional
//! - `RABBIT_PORT`: Broker port (default: 5672)
//! - `RABBIT_VHOST`: Broker virtual host (default: /)
//! - `NEWS_EXCHANGE`: Fan-out exchange (default: xbuddy.broadcast)
//! - `NEWS_PREFETCH_COUNT`: Consumer prefetch (default: 10)
//! - `NEWS_CONNECTION_NAME`: AMQP connection name (default: xbuddy-websocket-client)
//! - `NEWS_RECONNECT_DELAY_INITIAL_MS`: First retry delay (default: 1000)
//! - `NEWS_RECONNECT_DELAY_MAX_SECS`: Retry delay cap (default: 30)
//! - `NEWS_RECONNECT_JITTER`: Retry jitter fraction (default: 0.1)
//! - `NEWS_MAX_RECONNECT_ATTEMPTS`: Consecutive failures before giving up, 0 = unlimited (default: 10)
//! - `NEWS_TEARDOWN_GRACE_SECS`: Subscription release grace period (default: 5)
//! - `NEWS_CLIENT_QUEUE_CAPACITY`: Per-client outbound queue (default: 256)
//! - `NEWS_CLIENT_SEND_TIMEOUT_MS`: Per-client send timeout (default: 5000)
//! - `NEWS_HTTP_PORT`: WebSocket and status port (default: 8000)
//! - `NEWS_HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: Service name (default: xbuddy-news-bridge)
//! - `RUST_LOG`: Log level (default: info)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use news_broadcast_bridge::infrastructure::metrics;
use news_broadcast_bridge::infrastructure::telemetry;
use news_broadcast_bridge::{
    AmqpSubscription, BridgeConfig, BroadcastPort, BrokerSubscription, ClientRegistry,
    HealthServer, HealthServerState, ReconnectSupervisor, RegistryConfig, StreamServer,
    StreamServerState, SupervisorConfig, SupervisorHandle, init_metrics,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting News Broadcast Bridge");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = BridgeConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Client registry and its demand signal
    let (registry, demand_rx) = ClientRegistry::new(RegistryConfig::from(config.clients));
    let registry = Arc::new(registry);

    // Broker subscription supervisor
    let sink: Arc<dyn BroadcastPort> = registry.clone();
    let subscription: Arc<dyn BrokerSubscription> = Arc::new(AmqpSubscription::from_env());
    let (supervisor, supervisor_handle) = ReconnectSupervisor::new(
        SupervisorConfig::from_settings(&config.reconnect),
        subscription,
        sink,
    );
    let supervisor_task = tokio::spawn(supervisor.run(demand_rx, shutdown_token.clone()));

    tokio::spawn(record_state_metrics(
        supervisor_handle.clone(),
        shutdown_token.clone(),
    ));

    // Stream server; a bind failure is fatal
    let stream_addr = SocketAddr::from(([0, 0, 0, 0], config.server.http_port));
    let stream_listener = TcpListener::bind(stream_addr).await?;
    let stream_server = StreamServer::new(
        config.server.http_port,
        StreamServerState::new(
            Arc::clone(&registry),
            supervisor_handle.clone(),
            config.broker.exchange.clone(),
        ),
        shutdown_token.clone(),
    );
    let stream_shutdown = shutdown_token.clone();
    tokio::spawn(async move {
        if let Err(e) = stream_server.serve(stream_listener).await {
            tracing::error!(error = %e, "Stream server error");
            stream_shutdown.cancel();
        }
    });

    // Health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        supervisor_handle,
        Arc::clone(&registry),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    let health_shutdown = shutdown_token.clone();
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
            health_shutdown.cancel();
        }
    });

    tracing::info!("News bridge ready");

    await_shutdown(shutdown_token).await;

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, supervisor_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Supervisor task failed"),
        Err(_) => tracing::warn!("Supervisor did not stop before the shutdown timeout"),
    }

    tracing::info!("News bridge stopped");
    Ok(())
}

/// Mirror supervisor state and the reconnect total into metrics.
async fn record_state_metrics(supervisor: SupervisorHandle, shutdown: CancellationToken) {
    let mut states = supervisor.subscribe();
    loop {
        let state = *states.borrow_and_update();
        metrics::set_subscription_state(&state);
        metrics::set_reconnects_total(supervisor.reconnects());

        tokio::select! {
            () = shutdown.cancelled() => break,
            changed = states.changed() => if changed.is_err() { break },
        }
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &BridgeConfig) {
    tracing::info!(
        broker = %config.broker.redacted_uri(),
        exchange = %config.broker.exchange,
        http_port = config.server.http_port,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        prefetch = config.broker.prefetch_count,
        max_attempts = config.reconnect.max_attempts,
        delay_initial_ms = u64::try_from(config.reconnect.delay_initial.as_millis()).unwrap_or(u64::MAX),
        delay_max_secs = config.reconnect.delay_max.as_secs(),
        client_queue = config.clients.queue_capacity,
        "Bridge tuning"
    );
}

/// Wait for shutdown signal (SIGTERM, SIGINT) or an internal cancellation.
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
        () = shutdown_token.cancelled() => {
            tracing::warn!("Server failure, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
