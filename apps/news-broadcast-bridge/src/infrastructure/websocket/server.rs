//! News Stream HTTP Server
//!
//! Serves the live news WebSocket and its status endpoint.
//!
//! # Endpoints
//!
//! - `GET /api/v1/news/ws` - WebSocket upgrade; the server pushes JSON text
//!   frames and ignores anything the client sends
//! - `GET /api/v1/news/status` - subscription state and client count in the
//!   gateway response envelope

use std::net::SocketAddr;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::SupervisorHandle;
use crate::domain::subscription::SubscriptionSnapshot;
use crate::infrastructure::broadcast::SharedClientRegistry;

/// WebSocket endpoint path.
pub const WS_PATH: &str = "/api/v1/news/ws";

/// Status endpoint path.
pub const STATUS_PATH: &str = "/api/v1/news/status";

// =============================================================================
// Response Types
// =============================================================================

/// Standard gateway response envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    /// Zero on success.
    pub code: i32,
    /// Human readable result.
    pub msg: String,
    /// Payload.
    pub data: T,
}

impl<T> ApiResponse<T> {
    /// Successful response carrying `data`.
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            msg: "success".to_string(),
            data,
        }
    }
}

/// Payload of the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    /// Broker subscription state.
    #[serde(flatten)]
    pub subscription: SubscriptionSnapshot,
    /// Connected clients.
    pub clients: usize,
    /// Broadcast exchange the bridge consumes from.
    pub exchange: String,
}

// =============================================================================
// Server State
// =============================================================================

/// Shared state for the stream server.
#[derive(Debug, Clone)]
pub struct StreamServerState {
    registry: SharedClientRegistry,
    supervisor: SupervisorHandle,
    exchange: String,
}

impl StreamServerState {
    /// Create new stream server state.
    #[must_use]
    pub fn new(
        registry: SharedClientRegistry,
        supervisor: SupervisorHandle,
        exchange: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            supervisor,
            exchange: exchange.into(),
        }
    }

    fn status(&self) -> StreamStatus {
        StreamStatus {
            subscription: self.supervisor.state().into(),
            clients: self.registry.len(),
            exchange: self.exchange.clone(),
        }
    }
}

/// Build the stream router.
pub fn router(state: StreamServerState) -> Router {
    Router::new()
        .route(WS_PATH, get(ws_handler))
        .route(STATUS_PATH, get(status_handler))
        .with_state(state)
}

// =============================================================================
// Stream Server
// =============================================================================

/// HTTP server for streaming clients.
pub struct StreamServer {
    port: u16,
    state: StreamServerState,
    cancel: CancellationToken,
}

impl StreamServer {
    /// Create a new stream server.
    #[must_use]
    pub const fn new(port: u16, state: StreamServerState, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Bind the configured port and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `StreamServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), StreamServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| StreamServerError::BindFailed(self.port, e.to_string()))?;

        self.serve(listener).await
    }

    /// Serve on an already bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `StreamServerError::ServerFailed` if the HTTP server fails.
    pub async fn serve(self, listener: TcpListener) -> Result<(), StreamServerError> {
        let port = listener.local_addr().map_or(self.port, |addr| addr.port());
        tracing::info!(port, path = WS_PATH, "Stream server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| StreamServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Stream server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<StreamServerState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.registry))
}

async fn status_handler(State(state): State<StreamServerState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.status()))
}

/// Pump one client: drain its outbound queue into the socket and watch the
/// socket for close. The registry entry is removed on every exit path.
async fn handle_socket(socket: WebSocket, registry: SharedClientRegistry) {
    let (id, mut outbound) = registry.open();
    tracing::info!(connection_id = %id, clients = registry.len(), "News client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                // None: the registry dropped this client after a failed delivery.
                let Some(frame) = frame else { break };
                if ws_tx.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            incoming = ws_rx.next() => match incoming {
                // Pings are answered by the protocol layer; payloads are ignored.
                Some(Ok(Message::Text(_) | Message::Binary(_) | Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
            },
        }
    }

    registry.remove(id);
    let _ = ws_tx.close().await;
    tracing::info!(connection_id = %id, clients = registry.len(), "News client disconnected");
}

// =============================================================================
// Errors
// =============================================================================

/// Stream server errors.
#[derive(Debug, thiserror::Error)]
pub enum StreamServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
