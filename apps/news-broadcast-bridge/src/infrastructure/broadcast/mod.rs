//! Client Registry and Fan-out
//!
//! Tracks connected WebSocket clients and distributes broadcast messages to
//! all of them.
//!
//! # Architecture
//!
//! Each client owns a bounded `mpsc` queue drained by its socket task; the
//! registry keeps the sending half. A broadcast serializes the message once,
//! snapshots the registered senders (the lock is released before any send)
//! and pushes the frame to every queue concurrently. A closed queue or a send
//! that exceeds the configured timeout removes the client.
//!
//! Occupancy transitions (empty → non-empty, non-empty → empty) are reported
//! to the reconnect supervisor as [`DemandEvent`]s. Events are sent while the
//! registry lock is held so their order matches the order of transitions.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::ws::Utf8Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ClientSettings;
use crate::application::ports::{BroadcastPort, BroadcastReport, DemandEvent};
use crate::domain::news::BroadcastMessage;
use crate::infrastructure::metrics;

// =============================================================================
// Client Connection
// =============================================================================

/// Unique identifier for a connected client.
pub type ConnectionId = Uuid;

/// A serialized message ready to be written to a socket.
///
/// Clones share one buffer, so every client queue holds the same bytes.
pub type OutboundFrame = Utf8Bytes;

/// Why a frame could not be queued for a client.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The client's socket task has exited.
    #[error("client queue closed")]
    Closed,

    /// The client's queue stayed full for too long.
    #[error("client send timed out after {0:?}")]
    Timeout(Duration),
}

/// Sending half of one client's outbound queue.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    id: ConnectionId,
    tx: mpsc::Sender<OutboundFrame>,
}

impl ClientConnection {
    /// Create a connection with a fresh id and the receiving half of its queue.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    /// Connection id.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    async fn deliver(&self, frame: OutboundFrame, send_timeout: Duration) -> Result<(), DeliveryError> {
        match tokio::time::timeout(send_timeout, self.tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DeliveryError::Closed),
            Err(_) => Err(DeliveryError::Timeout(send_timeout)),
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Registry configuration.
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    /// Capacity of each client's outbound queue.
    pub queue_capacity: usize,
    /// Maximum time a single client send may wait for queue space.
    pub send_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            send_timeout: Duration::from_secs(5),
        }
    }
}

impl From<ClientSettings> for RegistryConfig {
    fn from(settings: ClientSettings) -> Self {
        Self {
            queue_capacity: settings.queue_capacity,
            send_timeout: settings.send_timeout,
        }
    }
}

/// Running totals since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastStats {
    /// Messages fanned out to at least one client.
    pub messages_broadcast: u64,
    /// Successful per-client deliveries.
    pub deliveries: u64,
    /// Failed per-client deliveries.
    pub delivery_failures: u64,
}

/// Set of connected streaming clients.
///
/// # Example
///
/// ```rust
/// use news_broadcast_bridge::infrastructure::broadcast::{ClientRegistry, RegistryConfig};
/// use news_broadcast_bridge::application::ports::DemandEvent;
///
/// let (registry, mut demand) = ClientRegistry::new(RegistryConfig::default());
///
/// let (id, _rx) = registry.open();
/// assert_eq!(demand.try_recv().unwrap(), DemandEvent::ClientsAvailable);
///
/// registry.remove(id);
/// assert_eq!(demand.try_recv().unwrap(), DemandEvent::ClientsGone);
/// ```
#[derive(Debug)]
pub struct ClientRegistry {
    connections: Mutex<HashMap<ConnectionId, ClientConnection>>,
    demand_tx: mpsc::UnboundedSender<DemandEvent>,
    config: RegistryConfig,
    messages_broadcast: AtomicU64,
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,
}

/// Shared client registry reference.
pub type SharedClientRegistry = Arc<ClientRegistry>;

impl ClientRegistry {
    /// Create an empty registry and the receiver for its demand events.
    #[must_use]
    pub fn new(config: RegistryConfig) -> (Self, mpsc::UnboundedReceiver<DemandEvent>) {
        let (demand_tx, demand_rx) = mpsc::unbounded_channel();
        let registry = Self {
            connections: Mutex::new(HashMap::new()),
            demand_tx,
            config,
            messages_broadcast: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
        };
        (registry, demand_rx)
    }

    /// Create a connection with the configured queue capacity and register it.
    pub fn open(&self) -> (ConnectionId, mpsc::Receiver<OutboundFrame>) {
        let (connection, rx) = ClientConnection::new(self.config.queue_capacity);
        let id = connection.id();
        self.add(connection);
        (id, rx)
    }

    /// Register a connection.
    ///
    /// Returns `false` if a connection with the same id is already present.
    pub fn add(&self, connection: ClientConnection) -> bool {
        let id = connection.id();
        let count = {
            let mut connections = self.connections.lock();
            if connections.contains_key(&id) {
                return false;
            }
            connections.insert(id, connection);
            if connections.len() == 1 {
                let _ = self.demand_tx.send(DemandEvent::ClientsAvailable);
            }
            connections.len()
        };

        metrics::set_connected_clients(count);
        tracing::debug!(connection_id = %id, clients = count, "Client registered");
        true
    }

    /// Deregister a connection. Removing an unknown id is a no-op.
    ///
    /// Returns `true` if the connection was present.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let count = {
            let mut connections = self.connections.lock();
            if connections.remove(&id).is_none() {
                return false;
            }
            if connections.is_empty() {
                let _ = self.demand_tx.send(DemandEvent::ClientsGone);
            }
            connections.len()
        };

        metrics::set_connected_clients(count);
        tracing::debug!(connection_id = %id, clients = count, "Client removed");
        true
    }

    /// Deliver `message` to every registered client.
    ///
    /// Clients whose delivery fails are removed. Never fails as a whole.
    pub async fn broadcast(&self, message: &BroadcastMessage) -> BroadcastReport {
        let targets: Vec<ClientConnection> = self.connections.lock().values().cloned().collect();
        if targets.is_empty() {
            tracing::trace!(kind = message.kind(), "No clients connected, dropping message");
            return BroadcastReport::default();
        }

        let frame: OutboundFrame = match serde_json::to_string(message) {
            Ok(json) => json.into(),
            Err(e) => {
                tracing::warn!(kind = message.kind(), error = %e, "Failed to serialize broadcast message");
                return BroadcastReport::default();
            }
        };

        let started = Instant::now();
        let send_timeout = self.config.send_timeout;
        let results = join_all(targets.iter().map(|connection| {
            let frame = frame.clone();
            async move { (connection.id(), connection.deliver(frame, send_timeout).await) }
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (id, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(connection_id = %id, error = %e, "Delivery failed, removing client");
                    self.remove(id);
                    report.failed += 1;
                }
            }
        }

        self.messages_broadcast.fetch_add(1, Ordering::Relaxed);
        self.deliveries
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.delivery_failures
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        metrics::record_deliveries(report.delivered, report.failed);
        metrics::record_fanout_duration(started.elapsed());
        tracing::debug!(
            kind = message.kind(),
            delivered = report.delivered,
            failed = report.failed,
            "Broadcast message"
        );
        report
    }

    /// Number of registered clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    /// Whether no clients are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// Whether `id` is registered.
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.lock().contains_key(&id)
    }

    /// Broadcast totals since the registry was created.
    #[must_use]
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_broadcast: self.messages_broadcast.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl BroadcastPort for ClientRegistry {
    async fn broadcast(&self, message: &BroadcastMessage) -> BroadcastReport {
        Self::broadcast(self, message).await
    }

    fn client_count(&self) -> usize {
        self.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
