//! Port Interfaces
//!
//! Defines the interfaces (ports) between the reconnect supervisor and the
//! outside world following the Hexagonal Architecture pattern. These are the
//! contracts that infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `BrokerSubscription`: one attempt to attach to the broker fan-out exchange
//! - `BroadcastPort`: message distribution to connected clients
//!
//! ## Signals (Inbound)
//!
//! - `DemandEvent`: client registry occupancy transitions

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::domain::news::BroadcastMessage;

// =============================================================================
// Demand Signals
// =============================================================================

/// Registry occupancy transition sent to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemandEvent {
    /// The registry went from empty to non-empty.
    ClientsAvailable,
    /// The registry became empty.
    ClientsGone,
}

// =============================================================================
// Broadcast Port
// =============================================================================

/// Outcome of a single fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Clients that received the message.
    pub delivered: usize,
    /// Clients whose delivery failed and who were removed.
    pub failed: usize,
}

/// Distributes normalized messages to every connected client.
#[async_trait]
pub trait BroadcastPort: Send + Sync {
    /// Deliver `message` to all currently connected clients.
    ///
    /// Per-client failures never surface here; failing clients are dropped.
    async fn broadcast(&self, message: &BroadcastMessage) -> BroadcastReport;

    /// Number of currently connected clients.
    fn client_count(&self) -> usize;
}

// =============================================================================
// Broker Subscription Port
// =============================================================================

/// How a subscription attempt ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEnd {
    /// The cancellation token fired; resources were released.
    Cancelled,
    /// The broker closed the consumer.
    Closed,
}

/// Errors from a single subscription attempt.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Broker unreachable or authentication rejected.
    #[error("broker connection failed: {0}")]
    Connection(String),

    /// The broadcast exchange does not exist.
    #[error("exchange '{0}' not found")]
    Topology(String),

    /// Channel or consumer failed after the connection was established.
    #[error("broker channel error: {0}")]
    Channel(String),

    /// Settings could not be loaded at attempt start.
    #[error("broker configuration error: {0}")]
    Config(String),
}

impl BrokerError {
    /// Short label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Topology(_) => "topology",
            Self::Channel(_) => "channel",
            Self::Config(_) => "config",
        }
    }
}

/// One attempt to attach to the broker broadcast exchange.
///
/// Implementations connect, declare an exclusive auto-delete queue, bind it,
/// send on `ready` once consuming, and forward each message to `sink` until
/// the broker closes or `cancel` fires. They must not retry internally.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerSubscription: Send + Sync {
    /// Run the subscription until closure, failure or cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if connecting, declaring topology or consuming
    /// fails.
    async fn run(
        &self,
        sink: Arc<dyn BroadcastPort>,
        ready: oneshot::Sender<()>,
        cancel: CancellationToken,
    ) -> Result<SubscriptionEnd, BrokerError>;
}
