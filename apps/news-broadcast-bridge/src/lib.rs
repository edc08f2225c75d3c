#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! News Broadcast Bridge - Live News Fan-out
//!
//! Keeps a pool of client WebSocket connections open and, while at least one
//! client is connected, consumes the XBuddy RabbitMQ broadcast exchange and
//! forwards every message to all of them. Broker outages are retried with
//! capped exponential backoff without dropping clients.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Message types and lifecycle states
//!   - `news`: `NewsItem`, `BroadcastMessage` and the payload normalizer
//!   - `subscription`: `SubscriptionState`
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: `BrokerSubscription`, `BroadcastPort`, `DemandEvent`
//!   - `services`: `ReconnectSupervisor`, `BackoffPolicy`
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `amqp`: `lapin` subscription to the fan-out exchange
//!   - `broadcast`: `ClientRegistry` and per-client queues
//!   - `websocket`: axum WebSocket and status endpoints
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//!                      DemandEvent
//!   ClientRegistry ───────────────────► ReconnectSupervisor
//!      ▲      │                                │ starts / cancels
//!      │      │ per-client queues              ▼
//!      │      └──► WebSocket clients    AmqpSubscription ◄── RabbitMQ exchange
//!      │                                       │
//!      └──────────── broadcast ◄── normalize ◄─┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Message and state types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::news::{BroadcastMessage, NewsItem, NormalizeError, normalize};
pub use domain::subscription::{SubscriptionSnapshot, SubscriptionState};

// Ports and services
pub use application::ports::{
    BroadcastPort, BroadcastReport, BrokerError, BrokerSubscription, DemandEvent, SubscriptionEnd,
};
pub use application::services::{
    BackoffConfig, BackoffPolicy, ReconnectSupervisor, RetryDecision, SupervisorConfig,
    SupervisorHandle,
};

// Infrastructure config
pub use infrastructure::config::{
    BridgeConfig, BrokerSettings, ClientSettings, ConfigError, Credentials, ReconnectSettings,
    ServerSettings,
};

// Broker adapter
pub use infrastructure::amqp::AmqpSubscription;

// Client registry (for integration tests)
pub use infrastructure::broadcast::{
    BroadcastStats, ClientConnection, ClientRegistry, ConnectionId, RegistryConfig,
    SharedClientRegistry,
};

// HTTP servers
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};
pub use infrastructure::websocket::{StreamServer, StreamServerError, StreamServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
