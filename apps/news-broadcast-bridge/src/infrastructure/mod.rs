//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the HTTP surfaces and ambient
//! services (configuration, metrics, telemetry).

/// RabbitMQ subscription adapter.
pub mod amqp;

/// Client registry and fan-out.
pub mod broadcast;

/// Configuration loaded from the environment.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Logging and OpenTelemetry tracing integration.
pub mod telemetry;

/// Client-facing WebSocket server.
pub mod websocket;
