//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the reconnect supervisor and the port interfaces
//! that define how it interacts with the broker and the connected clients.

/// Port interfaces for external systems (broker, client fan-out).
pub mod ports;

/// Application services for broker subscription supervision.
pub mod services;
