//! Domain Layer - Core news stream types and logic.
//!
//! This layer contains the canonical outbound message types, the payload
//! normalizer and the subscription lifecycle states. Nothing here performs
//! I/O.

/// News message types and the broker payload normalizer.
pub mod news;

/// Broker subscription lifecycle states.
pub mod subscription;
