//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `ReconnectSupervisor`: Starts, retries and stops the broker subscription
//! - `BackoffPolicy`: Capped exponential delays between attempts

pub mod backoff;
pub mod supervisor;

pub use backoff::{BackoffConfig, BackoffPolicy, RetryDecision};
pub use supervisor::{ReconnectSupervisor, SupervisorConfig, SupervisorHandle};
