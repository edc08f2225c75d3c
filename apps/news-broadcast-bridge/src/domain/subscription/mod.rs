//! Subscription State
//!
//! Lifecycle states of the single broker subscription owned by the
//! reconnect supervisor.
//!
//! ```text
//!            ClientsAvailable            ready
//!   Idle ───────────────────► Connecting ──────► Active
//!    ▲                          ▲   │              │
//!    │                  delay   │   │ failed/closed│
//!    │                  elapsed │   ▼              ▼
//!    │                        Backoff(n, delay) ◄──┘
//!    │                             │ n reaches max
//!    │                             ▼
//!    │                         Exhausted
//!    │
//!  any state ── ClientsGone ──► Stopped
//! ```

use std::time::Duration;

use serde::Serialize;

/// State of the broker subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionState {
    /// Never started.
    #[default]
    Idle,
    /// A subscription attempt is opening the broker connection.
    Connecting,
    /// The consume loop is running.
    Active,
    /// Waiting before the next attempt.
    Backoff {
        /// Consecutive failure count that led to this wait (1-based).
        attempt: u32,
        /// Delay before the next attempt.
        delay: Duration,
    },
    /// Retry budget spent; waiting for a new client to arrive.
    Exhausted,
    /// Stopped because no clients remain (or the process is shutting down).
    Stopped,
}

impl SubscriptionState {
    /// State name for logs, metrics and status responses.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Backoff { .. } => "backoff",
            Self::Exhausted => "exhausted",
            Self::Stopped => "stopped",
        }
    }

    /// Numeric code exported as a metrics gauge.
    #[must_use]
    pub const fn code(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Connecting => 1,
            Self::Active => 2,
            Self::Backoff { .. } => 3,
            Self::Exhausted => 4,
            Self::Stopped => 5,
        }
    }
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backoff { attempt, delay } => {
                write!(f, "backoff(attempt={attempt}, delay={}ms)", delay.as_millis())
            }
            other => f.write_str(other.as_str()),
        }
    }
}

/// Serializable snapshot of [`SubscriptionState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionSnapshot {
    /// State name.
    pub state: &'static str,
    /// Attempt number while backing off.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    /// Pending delay in milliseconds while backing off.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_in_ms: Option<u64>,
}

impl From<SubscriptionState> for SubscriptionSnapshot {
    fn from(state: SubscriptionState) -> Self {
        let (attempt, retry_in_ms) = match state {
            SubscriptionState::Backoff { attempt, delay } => (
                Some(attempt),
                Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)),
            ),
            _ => (None, None),
        };
        Self {
            state: state.as_str(),
            attempt,
            retry_in_ms,
        }
    }
}
