//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Messages**: broker messages received, broadcast and dropped
//! - **Clients**: connected clients, deliveries and delivery failures
//! - **Subscription**: supervisor state and reconnect attempts
//! - **Latency**: fan-out duration
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! functions are no-ops until [`init_metrics`] installs the recorder.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::subscription::SubscriptionState;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if another global recorder was installed first.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "news_bridge_messages_received_total",
        "Total messages consumed from the broker"
    );
    describe_counter!(
        "news_bridge_messages_broadcast_total",
        "Total normalized messages fanned out, by kind"
    );
    describe_counter!(
        "news_bridge_messages_dropped_total",
        "Total broker messages dropped before fan-out, by reason"
    );

    describe_counter!(
        "news_bridge_client_deliveries_total",
        "Total frames queued to clients"
    );
    describe_counter!(
        "news_bridge_client_delivery_failures_total",
        "Total failed client deliveries (client removed)"
    );
    describe_gauge!(
        "news_bridge_connected_clients",
        "Number of connected streaming clients"
    );

    describe_gauge!(
        "news_bridge_subscription_state",
        "Supervisor state code (0 idle, 1 connecting, 2 active, 3 backoff, 4 exhausted, 5 stopped)"
    );
    describe_counter!(
        "news_bridge_reconnects_total",
        "Total broker reconnection attempts scheduled"
    );
    describe_counter!(
        "news_bridge_subscription_errors_total",
        "Total broker subscription failures by type"
    );

    describe_histogram!(
        "news_bridge_fanout_seconds",
        "Time to deliver one message to every client"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Why a broker message never reached the fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Not UTF-8 or not JSON.
    Decode,
    /// JSON, but not an object.
    NotAnObject,
}

impl DropReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::NotAnObject => "not_an_object",
        }
    }
}

/// Record a message consumed from the broker.
pub fn record_message_received() {
    counter!("news_bridge_messages_received_total").increment(1);
}

/// Record a normalized message handed to the fan-out.
pub fn record_message_broadcast(kind: &'static str) {
    counter!("news_bridge_messages_broadcast_total", "kind" => kind).increment(1);
}

/// Record a dropped broker message.
pub fn record_message_dropped(reason: DropReason) {
    counter!("news_bridge_messages_dropped_total", "reason" => reason.as_str()).increment(1);
}

/// Record the outcome of one fan-out.
pub fn record_deliveries(delivered: usize, failed: usize) {
    counter!("news_bridge_client_deliveries_total").increment(delivered as u64);
    if failed > 0 {
        counter!("news_bridge_client_delivery_failures_total").increment(failed as u64);
    }
}

/// Update the connected client count.
#[allow(clippy::cast_precision_loss)]
pub fn set_connected_clients(count: usize) {
    gauge!("news_bridge_connected_clients").set(count as f64);
}

/// Update the supervisor state gauge.
pub fn set_subscription_state(state: &SubscriptionState) {
    gauge!("news_bridge_subscription_state").set(f64::from(state.code()));
}

/// Publish the running total of scheduled reconnection attempts.
pub fn set_reconnects_total(total: u64) {
    counter!("news_bridge_reconnects_total").absolute(total);
}

/// Record a failed subscription attempt.
pub fn record_subscription_error(error_type: &'static str) {
    counter!("news_bridge_subscription_errors_total", "error_type" => error_type).increment(1);
}

/// Record fan-out duration.
pub fn record_fanout_duration(duration: Duration) {
    histogram!("news_bridge_fanout_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_reason_as_str() {
        assert_eq!(DropReason::Decode.as_str(), "decode");
        assert_eq!(DropReason::NotAnObject.as_str(), "not_an_object");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_message_received();
        record_message_broadcast("news");
        record_message_dropped(DropReason::Decode);
        record_deliveries(3, 1);
        set_connected_clients(2);
        set_subscription_state(&SubscriptionState::Active);
        set_reconnects_total(4);
        record_subscription_error("connection");
        record_fanout_duration(Duration::from_millis(3));
    }
}
