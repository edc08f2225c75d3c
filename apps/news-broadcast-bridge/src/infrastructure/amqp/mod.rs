//! AMQP Broker Adapter
//!
//! Implements the [`BrokerSubscription`](crate::application::ports::BrokerSubscription)
//! port against RabbitMQ using `lapin`.
//!
//! Each subscription attempt opens its own connection, declares a
//! server-named exclusive auto-delete queue, binds it to the fan-out
//! exchange and consumes until cancelled or closed. Nothing survives an
//! attempt, so the broker drops the queue as soon as the connection closes.
//!
//! # Message Flow
//!
//! ```text
//! exchange ──► exclusive queue ──► consumer ──► normalize ──► ClientRegistry
//!                                      ▲                           │
//!                                      └──────────── ack ◄─────────┘
//! ```

mod subscription;

pub use subscription::{AmqpSubscription, SettingsLoader};

use crate::application::ports::{BroadcastPort, BroadcastReport};
use crate::domain::news::{NormalizeError, normalize};
use crate::infrastructure::metrics::{self, DropReason};

/// What happened to one broker payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarded {
    /// Normalized and handed to the fan-out.
    Broadcast(BroadcastReport),
    /// Could not be normalized; acknowledged and discarded.
    Dropped(DropReason),
}

/// Normalize a broker payload and fan it out.
///
/// Payloads that fail normalization are logged and dropped; the caller acks
/// them either way.
pub async fn forward_payload(body: &[u8], sink: &dyn BroadcastPort) -> Forwarded {
    metrics::record_message_received();

    let message = match normalize(body) {
        Ok(message) => message,
        Err(e) => {
            let reason = match &e {
                NormalizeError::Decode(_) => DropReason::Decode,
                NormalizeError::NotAnObject(_) => DropReason::NotAnObject,
            };
            tracing::warn!(error = %e, bytes = body.len(), "Dropping undecodable broker message");
            metrics::record_message_dropped(reason);
            return Forwarded::Dropped(reason);
        }
    };

    metrics::record_message_broadcast(message.kind());
    Forwarded::Broadcast(sink.broadcast(&message).await)
}
