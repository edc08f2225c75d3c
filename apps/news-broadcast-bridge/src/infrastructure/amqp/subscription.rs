//! RabbitMQ Subscription
//!
//! One [`BrokerSubscription::run`] call is one attempt: connect, declare,
//! bind, consume, release. Retrying is the supervisor's job.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicQosOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{Forwarded, forward_payload};
use crate::application::ports::{BroadcastPort, BrokerError, BrokerSubscription, SubscriptionEnd};
use crate::infrastructure::config::{BrokerSettings, ConfigError};
use crate::infrastructure::metrics;

/// Reply code sent when closing channels and connections.
const REPLY_SUCCESS: u16 = 200;

/// Produces broker settings at the start of every attempt.
pub type SettingsLoader = Arc<dyn Fn() -> Result<BrokerSettings, ConfigError> + Send + Sync>;

/// [`BrokerSubscription`] backed by a RabbitMQ fan-out exchange.
#[derive(Clone)]
pub struct AmqpSubscription {
    load_settings: SettingsLoader,
}

impl AmqpSubscription {
    /// Subscription that re-reads the environment before each attempt, so
    /// rotated credentials are picked up on reconnect.
    #[must_use]
    pub fn from_env() -> Self {
        Self::with_loader(Arc::new(BrokerSettings::from_env))
    }

    /// Subscription that always uses `settings`.
    #[must_use]
    pub fn with_settings(settings: BrokerSettings) -> Self {
        Self::with_loader(Arc::new(move || Ok(settings.clone())))
    }

    /// Subscription with a custom settings source.
    #[must_use]
    pub fn with_loader(load_settings: SettingsLoader) -> Self {
        Self { load_settings }
    }

    async fn attempt(
        &self,
        sink: Arc<dyn BroadcastPort>,
        ready: oneshot::Sender<()>,
        cancel: CancellationToken,
    ) -> Result<SubscriptionEnd, BrokerError> {
        let settings = (self.load_settings)().map_err(|e| BrokerError::Config(e.to_string()))?;

        tracing::info!(
            uri = %settings.redacted_uri(),
            connection_name = %settings.connection_name,
            "Connecting to broker"
        );

        let Some(connection) = until_cancelled(&cancel, connect(&settings)).await else {
            return Ok(SubscriptionEnd::Cancelled);
        };
        let connection = connection?;

        let result =
            Self::consume(&connection, &settings, sink.as_ref(), ready, &cancel).await;

        if let Err(e) = connection.close(REPLY_SUCCESS, "subscription released").await {
            tracing::debug!(error = %e, "Connection already closed");
        }
        tracing::debug!(outcome = ?result, "Broker connection released");
        result
    }

    async fn consume(
        connection: &Connection,
        settings: &BrokerSettings,
        sink: &dyn BroadcastPort,
        ready: oneshot::Sender<()>,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionEnd, BrokerError> {
        let Some(channel) = until_cancelled(cancel, connection.create_channel()).await else {
            return Ok(SubscriptionEnd::Cancelled);
        };
        let channel = channel.map_err(|e| BrokerError::Channel(e.to_string()))?;

        let result = match until_cancelled(cancel, declare_and_consume(&channel, settings)).await {
            None => Ok(SubscriptionEnd::Cancelled),
            Some(Err(e)) => Err(e),
            Some(Ok(consumer)) => {
                let _ = ready.send(());
                tracing::info!(
                    exchange = %settings.exchange,
                    prefetch = settings.prefetch_count,
                    "Consuming from broadcast exchange"
                );
                pump(consumer, sink, cancel).await
            }
        };

        if let Err(e) = channel.close(REPLY_SUCCESS, "subscription released").await {
            tracing::debug!(error = %e, "Channel already closed");
        }
        result
    }
}

impl std::fmt::Debug for AmqpSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpSubscription").finish_non_exhaustive()
    }
}

#[async_trait]
impl BrokerSubscription for AmqpSubscription {
    async fn run(
        &self,
        sink: Arc<dyn BroadcastPort>,
        ready: oneshot::Sender<()>,
        cancel: CancellationToken,
    ) -> Result<SubscriptionEnd, BrokerError> {
        let result = self.attempt(sink, ready, cancel).await;
        if let Err(e) = &result {
            metrics::record_subscription_error(e.kind());
        }
        result
    }
}

// =============================================================================
// Protocol Steps
// =============================================================================

async fn connect(settings: &BrokerSettings) -> Result<Connection, BrokerError> {
    let properties = ConnectionProperties::default()
        .with_executor(tokio_executor_trait::Tokio::current())
        .with_connection_name(settings.connection_name.clone().into());

    Connection::connect_uri(settings.amqp_uri(), properties)
        .await
        .map_err(|e| BrokerError::Connection(e.to_string()))
}

async fn declare_and_consume(
    channel: &Channel,
    settings: &BrokerSettings,
) -> Result<Consumer, BrokerError> {
    channel
        .basic_qos(settings.prefetch_count, BasicQosOptions::default())
        .await
        .map_err(|e| BrokerError::Channel(e.to_string()))?;

    channel
        .exchange_declare(
            &settings.exchange,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                passive: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| {
            if is_not_found(&e) {
                BrokerError::Topology(settings.exchange.clone())
            } else {
                BrokerError::Channel(e.to_string())
            }
        })?;

    let queue = channel
        .queue_declare(
            "",
            QueueDeclareOptions {
                exclusive: true,
                auto_delete: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::Channel(e.to_string()))?;

    channel
        .queue_bind(
            queue.name().as_str(),
            &settings.exchange,
            "",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::Channel(e.to_string()))?;

    tracing::debug!(queue = %queue.name(), exchange = %settings.exchange, "Queue bound");

    let consumer_tag = format!("{}-{}", settings.connection_name, Uuid::new_v4());
    channel
        .basic_consume(
            queue.name().as_str(),
            &consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::Channel(e.to_string()))
}

/// Forward deliveries until the consumer ends or `cancel` fires.
async fn pump(
    mut consumer: Consumer,
    sink: &dyn BroadcastPort,
    cancel: &CancellationToken,
) -> Result<SubscriptionEnd, BrokerError> {
    loop {
        let delivery = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(SubscriptionEnd::Cancelled),
            next = consumer.next() => next,
        };

        let delivery = match delivery {
            None => return Ok(SubscriptionEnd::Closed),
            Some(Err(e)) => return Err(BrokerError::Channel(e.to_string())),
            Some(Ok(delivery)) => delivery,
        };

        if let Forwarded::Broadcast(report) = forward_payload(&delivery.data, sink).await {
            tracing::trace!(
                delivery_tag = delivery.delivery_tag,
                delivered = report.delivered,
                failed = report.failed,
                "Delivery forwarded"
            );
        }

        delivery
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;
    }
}

async fn until_cancelled<T>(cancel: &CancellationToken, step: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        value = step => Some(value),
    }
}

fn is_not_found(error: &lapin::Error) -> bool {
    matches!(
        error,
        lapin::Error::ProtocolError(amqp)
            if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND))
    )
}
