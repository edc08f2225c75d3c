//! Shared fixtures for integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use news_broadcast_bridge::infrastructure::amqp::forward_payload;
use news_broadcast_bridge::{
    BroadcastPort, BrokerError, BrokerSubscription, ClientRegistry, ReconnectSettings,
    ReconnectSupervisor, RegistryConfig, StreamServer, StreamServerState, SubscriptionEnd,
    SubscriptionState, SupervisorConfig, SupervisorHandle,
};

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Fake Broker
// =============================================================================

/// How one subscription attempt behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// Fail before signalling ready.
    Fail,
    /// Signal ready, then end as if the broker closed the consumer.
    Drop,
    /// Signal ready and forward published payloads until cancelled.
    Serve,
    /// Never signal ready; hold the attempt open until cancelled.
    Stall,
}

/// In-memory stand-in for the RabbitMQ exchange.
///
/// Payloads passed to [`FakeBroker::publish`] go through the same
/// normalize-and-broadcast path as real deliveries.
pub struct FakeBroker {
    script: Mutex<VecDeque<Attempt>>,
    fallback: Mutex<Attempt>,
    feed: broadcast::Sender<Vec<u8>>,
    attempts: AtomicUsize,
    live: AtomicUsize,
}

impl FakeBroker {
    pub fn new(script: impl IntoIterator<Item = Attempt>, fallback: Attempt) -> Arc<Self> {
        let (feed, _) = broadcast::channel(64);
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback: Mutex::new(fallback),
            feed,
            attempts: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
        })
    }

    pub fn serving() -> Arc<Self> {
        Self::new(Vec::new(), Attempt::Serve)
    }

    pub fn set_fallback(&self, attempt: Attempt) {
        *self.fallback.lock() = attempt;
    }

    pub fn publish(&self, body: impl Into<Vec<u8>>) {
        self.feed.send(body.into()).expect("no live subscription");
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerSubscription for FakeBroker {
    async fn run(
        &self,
        sink: Arc<dyn BroadcastPort>,
        ready: oneshot::Sender<()>,
        cancel: CancellationToken,
    ) -> Result<SubscriptionEnd, BrokerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let attempt = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| *self.fallback.lock());

        match attempt {
            Attempt::Fail => return Err(BrokerError::Connection("connection refused".into())),
            Attempt::Drop => {
                let _ = ready.send(());
                return Ok(SubscriptionEnd::Closed);
            }
            Attempt::Stall => {
                self.live.fetch_add(1, Ordering::SeqCst);
                cancel.cancelled().await;
                drop(ready);
                self.live.fetch_sub(1, Ordering::SeqCst);
                return Ok(SubscriptionEnd::Cancelled);
            }
            Attempt::Serve => {}
        }

        let mut feed = self.feed.subscribe();
        self.live.fetch_add(1, Ordering::SeqCst);
        let _ = ready.send(());

        let end = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break SubscriptionEnd::Cancelled,
                body = feed.recv() => match body {
                    Ok(body) => {
                        forward_payload(&body, sink.as_ref()).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break SubscriptionEnd::Closed,
                },
            }
        };

        self.live.fetch_sub(1, Ordering::SeqCst);
        Ok(end)
    }
}

// =============================================================================
// Bridge Harness
// =============================================================================

/// A running bridge wired to a [`FakeBroker`].
pub struct Bridge {
    pub addr: SocketAddr,
    pub registry: Arc<ClientRegistry>,
    pub supervisor: SupervisorHandle,
    pub broker: Arc<FakeBroker>,
    pub shutdown: CancellationToken,
    pub supervisor_task: tokio::task::JoinHandle<()>,
}

impl Bridge {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/api/v1/news/ws", self.addr)
    }

    pub async fn connect(&self) -> WsClient {
        let (ws, _) = tokio_tungstenite::connect_async(self.ws_url()).await.unwrap();
        ws
    }

    pub async fn wait_for_state(
        &self,
        predicate: impl FnMut(&SubscriptionState) -> bool,
    ) -> SubscriptionState {
        tokio::time::timeout(WAIT, self.supervisor.wait_for(predicate))
            .await
            .expect("timed out waiting for supervisor state")
            .expect("supervisor dropped")
    }

    pub async fn wait_for_clients(&self, count: usize) {
        eventually(|| self.registry.len() == count).await;
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Reconnect settings fast enough for tests.
pub fn fast_reconnect(max_attempts: u32) -> ReconnectSettings {
    ReconnectSettings {
        delay_initial: Duration::from_millis(20),
        delay_max: Duration::from_millis(80),
        jitter_factor: 0.0,
        max_attempts,
        teardown_grace: Duration::from_millis(500),
    }
}

/// Registry and supervisor wired to `broker`, without the HTTP server.
pub fn start_core(
    broker: &Arc<FakeBroker>,
    reconnect: &ReconnectSettings,
) -> (Arc<ClientRegistry>, SupervisorHandle, CancellationToken, tokio::task::JoinHandle<()>) {
    let (registry, demand) = ClientRegistry::new(RegistryConfig {
        queue_capacity: 64,
        send_timeout: Duration::from_millis(500),
    });
    let registry = Arc::new(registry);
    let sink: Arc<dyn BroadcastPort> = registry.clone();
    let subscription: Arc<dyn BrokerSubscription> = broker.clone();
    let (supervisor, handle) =
        ReconnectSupervisor::new(SupervisorConfig::from_settings(reconnect), subscription, sink);
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(supervisor.run(demand, shutdown.clone()));
    (registry, handle, shutdown, task)
}

/// Full bridge: registry, supervisor and stream server on an ephemeral port.
pub async fn start_bridge(broker: Arc<FakeBroker>, reconnect: ReconnectSettings) -> Bridge {
    let (registry, supervisor, shutdown, supervisor_task) = start_core(&broker, &reconnect);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = StreamServer::new(
        addr.port(),
        StreamServerState::new(Arc::clone(&registry), supervisor.clone(), "xbuddy.broadcast"),
        shutdown.clone(),
    );
    tokio::spawn(async move { server.serve(listener).await.unwrap() });

    Bridge {
        addr,
        registry,
        supervisor,
        broker,
        shutdown,
        supervisor_task,
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Poll `condition` until it holds or [`WAIT`] elapses.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {WAIT:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Next text frame parsed as JSON.
pub async fn next_json(ws: &mut WsClient) -> serde_json::Value {
    loop {
        let message = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Assert no text frame arrives within `window`.
pub async fn assert_silent(ws: &mut WsClient, window: Duration) {
    if let Ok(Some(Ok(Message::Text(text)))) = tokio::time::timeout(window, ws.next()).await {
        panic!("unexpected frame: {text}");
    }
}
