//! Reconnect Supervisor
//!
//! Owns the single broker subscription and ties its lifetime to client
//! demand: the first client starts it, the last client leaving stops it.
//! Failed or closed subscriptions are retried with capped exponential
//! backoff until the retry budget is spent.
//!
//! The supervisor runs as one task. It is the only writer of
//! [`SubscriptionState`]; everyone else observes it through a
//! [`SupervisorHandle`]. Registry transitions arrive as [`DemandEvent`]s on
//! an unbounded channel, so no signal is ever lost or reordered.
//!
//! Every wait (connect, consume, backoff sleep) is raced against the demand
//! channel and the shutdown token, so a stop request is never blocked.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backoff::{BackoffConfig, BackoffPolicy, RetryDecision};
use crate::application::ports::{
    BroadcastPort, BrokerError, BrokerSubscription, DemandEvent, SubscriptionEnd,
};
use crate::domain::subscription::SubscriptionState;

type AttemptResult = Result<SubscriptionEnd, BrokerError>;

// =============================================================================
// Configuration
// =============================================================================

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Reconnection backoff policy.
    pub backoff: BackoffConfig,
    /// How long a cancelled subscription may take to release broker
    /// resources before its task is aborted.
    pub teardown_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            teardown_grace: Duration::from_secs(5),
        }
    }
}

impl SupervisorConfig {
    /// Create configuration from `ReconnectSettings`.
    #[must_use]
    pub const fn from_settings(settings: &crate::ReconnectSettings) -> Self {
        Self {
            backoff: BackoffConfig::from_settings(settings),
            teardown_grace: settings.teardown_grace,
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Read-only view of the supervisor state.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    state_rx: watch::Receiver<SubscriptionState>,
    reconnects: Arc<AtomicU64>,
}

impl SupervisorHandle {
    /// Current state.
    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        *self.state_rx.borrow()
    }

    /// Reconnect attempts scheduled since startup.
    ///
    /// Incremented before the matching `Backoff` state is published, so a
    /// reader woken by that change always sees the new total.
    #[must_use]
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Acquire)
    }

    /// A receiver notified on every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SubscriptionState> {
        self.state_rx.clone()
    }

    /// Wait until the state satisfies `predicate`.
    ///
    /// Returns `None` if the supervisor has been dropped.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&SubscriptionState) -> bool,
    ) -> Option<SubscriptionState> {
        let mut rx = self.state_rx.clone();
        rx.wait_for(|state| predicate(state)).await.ok().map(|state| *state)
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Internal control phase, one per kind of wait.
#[derive(Debug, Clone, Copy)]
enum Phase {
    Dormant,
    Attempt,
    Backoff(Duration),
}

/// State machine driving the broker subscription.
pub struct ReconnectSupervisor {
    subscription: Arc<dyn BrokerSubscription>,
    sink: Arc<dyn BroadcastPort>,
    policy: BackoffPolicy,
    teardown_grace: Duration,
    state_tx: watch::Sender<SubscriptionState>,
    reconnects: Arc<AtomicU64>,
    has_clients: bool,
}

impl ReconnectSupervisor {
    /// Create a supervisor and its observation handle.
    #[must_use]
    pub fn new(
        config: SupervisorConfig,
        subscription: Arc<dyn BrokerSubscription>,
        sink: Arc<dyn BroadcastPort>,
    ) -> (Self, SupervisorHandle) {
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Idle);
        let reconnects = Arc::new(AtomicU64::new(0));
        let supervisor = Self {
            subscription,
            sink,
            policy: BackoffPolicy::new(config.backoff),
            teardown_grace: config.teardown_grace,
            state_tx,
            reconnects: Arc::clone(&reconnects),
            has_clients: false,
        };
        (
            supervisor,
            SupervisorHandle {
                state_rx,
                reconnects,
            },
        )
    }

    /// Run the control loop until `shutdown` fires or the demand channel
    /// closes. Leaves the state at `Stopped`.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<DemandEvent>,
        shutdown: CancellationToken,
    ) {
        tracing::info!(
            max_attempts = self.policy.config().max_attempts,
            "Reconnect supervisor started"
        );

        let mut phase = Phase::Dormant;
        loop {
            let next = match phase {
                Phase::Dormant => self.wait_for_demand(&mut events, &shutdown).await,
                Phase::Attempt => self.run_attempt(&mut events, &shutdown).await,
                Phase::Backoff(delay) => self.backoff(delay, &mut events, &shutdown).await,
            };
            match next {
                Some(p) => phase = p,
                None => break,
            }
        }

        self.set_state(SubscriptionState::Stopped);
        tracing::info!("Reconnect supervisor stopped");
    }

    async fn wait_for_demand(
        &mut self,
        events: &mut mpsc::UnboundedReceiver<DemandEvent>,
        shutdown: &CancellationToken,
    ) -> Option<Phase> {
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => return None,
                event = events.recv() => match event? {
                    DemandEvent::ClientsAvailable => {
                        self.has_clients = true;
                        self.policy.reset();
                        return Some(Phase::Attempt);
                    }
                    DemandEvent::ClientsGone => {
                        self.has_clients = false;
                        self.set_state(SubscriptionState::Stopped);
                    }
                },
            }
        }
    }

    async fn run_attempt(
        &mut self,
        events: &mut mpsc::UnboundedReceiver<DemandEvent>,
        shutdown: &CancellationToken,
    ) -> Option<Phase> {
        self.set_state(SubscriptionState::Connecting);
        tracing::info!(
            attempt = self.policy.failures() + 1,
            clients = self.sink.client_count(),
            "Starting broker subscription"
        );

        let cancel = shutdown.child_token();
        let (ready_tx, mut ready_rx) = oneshot::channel();
        let subscription = Arc::clone(&self.subscription);
        let sink = Arc::clone(&self.sink);
        let token = cancel.clone();
        let mut task: JoinHandle<AttemptResult> =
            tokio::spawn(async move { subscription.run(sink, ready_tx, token).await });
        let mut awaiting_ready = true;

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    self.teardown(&cancel, task).await;
                    return None;
                }
                event = events.recv() => match event {
                    None => {
                        self.teardown(&cancel, task).await;
                        return None;
                    }
                    Some(DemandEvent::ClientsGone) => {
                        self.has_clients = false;
                        tracing::info!("No clients remain, stopping broker subscription");
                        self.teardown(&cancel, task).await;
                        self.set_state(SubscriptionState::Stopped);
                        return Some(Phase::Dormant);
                    }
                    Some(DemandEvent::ClientsAvailable) => self.has_clients = true,
                },
                ready = &mut ready_rx, if awaiting_ready => {
                    awaiting_ready = false;
                    if ready.is_ok() {
                        self.policy.reset();
                        self.set_state(SubscriptionState::Active);
                        tracing::info!("Broker subscription active");
                    }
                }
                joined = &mut task => {
                    let outcome = joined.unwrap_or_else(|e| {
                        Err(BrokerError::Channel(format!("subscription task failed: {e}")))
                    });
                    if shutdown.is_cancelled() {
                        return None;
                    }
                    return Some(self.after_failure(&outcome));
                }
            }
        }
    }

    async fn backoff(
        &mut self,
        delay: Duration,
        events: &mut mpsc::UnboundedReceiver<DemandEvent>,
        shutdown: &CancellationToken,
    ) -> Option<Phase> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => return None,
                event = events.recv() => match event? {
                    DemandEvent::ClientsGone => {
                        self.has_clients = false;
                        tracing::info!("No clients remain, cancelling reconnect");
                        self.set_state(SubscriptionState::Stopped);
                        return Some(Phase::Dormant);
                    }
                    DemandEvent::ClientsAvailable => self.has_clients = true,
                },
                () = &mut sleep => {
                    if self.has_clients {
                        return Some(Phase::Attempt);
                    }
                    self.set_state(SubscriptionState::Stopped);
                    return Some(Phase::Dormant);
                }
            }
        }
    }

    fn after_failure(&mut self, outcome: &AttemptResult) -> Phase {
        match outcome {
            Ok(SubscriptionEnd::Closed) => tracing::warn!("Broker closed the subscription"),
            Ok(SubscriptionEnd::Cancelled) => {
                tracing::warn!("Broker subscription ended without a stop request");
            }
            Err(e) => tracing::warn!(error = %e, kind = e.kind(), "Broker subscription failed"),
        }

        if !self.has_clients {
            self.set_state(SubscriptionState::Stopped);
            return Phase::Dormant;
        }

        match self.policy.record_failure() {
            RetryDecision::Retry { attempt, delay } => {
                tracing::warn!(
                    attempt,
                    max_attempts = self.policy.config().max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Reconnecting to broker after backoff"
                );
                self.reconnects.fetch_add(1, Ordering::Release);
                self.set_state(SubscriptionState::Backoff { attempt, delay });
                Phase::Backoff(delay)
            }
            RetryDecision::Exhausted { attempts } => {
                tracing::error!(
                    attempts,
                    "Reached maximum reconnect attempts, waiting for new clients"
                );
                self.set_state(SubscriptionState::Exhausted);
                Phase::Dormant
            }
        }
    }

    async fn teardown(&self, cancel: &CancellationToken, mut task: JoinHandle<AttemptResult>) {
        cancel.cancel();

        match tokio::time::timeout(self.teardown_grace, &mut task).await {
            Ok(Ok(Ok(end))) => tracing::debug!(?end, "Broker subscription released"),
            Ok(Ok(Err(e))) => {
                tracing::debug!(error = %e, "Broker subscription errored during teardown");
            }
            Ok(Err(e)) => tracing::warn!(error = %e, "Broker subscription task failed"),
            Err(_) => {
                tracing::warn!(
                    grace_ms = u64::try_from(self.teardown_grace.as_millis()).unwrap_or(u64::MAX),
                    "Broker subscription did not stop in time, aborting"
                );
                task.abort();
            }
        }
    }

    fn set_state(&self, state: SubscriptionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Subscription state changed");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::time::timeout;

    use super::*;
    use crate::application::ports::{BroadcastReport, MockBrokerSubscription};
    use crate::domain::news::BroadcastMessage;

    const WAIT: Duration = Duration::from_secs(2);

    struct NullSink;

    #[async_trait]
    impl BroadcastPort for NullSink {
        async fn broadcast(&self, _message: &BroadcastMessage) -> BroadcastReport {
            BroadcastReport::default()
        }

        fn client_count(&self) -> usize {
            0
        }
    }

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Fail,
        Close,
        Serve,
        IgnoreCancel,
        /// Never becomes ready; releases only when cancelled.
        StallConnect,
    }

    #[derive(Default)]
    struct ScriptedSubscription {
        steps: Mutex<VecDeque<Step>>,
        attempts: AtomicUsize,
        released: AtomicUsize,
    }

    impl ScriptedSubscription {
        fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into_iter().collect()),
                ..Self::default()
            })
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        fn released(&self) -> usize {
            self.released.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BrokerSubscription for ScriptedSubscription {
        async fn run(
            &self,
            _sink: Arc<dyn BroadcastPort>,
            ready: oneshot::Sender<()>,
            cancel: CancellationToken,
        ) -> AttemptResult {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let step = self.steps.lock().pop_front().unwrap_or(Step::Serve);
            match step {
                Step::Fail => Err(BrokerError::Connection("connection refused".into())),
                Step::Close => {
                    let _ = ready.send(());
                    Ok(SubscriptionEnd::Closed)
                }
                Step::Serve => {
                    let _ = ready.send(());
                    cancel.cancelled().await;
                    self.released.fetch_add(1, Ordering::SeqCst);
                    Ok(SubscriptionEnd::Cancelled)
                }
                Step::IgnoreCancel => {
                    let _ = ready.send(());
                    std::future::pending().await
                }
                Step::StallConnect => {
                    cancel.cancelled().await;
                    drop(ready);
                    self.released.fetch_add(1, Ordering::SeqCst);
                    Ok(SubscriptionEnd::Cancelled)
                }
            }
        }
    }

    fn fast_config(max_attempts: u32, delay: Duration) -> SupervisorConfig {
        SupervisorConfig {
            backoff: BackoffConfig {
                initial_delay: delay,
                max_delay: delay * 4,
                multiplier: 2.0,
                jitter_factor: 0.0,
                max_attempts,
            },
            teardown_grace: Duration::from_millis(200),
        }
    }

    struct Running {
        events: mpsc::UnboundedSender<DemandEvent>,
        handle: SupervisorHandle,
        shutdown: CancellationToken,
        task: JoinHandle<()>,
    }

    fn start(config: SupervisorConfig, subscription: Arc<dyn BrokerSubscription>) -> Running {
        let (supervisor, handle) = ReconnectSupervisor::new(config, subscription, Arc::new(NullSink));
        let (events, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(supervisor.run(rx, shutdown.clone()));
        Running {
            events,
            handle,
            shutdown,
            task,
        }
    }

    async fn reach(handle: &SupervisorHandle, expected: SubscriptionState) {
        let reached = timeout(WAIT, handle.wait_for(|s| *s == expected)).await;
        assert!(
            matches!(reached, Ok(Some(_))),
            "state {expected} not reached, current {}",
            handle.state()
        );
    }

    #[tokio::test]
    async fn starts_idle_and_connects_on_first_client() {
        let sub = ScriptedSubscription::new([Step::Serve]);
        let run = start(fast_config(3, Duration::from_millis(10)), sub.clone());

        assert_eq!(run.handle.state(), SubscriptionState::Idle);

        run.events.send(DemandEvent::ClientsAvailable).unwrap();
        reach(&run.handle, SubscriptionState::Active).await;
        assert_eq!(sub.attempts(), 1);

        run.shutdown.cancel();
        timeout(WAIT, run.task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn clients_gone_cancels_active_subscription() {
        let sub = ScriptedSubscription::new([Step::Serve]);
        let run = start(fast_config(3, Duration::from_millis(10)), sub.clone());

        run.events.send(DemandEvent::ClientsAvailable).unwrap();
        reach(&run.handle, SubscriptionState::Active).await;

        run.events.send(DemandEvent::ClientsGone).unwrap();
        reach(&run.handle, SubscriptionState::Stopped).await;

        assert_eq!(sub.released(), 1);
        assert_eq!(sub.attempts(), 1);
    }

    #[tokio::test]
    async fn failure_backs_off_then_reconnects() {
        let sub = ScriptedSubscription::new([Step::Fail, Step::Fail, Step::Serve]);
        let run = start(fast_config(5, Duration::from_millis(10)), sub.clone());

        run.events.send(DemandEvent::ClientsAvailable).unwrap();
        reach(&run.handle, SubscriptionState::Active).await;

        assert_eq!(sub.attempts(), 3);
        assert_eq!(run.handle.reconnects(), 2);
    }

    #[tokio::test]
    async fn clients_gone_stops_a_pending_connect() {
        let sub = ScriptedSubscription::new([Step::StallConnect]);
        let run = start(fast_config(3, Duration::from_millis(10)), sub.clone());

        run.events.send(DemandEvent::ClientsAvailable).unwrap();
        reach(&run.handle, SubscriptionState::Connecting).await;

        run.events.send(DemandEvent::ClientsGone).unwrap();
        reach(&run.handle, SubscriptionState::Stopped).await;

        assert_eq!(sub.released(), 1);
        assert_eq!(sub.attempts(), 1);
        assert_eq!(run.handle.reconnects(), 0);
    }

    #[tokio::test]
    async fn reconnect_total_counts_every_scheduled_retry() {
        let sub = ScriptedSubscription::new([Step::Fail, Step::Close, Step::Fail, Step::Fail]);
        let run = start(fast_config(0, Duration::from_millis(1)), sub.clone());

        run.events.send(DemandEvent::ClientsAvailable).unwrap();
        let settled = timeout(
            WAIT,
            run.handle
                .wait_for(|s| *s == SubscriptionState::Active && sub.attempts() == 5),
        )
        .await;

        assert!(matches!(settled, Ok(Some(_))));
        assert_eq!(run.handle.reconnects(), 4);
    }

    #[tokio::test]
    async fn broker_close_is_retried() {
        let sub = ScriptedSubscription::new([Step::Close, Step::Serve]);
        let run = start(fast_config(5, Duration::from_millis(10)), sub.clone());

        run.events.send(DemandEvent::ClientsAvailable).unwrap();
        let active_again = timeout(
            WAIT,
            run.handle
                .wait_for(|s| *s == SubscriptionState::Active && sub.attempts() == 2),
        )
        .await;

        assert!(matches!(active_again, Ok(Some(_))));
    }

    #[tokio::test]
    async fn backoff_state_reports_attempt_and_delay() {
        let sub = ScriptedSubscription::new([Step::Fail]);
        let run = start(fast_config(5, Duration::from_secs(60)), sub.clone());

        run.events.send(DemandEvent::ClientsAvailable).unwrap();
        reach(
            &run.handle,
            SubscriptionState::Backoff {
                attempt: 1,
                delay: Duration::from_secs(60),
            },
        )
        .await;
    }

    #[tokio::test]
    async fn clients_gone_interrupts_backoff_sleep() {
        let sub = ScriptedSubscription::new([Step::Fail]);
        let run = start(fast_config(5, Duration::from_secs(60)), sub.clone());

        run.events.send(DemandEvent::ClientsAvailable).unwrap();
        reach(
            &run.handle,
            SubscriptionState::Backoff {
                attempt: 1,
                delay: Duration::from_secs(60),
            },
        )
        .await;

        run.events.send(DemandEvent::ClientsGone).unwrap();
        reach(&run.handle, SubscriptionState::Stopped).await;
        assert_eq!(sub.attempts(), 1);
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        // Without the reset the close would be the third consecutive failure.
        let sub = ScriptedSubscription::new([
            Step::Fail,
            Step::Fail,
            Step::Close,
            Step::Fail,
            Step::Serve,
        ]);
        let run = start(fast_config(3, Duration::from_millis(5)), sub.clone());

        run.events.send(DemandEvent::ClientsAvailable).unwrap();
        let settled = timeout(
            WAIT,
            run.handle.wait_for(|s| {
                *s == SubscriptionState::Exhausted
                    || (*s == SubscriptionState::Active && sub.attempts() == 5)
            }),
        )
        .await
        .unwrap();

        assert_eq!(settled, Some(SubscriptionState::Active));
    }

    #[tokio::test]
    async fn exhausts_and_resets_on_new_demand() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut mock = MockBrokerSubscription::new();
        let counter = Arc::clone(&calls);
        mock.expect_run().returning(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(BrokerError::Topology("xbuddy.broadcast".into()))
        });
        let run = start(fast_config(3, Duration::from_millis(5)), Arc::new(mock));

        run.events.send(DemandEvent::ClientsAvailable).unwrap();
        reach(&run.handle, SubscriptionState::Exhausted).await;

        // No further attempts while exhausted.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(run.handle.state(), SubscriptionState::Exhausted);

        run.events.send(DemandEvent::ClientsGone).unwrap();
        reach(&run.handle, SubscriptionState::Stopped).await;

        run.events.send(DemandEvent::ClientsAvailable).unwrap();
        reach(&run.handle, SubscriptionState::Exhausted).await;
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn stuck_teardown_is_aborted() {
        let sub = ScriptedSubscription::new([Step::IgnoreCancel]);
        let run = start(fast_config(3, Duration::from_millis(10)), sub.clone());

        run.events.send(DemandEvent::ClientsAvailable).unwrap();
        reach(&run.handle, SubscriptionState::Active).await;

        run.events.send(DemandEvent::ClientsGone).unwrap();
        reach(&run.handle, SubscriptionState::Stopped).await;
    }

    #[tokio::test]
    async fn shutdown_releases_subscription_and_ends_task() {
        let sub = ScriptedSubscription::new([Step::Serve]);
        let run = start(fast_config(3, Duration::from_millis(10)), sub.clone());

        run.events.send(DemandEvent::ClientsAvailable).unwrap();
        reach(&run.handle, SubscriptionState::Active).await;

        run.shutdown.cancel();
        timeout(WAIT, run.task).await.unwrap().unwrap();

        assert_eq!(run.handle.state(), SubscriptionState::Stopped);
        assert_eq!(sub.released(), 1);
    }

    #[tokio::test]
    async fn closed_demand_channel_ends_task() {
        let sub = ScriptedSubscription::new(Vec::new());
        let run = start(fast_config(3, Duration::from_millis(10)), sub.clone());

        drop(run.events);
        timeout(WAIT, run.task).await.unwrap().unwrap();

        assert_eq!(run.handle.state(), SubscriptionState::Stopped);
        assert_eq!(sub.attempts(), 0);
    }
}
