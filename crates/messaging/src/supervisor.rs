//! Connection supervision.
//!
//! ```text
//! Connected --lost--> Reconnecting{1} --ok--> Connected
//!                          |
//!                        failed --> Reconnecting{n+1} | Terminal
//! Connected --lost (terminate policy)--> Terminal
//! ```
//!
//! Reconnecting re-declares the registered topics. Subscriptions end with
//! the lost connection and are re-created by their owner, which can watch
//! [`ConnectionSupervisor::subscribe_state`] for the return to `Connected`.

use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::MessagingClient;
use crate::broker::ConnectionEvent;

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt (default: 1 second)
    pub initial_delay: Duration,
    /// Upper bound on the delay (default: 60 seconds)
    pub max_delay: Duration,
    /// Growth factor per failed attempt (default: 2.0)
    pub backoff_multiplier: f64,
    /// Attempts before giving up; 0 retries forever (default: 10)
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn allows(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }
}

/// What to do when the broker connection closes unexpectedly.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionLossPolicy {
    Reconnect(ReconnectPolicy),
    /// Treat the loss as fatal.
    Terminate,
}

impl Default for ConnectionLossPolicy {
    fn default() -> Self {
        ConnectionLossPolicy::Reconnect(ReconnectPolicy::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting { attempt: u32 },
    /// The connection is gone for good; the process should exit.
    Terminal { reason: String },
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Terminal { .. })
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting { .. } => "reconnecting",
            ConnectionState::Terminal { .. } => "terminal",
        }
    }

    /// Next state after `signal`. Terminal is absorbing and signals that do
    /// not apply to the current state leave it unchanged.
    pub fn transition(&self, signal: &SupervisorSignal, policy: &ConnectionLossPolicy) -> Self {
        match (self, signal) {
            (ConnectionState::Terminal { .. }, _) => self.clone(),
            (ConnectionState::Connected, SupervisorSignal::ConnectionLost(reason)) => match policy
            {
                ConnectionLossPolicy::Terminate => ConnectionState::Terminal {
                    reason: format!("connection lost: {reason}"),
                },
                ConnectionLossPolicy::Reconnect(_) => ConnectionState::Reconnecting { attempt: 1 },
            },
            (ConnectionState::Reconnecting { .. }, SupervisorSignal::ReconnectSucceeded) => {
                ConnectionState::Connected
            }
            (
                ConnectionState::Reconnecting { attempt },
                SupervisorSignal::ReconnectFailed(reason),
            ) => match policy {
                ConnectionLossPolicy::Reconnect(reconnect) if reconnect.allows(*attempt) => {
                    ConnectionState::Reconnecting {
                        attempt: attempt + 1,
                    }
                }
                _ => ConnectionState::Terminal {
                    reason: format!("reconnect failed after {attempt} attempts: {reason}"),
                },
            },
            _ => self.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorSignal {
    ConnectionLost(String),
    ReconnectSucceeded,
    ReconnectFailed(String),
}

/// Background task applying a [`ConnectionLossPolicy`] to a client's broker.
pub struct ConnectionSupervisor {
    state: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConnectionSupervisor {
    pub fn spawn(client: MessagingClient, policy: ConnectionLossPolicy) -> Self {
        let (state_tx, state) = watch::channel(ConnectionState::Connected);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let events = client.broker().connection_events();
        let task = tokio::spawn(supervise(client, policy, events, state_tx, shutdown_rx));

        Self {
            state,
            shutdown,
            task,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Waits until the state becomes terminal and returns the reason. Returns
    /// `None` if the supervisor was shut down first.
    pub async fn wait_terminal(&self) -> Option<String> {
        let mut state = self.state.clone();
        let terminal = state.wait_for(ConnectionState::is_terminal).await.ok()?;
        match &*terminal {
            ConnectionState::Terminal { reason } => Some(reason.clone()),
            _ => None,
        }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            tracing::error!(error = %err, "connection supervisor failed");
        }
    }
}

fn apply(
    state_tx: &watch::Sender<ConnectionState>,
    signal: SupervisorSignal,
    policy: &ConnectionLossPolicy,
) -> ConnectionState {
    let next = state_tx.borrow().transition(&signal, policy);
    tracing::debug!(?signal, state = next.as_str(), "connection state transition");
    state_tx.send_replace(next.clone());
    next
}

#[tracing::instrument(skip_all, fields(component = "supervisor", app_id = %client.app_id()))]
async fn supervise(
    client: MessagingClient,
    policy: ConnectionLossPolicy,
    mut events: broadcast::Receiver<ConnectionEvent>,
    state_tx: watch::Sender<ConnectionState>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let reason = tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            event = events.recv() => match event {
                Ok(ConnectionEvent::Lost(reason)) => reason,
                Err(RecvError::Lagged(skipped)) => {
                    if client.broker().is_connected() {
                        tracing::debug!(skipped, "skipped stale connection events");
                        continue;
                    }
                    "connection events lagged".to_string()
                }
                Err(RecvError::Closed) => return,
            },
        };

        tracing::warn!(reason = %reason, "broker connection lost");
        let mut state = apply(&state_tx, SupervisorSignal::ConnectionLost(reason), &policy);

        while let ConnectionState::Reconnecting { attempt } = state {
            let delay = match &policy {
                ConnectionLossPolicy::Reconnect(reconnect) => reconnect.delay_for(attempt),
                ConnectionLossPolicy::Terminate => Duration::ZERO,
            };
            tracing::info!(attempt, ?delay, "reconnecting to broker");

            tokio::select! {
                biased;
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let restored = match client.broker().reconnect().await {
                Ok(()) => client.restore_topics().await,
                Err(err) => Err(err),
            };
            let signal = match restored {
                Ok(()) => {
                    metrics::counter!("broker_reconnects_total").increment(1);
                    tracing::info!(attempt, "broker connection restored");
                    SupervisorSignal::ReconnectSucceeded
                }
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "reconnect attempt failed");
                    SupervisorSignal::ReconnectFailed(err.to_string())
                }
            };
            state = apply(&state_tx, signal, &policy);
        }

        if let ConnectionState::Terminal { reason } = &state {
            tracing::error!(reason = %reason, "broker connection is terminal");
            return;
        }

        // Loss notifications raised while reconnecting refer to the old connection.
        events = events.resubscribe();
    }
}
