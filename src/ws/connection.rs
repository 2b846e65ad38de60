//! Connection state machine, reconnect policy and outbound queue.
//!
//! [`ConnectionManager`] performs no IO. Every transport event is fed in as a
//! method call and the manager answers with what the driver has to do next:
//! frames to write, a delay to sleep before reconnecting, or nothing. The
//! native driver holds it behind the client's single mutex, together with the
//! channel registry it owns.

use std::collections::VecDeque;
use std::time::Duration;

use crate::auth::CredentialProvider;
use crate::shared::Channel;
use crate::ws::subscriptions::{SubscriberRef, SubscriptionRegistry};
use crate::ws::{ConnectionState, MessageOut, WsConfig};

// ─── Reconnect policy ────────────────────────────────────────────────────────

/// Bounded exponential backoff between reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Consecutive failures after which the manager stops retrying.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        WsConfig::default().reconnect_policy()
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-indexed).
    ///
    /// `base_delay * backoff_factor^(attempt - 1)`, capped at `max_delay`.
    /// Non-decreasing in `attempt` for any factor >= 1.0.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.base_delay.as_millis() as f64 * self.backoff_factor.powi(exp);
        let capped = base.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

// ─── Manager ─────────────────────────────────────────────────────────────────

/// Why a connect request did not start an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectSkip {
    /// Already `Connected` or `Connecting`.
    AlreadyActive,
    /// The credential provider has no valid session.
    NotAuthenticated,
}

/// What the driver must do after the transport closed or an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Sleep `delay`, then try again.
    Reconnect { attempt: u32, delay: Duration },
    /// Budget spent; stay down until an explicit connect.
    Exhausted,
    /// The close was requested locally; do nothing.
    Stopped,
}

/// Sans-IO connection manager.
///
/// Owns the connection state, the reconnect attempt counter, the outbound
/// queue and the channel registry.
#[derive(Debug)]
pub struct ConnectionManager {
    url: String,
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempts: u32,
    outbound: VecDeque<MessageOut>,
    registry: SubscriptionRegistry,
}

impl ConnectionManager {
    pub fn new(config: &WsConfig) -> Self {
        Self {
            url: config.url.clone(),
            policy: config.reconnect_policy(),
            state: ConnectionState::Disconnected,
            attempts: 0,
            outbound: VecDeque::new(),
            registry: SubscriptionRegistry::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failed attempts since the last successful connection.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Frames waiting for the next connection, oldest first.
    pub fn queued(&self) -> impl Iterator<Item = &MessageOut> {
        self.outbound.iter()
    }

    pub fn queued_len(&self) -> usize {
        self.outbound.len()
    }

    // ── Transitions ───────────────────────────────────────────────────────

    /// Start a connection attempt and return the URL to open.
    ///
    /// `explicit` marks a consumer-initiated connect, which resets the attempt
    /// counter (the only way out of `Exhausted`). Scheduled reconnects pass
    /// `false`. The token is re-read every time; without one no attempt is
    /// made. A scheduled reconnect then falls back to `Disconnected`, an
    /// explicit connect changes nothing.
    pub fn begin_connect(
        &mut self,
        credentials: &dyn CredentialProvider,
        explicit: bool,
    ) -> Result<String, ConnectSkip> {
        if matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            return Err(ConnectSkip::AlreadyActive);
        }

        let token = if credentials.is_authenticated() {
            credentials.token().filter(|t| !t.is_empty())
        } else {
            None
        };
        let Some(token) = token else {
            // an explicit connect without a session leaves everything as is
            if !explicit && self.state == ConnectionState::Reconnecting {
                self.state = ConnectionState::Disconnected;
            }
            return Err(ConnectSkip::NotAuthenticated);
        };

        if explicit {
            self.attempts = 0;
        }
        self.state = ConnectionState::Connecting;
        Ok(crate::network::with_token(&self.url, &token))
    }

    /// Roll back a `begin_connect` whose attempt could not be started at all.
    pub fn abort_connect(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Disconnected;
        }
    }

    /// The transport opened.
    ///
    /// Returns, in write order, the queued frames followed by one `subscribe`
    /// per live channel.
    pub fn on_open(&mut self) -> Vec<MessageOut> {
        self.state = ConnectionState::Connected;
        self.attempts = 0;

        let mut frames: Vec<MessageOut> = self.outbound.drain(..).collect();
        frames.extend(self.registry.resubscribe_all());
        frames
    }

    /// The transport closed, errored, or a connection attempt failed.
    pub fn on_closed(&mut self) -> CloseOutcome {
        if matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Exhausted
        ) {
            return CloseOutcome::Stopped;
        }

        self.attempts = self.attempts.saturating_add(1);
        if self.attempts >= self.policy.max_attempts {
            self.state = ConnectionState::Exhausted;
            return CloseOutcome::Exhausted;
        }

        self.state = ConnectionState::Reconnecting;
        CloseOutcome::Reconnect {
            attempt: self.attempts,
            delay: self.policy.delay_for_attempt(self.attempts),
        }
    }

    /// Explicit teardown. Keeps the registry and the queue.
    ///
    /// Returns `false` if already disconnected.
    pub fn disconnect(&mut self) -> bool {
        let was_down = self.state == ConnectionState::Disconnected;
        self.state = ConnectionState::Disconnected;
        !was_down
    }

    // ── Outbound ──────────────────────────────────────────────────────────

    /// Returns the frame back if it must be written now, or queues it.
    pub fn send(&mut self, frame: MessageOut) -> Option<MessageOut> {
        if self.state.is_connected() {
            Some(frame)
        } else {
            self.outbound.push_back(frame);
            None
        }
    }

    /// Put frames that were accepted but never written back at the head of
    /// the queue, preserving their order.
    pub fn requeue_front(&mut self, frames: Vec<MessageOut>) {
        for frame in frames.into_iter().rev() {
            self.outbound.push_front(frame);
        }
    }

    // ── Subscriptions ─────────────────────────────────────────────────────

    /// Register interest; returns a `subscribe` frame to write now, if any.
    pub fn subscribe(&mut self, channel: Channel, subscriber: SubscriberRef) -> Option<MessageOut> {
        let frame = self.registry.subscribe(channel, subscriber)?;
        self.send(frame)
    }

    /// Drop interest; returns an `unsubscribe` frame to write now, if any.
    pub fn unsubscribe(&mut self, channel: &Channel, subscriber: &SubscriberRef) -> Option<MessageOut> {
        let frame = self.registry.unsubscribe(channel, subscriber)?;
        self.send(frame)
    }
}
