//! Connection lifecycle for the grid client.
//!
//! [`ConnectionLifecycle`] is a plain state machine: it does no I/O and owns no
//! timers. The client driver feeds it transport events and acts on what it
//! returns. At most one connection attempt is in flight and at most one
//! reconnect is scheduled at any time; a superseded reconnect is recognised by
//! its stale [`ReconnectTicket`] and ignored.

pub mod policy;

use std::fmt;
use std::time::Duration;

use tracing::{debug, info};

pub use policy::{ExponentialBackoff, FixedDelay, ReconnectPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(label)
    }
}

/// Permission to open one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectAttempt {
    /// 1 for the first attempt after an established session (or startup).
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReconnectTicket(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledReconnect {
    pub delay: Duration,
    pub ticket: ReconnectTicket,
    pub failures: u32,
}

pub struct ConnectionLifecycle {
    state: ConnectionState,
    policy: Box<dyn ReconnectPolicy>,
    failures: u32,
    generation: u64,
    scheduled: Option<ReconnectTicket>,
    shut_down: bool,
}

impl ConnectionLifecycle {
    pub fn new(policy: Box<dyn ReconnectPolicy>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            policy,
            failures: 0,
            generation: 0,
            scheduled: None,
            shut_down: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Consecutive losses since the last established session.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn has_scheduled_reconnect(&self) -> bool {
        self.scheduled.is_some()
    }

    /// Start an attempt. Only valid from `Disconnected`; a second call while an
    /// attempt is open (or after shutdown) returns `None`. Starting an attempt
    /// directly also cancels any pending scheduled reconnect.
    pub fn connect(&mut self) -> Option<ConnectAttempt> {
        if self.shut_down || self.state != ConnectionState::Disconnected {
            return None;
        }
        self.scheduled = None;
        self.state = ConnectionState::Connecting;
        Some(ConnectAttempt {
            attempt: self.failures + 1,
        })
    }

    /// The transport is open. Returns `false` if no attempt was in flight.
    pub fn session_established(&mut self) -> bool {
        if self.state != ConnectionState::Connecting {
            return false;
        }
        self.state = ConnectionState::Connected;
        self.failures = 0;
        true
    }

    /// The peer closed the connection (or the attempt ended without opening).
    pub fn transport_closed(&mut self) -> Option<ScheduledReconnect> {
        self.lost("closed")
    }

    pub fn transport_error(&mut self, err: &dyn fmt::Display) -> Option<ScheduledReconnect> {
        debug!(target: "session::lifecycle", error = %err, "transport error");
        self.lost("error")
    }

    /// A scheduled delay elapsed. Stale tickets (superseded by a later
    /// schedule, a direct `connect`, or shutdown) are ignored.
    pub fn reconnect_due(&mut self, ticket: ReconnectTicket) -> Option<ConnectAttempt> {
        if self.scheduled != Some(ticket) {
            debug!(
                target: "session::lifecycle",
                ticket = ticket.0,
                "ignoring stale reconnect"
            );
            return None;
        }
        self.scheduled = None;
        self.connect()
    }

    /// Stop for good. Pending reconnects are cancelled and further calls are
    /// no-ops.
    pub fn shutdown(&mut self) {
        self.shut_down = true;
        self.scheduled = None;
        self.state = ConnectionState::Disconnected;
    }

    fn lost(&mut self, cause: &'static str) -> Option<ScheduledReconnect> {
        if self.shut_down || self.state == ConnectionState::Disconnected {
            return None;
        }
        let was = self.state;
        self.state = ConnectionState::Disconnected;
        self.failures = self.failures.saturating_add(1);
        self.generation += 1;
        let ticket = ReconnectTicket(self.generation);
        self.scheduled = Some(ticket);
        let delay = self.policy.delay_for(self.failures);
        info!(
            target: "session::lifecycle",
            cause,
            from = %was,
            failures = self.failures,
            policy = self.policy.name(),
            delay_ms = delay.as_millis() as u64,
            "connection lost; reconnect scheduled"
        );
        Some(ScheduledReconnect {
            delay,
            ticket,
            failures: self.failures,
        })
    }
}

impl fmt::Debug for ConnectionLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLifecycle")
            .field("state", &self.state)
            .field("policy", &self.policy.name())
            .field("failures", &self.failures)
            .field("scheduled", &self.scheduled)
            .field("shut_down", &self.shut_down)
            .finish()
    }
}
