//! Connection lifecycle: states, entries, and the manager that owns them.
//!
//! Connections are owned exclusively by the [`ConnectionManager`]; other
//! components refer to them through their [`ConnectionId`]. The state
//! machine is fixed-transition: anything outside the table below is a
//! programming error and is rejected (and logged) rather than applied.

mod backoff;
mod health;
mod manager;

pub use backoff::{RetryDefaults, RetrySchedule};
pub use health::HealthConfig;
pub use manager::{ConnectionManager, NetEvent};

use crate::contact::ContactPoint;
use crate::identity::NodeId;
use crate::transport::TransportError;
use crate::utils::time::unix_millis;
use std::fmt;
use thiserror::Error;
use tracing::warn;

/// Errors related to connection management.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("no transport provider registered for {0:?}")]
    UnknownTransport(String),

    #[error("handshake failed for {contact}: {source}")]
    HandshakeFailed {
        contact: String,
        source: TransportError,
    },

    #[error("connection not found: {0}")]
    NotFound(ConnectionId),

    #[error("send on {id} failed: {source}")]
    SendFailed {
        id: ConnectionId,
        source: TransportError,
    },

    #[error("connection manager is shutting down")]
    ShuttingDown,
}

/// Unique identifier for a connection, never reused within a process.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn:{}", self.0)
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

/// Which side initiated the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionRole {
    /// We dialed out.
    Client,
    /// The remote dialed us.
    Server,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionRole::Client => write!(f, "client"),
            ConnectionRole::Server => write!(f, "server"),
        }
    }
}

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, handshake not yet attempted.
    Pending,
    /// Handshake in flight.
    Connecting,
    /// Live and usable.
    Established,
    /// Live but with recent health check failures.
    HealthDegraded,
    /// Teardown by local request in progress.
    Closing,
    /// Gone by local request; terminal unless re-dialed as a new entry.
    Closed,
    /// Handshake or health checking gave up; retry may follow.
    Failed,
}

/// All legal state transitions.
const VALID_TRANSITIONS: &[(ConnectionState, ConnectionState)] = &[
    // standard lifecycle
    (ConnectionState::Pending, ConnectionState::Connecting),
    (ConnectionState::Connecting, ConnectionState::Established),
    (ConnectionState::Established, ConnectionState::Closing),
    (ConnectionState::Closing, ConnectionState::Closed),
    // handshake failure and retry
    (ConnectionState::Connecting, ConnectionState::Failed),
    (ConnectionState::Failed, ConnectionState::Connecting),
    // health degradation and recovery
    (ConnectionState::Established, ConnectionState::HealthDegraded),
    (ConnectionState::HealthDegraded, ConnectionState::Established),
    (ConnectionState::HealthDegraded, ConnectionState::Failed),
    (ConnectionState::HealthDegraded, ConnectionState::Closing),
    // remote closed the link without local request
    (ConnectionState::Established, ConnectionState::Failed),
    // local close before/after the link was up
    (ConnectionState::Pending, ConnectionState::Closed),
    (ConnectionState::Connecting, ConnectionState::Closed),
    (ConnectionState::Failed, ConnectionState::Closed),
];

impl ConnectionState {
    /// Whether this state counts toward the at-most-one-per-contact-point
    /// invariant (i.e. the entry has not been superseded).
    pub fn is_effective(&self) -> bool {
        !matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }

    /// Whether a usable link exists in this state.
    pub fn is_usable(&self) -> bool {
        matches!(self, ConnectionState::Established | ConnectionState::HealthDegraded)
    }

    /// Whether `next` is a legal successor state.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        VALID_TRANSITIONS.contains(&(*self, next))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Pending => "pending",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Established => "established",
            ConnectionState::HealthDegraded => "health-degraded",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// One connection's bookkeeping record.
#[derive(Clone, Debug)]
pub struct Connection {
    id: ConnectionId,
    role: ConnectionRole,
    remote: ContactPoint,
    state: ConnectionState,
    /// Remote node id, known once the handshake completed.
    peer: Option<NodeId>,
    consecutive_health_failures: u32,
    established_at: Option<u64>,
    last_health_check_at: Option<u64>,
}

impl Connection {
    pub fn new(id: ConnectionId, role: ConnectionRole, remote: ContactPoint) -> Self {
        Self {
            id,
            role,
            remote,
            state: ConnectionState::Pending,
            peer: None,
            consecutive_health_failures: 0,
            established_at: None,
            last_health_check_at: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn remote(&self) -> &ContactPoint {
        &self.remote
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peer(&self) -> Option<&NodeId> {
        self.peer.as_ref()
    }

    pub fn consecutive_health_failures(&self) -> u32 {
        self.consecutive_health_failures
    }

    pub fn established_at(&self) -> Option<u64> {
        self.established_at
    }

    pub fn last_health_check_at(&self) -> Option<u64> {
        self.last_health_check_at
    }

    /// Apply a state transition. Illegal transitions are rejected and
    /// logged; the state is left unchanged.
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                connection = %self.id,
                from = %self.state,
                to = %next,
                "Rejecting invalid connection state transition"
            );
            return false;
        }
        self.state = next;
        true
    }

    /// Record a completed handshake.
    pub fn mark_established(&mut self, peer: NodeId) -> bool {
        if !self.transition(ConnectionState::Established) {
            return false;
        }
        self.peer = Some(peer);
        self.consecutive_health_failures = 0;
        self.established_at = Some(unix_millis());
        true
    }

    /// Record a successful health probe; returns to Established when the
    /// connection was degraded.
    pub fn record_health_success(&mut self) {
        self.last_health_check_at = Some(unix_millis());
        self.consecutive_health_failures = 0;
        if self.state == ConnectionState::HealthDegraded {
            self.transition(ConnectionState::Established);
        }
    }

    /// Record a failed health probe and return the new consecutive
    /// failure count.
    pub fn record_health_failure(&mut self) -> u32 {
        self.last_health_check_at = Some(unix_millis());
        self.consecutive_health_failures += 1;
        if self.state == ConnectionState::Established {
            self.transition(ConnectionState::HealthDegraded);
        }
        self.consecutive_health_failures
    }
}
