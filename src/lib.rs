//! Trellis: overlay-network membership and topology layer.
//!
//! Lets independently-started node processes discover each other, keep
//! connections alive across heterogeneous transports, and converge on a
//! shared view of which nodes are reachable through which peers via
//! link-state flooding. Wire transports are pluggable providers behind a
//! narrow seam; workflow execution, RPC dispatch and GUI layers live
//! outside this crate and only exchange configuration and reachability
//! facts with it.

pub mod config;
pub mod conn;
pub mod contact;
pub mod filter;
pub mod identity;
pub mod node;
pub mod relay;
pub mod topology;
pub mod transport;
pub mod utils;

// Re-export identity types
pub use identity::{IdentityError, IdentityStore, NodeId, SessionId};

// Re-export contact point types
pub use contact::{ContactPoint, ContactPointError};

// Re-export admission control types
pub use filter::{AdmissionRule, ConnectionFilter};

// Re-export config types
pub use config::{Config, ConfigError};

// Re-export connection types
pub use conn::{
    ConnectError, Connection, ConnectionId, ConnectionManager, ConnectionRole, ConnectionState,
    HealthConfig, NetEvent, RetryDefaults, RetrySchedule,
};

// Re-export topology types
pub use topology::{IngestOutcome, Lsa, LsaKind, NetworkGraph, TopologyStore};

// Re-export relay types
pub use relay::RelayPolicy;

// Re-export transport types
pub use transport::{
    EstablishedLink, Frame, InboundHandler, Link, PeerHello, Transport, TransportError,
};
pub use transport::memory::{MemoryHub, MemoryTransport};

// Re-export node types
pub use node::{Node, NodeError, NodeState};
