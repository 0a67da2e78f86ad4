//! Transport layer abstractions.
//!
//! Wire transports (raw TCP, SSH tunnels, SSH uplinks) are pluggable
//! providers behind this narrow seam: the core only needs to dial a
//! contact point, accept inbound links, exchange frames, and probe
//! liveness. The concrete handshake and encoding live entirely inside the
//! provider. An in-process provider ([`memory::MemoryTransport`]) backs the
//! multi-node integration tests.

pub mod memory;

use crate::contact::ContactPoint;
use crate::identity::{NodeId, SessionId};
use crate::topology::Lsa;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors related to transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection refused by {0}")]
    ConnectionRefused(String),

    #[error("connection rejected by admission control at {0}")]
    AdmissionDenied(String),

    #[error("link closed")]
    Closed,

    #[error("probe timed out")]
    ProbeTimeout,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("already listening on {0}")]
    AlreadyListening(String),

    #[error("not listening on {0}")]
    NotListening(String),
}

/// Identity information exchanged during the transport handshake.
///
/// Contact points can be created "by a remote handshake": the advertised
/// contact is how the acceptor keys the inbound connection for duplicate
/// suppression.
#[derive(Clone, Debug)]
pub struct PeerHello {
    /// The remote's current session (installation id + start nonce).
    pub session: SessionId,
    /// Whether the remote acts as a relay.
    pub relay: bool,
    /// Human-readable name for logs.
    pub display_name: String,
    /// The remote's own server contact point, if it has one.
    pub contact: Option<ContactPoint>,
}

impl PeerHello {
    /// The remote's stable node id.
    pub fn node(&self) -> NodeId {
        *self.session.node()
    }
}

/// A message carried over an established link.
#[derive(Clone, Debug)]
pub enum Frame {
    /// A single flooded link-state advertisement.
    Lsa(Lsa),
    /// Full knowledge transfer to a freshly connected neighbor.
    LsaBatch(Vec<Lsa>),
    /// Application payload, possibly relayed across multiple hops.
    Payload {
        origin: NodeId,
        dest: NodeId,
        data: Vec<u8>,
    },
}

/// Shared state between the two handles of one link.
#[derive(Debug)]
struct LinkShared {
    open: AtomicBool,
    /// Liveness fault injection point: when false, probes fail. Owned per
    /// listening endpoint so tests can break all links toward one node.
    probe_ok: Arc<AtomicBool>,
}

/// One endpoint's handle to an established bidirectional link.
///
/// Cloneable; all clones refer to the same underlying link.
#[derive(Clone, Debug)]
pub struct Link {
    tx: mpsc::Sender<Frame>,
    shared: Arc<LinkShared>,
}

impl Link {
    /// Send a frame to the remote endpoint.
    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Round-trip liveness probe.
    pub async fn probe(&self) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        if !self.shared.probe_ok.load(Ordering::Relaxed) {
            // an unresponsive peer never answers; let the caller's timeout expire
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    /// Close the link for both endpoints.
    pub fn close(&self) {
        self.shared.open.store(false, Ordering::Relaxed);
    }

    /// Whether the link is still open.
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Relaxed)
    }
}

/// An established link plus the remote's handshake information and the
/// inbound frame stream.
pub struct EstablishedLink {
    pub remote: PeerHello,
    pub link: Link,
    pub incoming: mpsc::Receiver<Frame>,
}

impl fmt::Debug for EstablishedLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EstablishedLink")
            .field("remote", &self.remote.session)
            .finish_non_exhaustive()
    }
}

/// Frame channel capacity per link direction.
const LINK_CHANNEL_CAPACITY: usize = 64;

/// Build a connected pair of links sharing one open flag.
///
/// `probe_ok` is the acceptor-side liveness flag; both directions observe
/// it. Used by transport providers when completing a handshake.
pub(crate) fn link_pair(probe_ok: Arc<AtomicBool>) -> (Link, mpsc::Receiver<Frame>, Link, mpsc::Receiver<Frame>) {
    let (tx_a, rx_b) = mpsc::channel(LINK_CHANNEL_CAPACITY);
    let (tx_b, rx_a) = mpsc::channel(LINK_CHANNEL_CAPACITY);
    let shared = Arc::new(LinkShared {
        open: AtomicBool::new(true),
        probe_ok,
    });
    let a = Link {
        tx: tx_a,
        shared: Arc::clone(&shared),
    };
    let b = Link { tx: tx_b, shared };
    (a, rx_a, b, rx_b)
}

/// Receiver side of a listening endpoint.
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    /// Admission decision for the remote address (§ admission control).
    fn admit(&self, remote_ip: &str) -> bool;

    /// Take ownership of an admitted inbound link.
    async fn accept(&self, link: EstablishedLink, remote_ip: String);
}

/// A pluggable transport provider.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The contact point transport token this provider serves.
    fn kind(&self) -> &str;

    /// Establish an outbound link to `contact`, performing the
    /// transport-level handshake.
    async fn dial(&self, contact: &ContactPoint) -> Result<EstablishedLink, TransportError>;

    /// Start accepting inbound links on `contact`.
    async fn listen(
        &self,
        contact: &ContactPoint,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<(), TransportError>;

    /// Stop accepting inbound links on `contact`.
    async fn close_listener(&self, contact: &ContactPoint) -> Result<(), TransportError>;
}
