//! Node facade.
//!
//! Aggregates identity, contact points, admission control, timeouts and
//! the relay flag into one service surface with an explicit
//! `new()`/`start()`/`stop()` contract, and runs the event loop that turns
//! connection events into topology updates and LSA floods.
//!
//! Wiring is plain constructor injection: transports are registered on the
//! manager before `start()`; nothing is discovered at runtime.

#[cfg(test)]
mod tests;

use crate::config::{Config, ConfigError, IpFilterState};
use crate::conn::{
    ConnectError, ConnectionId, ConnectionManager, NetEvent, RetryDefaults,
};
use crate::contact::ContactPoint;
use crate::filter::ConnectionFilter;
use crate::identity::{IdentityError, IdentityStore, NodeId, SessionId};
use crate::relay::RelayPolicy;
use crate::topology::TopologyStore;
use crate::transport::{EstablishedLink, Frame, InboundHandler, PeerHello, TransportError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Errors related to node lifecycle operations.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node not started")]
    NotStarted,

    #[error("node already started")]
    AlreadyStarted,

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid health check configuration: {0}")]
    InvalidHealthConfig(String),

    #[error("connection error: {0}")]
    Connect(#[from] ConnectError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("no route to {0}")]
    NoRoute(NodeId),

    #[error("request to {0} timed out")]
    RequestTimeout(NodeId),
}

/// Node operational state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Created but not started.
    Created,
    /// Starting up (applying configuration, binding listeners).
    Starting,
    /// Fully operational.
    Running,
    /// Shutting down.
    Stopping,
    /// Stopped.
    Stopped,
}

impl NodeState {
    pub fn is_operational(&self) -> bool {
        matches!(self, NodeState::Running)
    }

    pub fn can_start(&self) -> bool {
        matches!(self, NodeState::Created | NodeState::Stopped)
    }

    pub fn can_stop(&self) -> bool {
        matches!(self, NodeState::Running)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Created => "created",
            NodeState::Starting => "starting",
            NodeState::Running => "running",
            NodeState::Stopping => "stopping",
            NodeState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Listener-side bridge: admission check against the shared filter, then
/// hand-off to the connection manager.
struct InboundAcceptor {
    filter: Arc<ConnectionFilter>,
    manager: ConnectionManager,
}

#[async_trait]
impl InboundHandler for InboundAcceptor {
    fn admit(&self, remote_ip: &str) -> bool {
        let allowed = self.filter.is_allowed(remote_ip);
        if !allowed {
            info!(remote_ip, "Rejected inbound connection by IP filter");
        }
        allowed
    }

    async fn accept(&self, link: EstablishedLink, remote_ip: String) {
        self.manager.register_inbound(link, remote_ip).await;
    }
}

/// Shared context for the event loop task.
struct EventCtx {
    manager: ConnectionManager,
    topology: Arc<TopologyStore>,
    relay: RelayPolicy,
    peer_names: Arc<Mutex<HashMap<NodeId, String>>>,
    delivery_tx: mpsc::Sender<(NodeId, Vec<u8>)>,
    forwarding_timeout: Duration,
}

/// A running overlay-network node instance.
pub struct Node {
    session: SessionId,
    display_name: String,
    relay: RelayPolicy,
    config: Config,
    filter: Arc<ConnectionFilter>,
    topology: Arc<TopologyStore>,
    manager: ConnectionManager,
    state: Mutex<NodeState>,
    events_rx: Mutex<Option<mpsc::Receiver<NetEvent>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    peer_names: Arc<Mutex<HashMap<NodeId, String>>>,
    delivery_tx: mpsc::Sender<(NodeId, Vec<u8>)>,
    delivery_rx: Mutex<Option<mpsc::Receiver<(NodeId, Vec<u8>)>>>,
    /// Listening contacts added programmatically before start.
    extra_listen: Mutex<Vec<ContactPoint>>,
    /// Contacts actually listening; closed on stop.
    active_listeners: Mutex<Vec<ContactPoint>>,
    request_timeout: Duration,
    forwarding_timeout: Duration,
}

impl Node {
    /// Create a node from configuration.
    ///
    /// Resolves the persisted node identity; failure to obtain one aborts,
    /// since identity is foundational to every other component.
    pub fn new(config: Config) -> Result<Self, NodeError> {
        config
            .health_check
            .validate()
            .map_err(NodeError::InvalidHealthConfig)?;

        let store = IdentityStore::new(config.state_dir());
        let node_id = store.resolve(config.node_id.as_deref())?;
        let session = SessionId::fresh(node_id);

        let display_name = config
            .display_name
            .clone()
            .unwrap_or_else(|| format!("node-{}", &node_id.to_string()[..8]));
        let relay = RelayPolicy::new(node_id, config.relay);

        let topology = Arc::new(TopologyStore::new(node_id, relay.reports_links()));
        let filter = Arc::new(ConnectionFilter::allow_all());

        let (events_tx, events_rx) = mpsc::channel(256);
        let (delivery_tx, delivery_rx) = mpsc::channel(64);

        let hello = PeerHello {
            session,
            relay: relay.is_relay(),
            display_name: display_name.clone(),
            contact: None,
        };
        let manager = ConnectionManager::new(
            hello,
            events_tx,
            RetryDefaults::default(),
            config.health_check,
        );

        let request_timeout = Duration::from_millis(config.network.request_timeout_msec);
        let forwarding_timeout = Duration::from_millis(config.network.forwarding_timeout_msec);

        Ok(Self {
            session,
            display_name,
            relay,
            config,
            filter,
            topology,
            manager,
            state: Mutex::new(NodeState::Created),
            events_rx: Mutex::new(Some(events_rx)),
            event_task: Mutex::new(None),
            peer_names: Arc::new(Mutex::new(HashMap::new())),
            delivery_tx,
            delivery_rx: Mutex::new(Some(delivery_rx)),
            extra_listen: Mutex::new(Vec::new()),
            active_listeners: Mutex::new(Vec::new()),
            request_timeout,
            forwarding_timeout,
        })
    }

    // === Identity & configuration accessors ===

    /// This process run's session id.
    pub fn session_id(&self) -> &SessionId {
        &self.session
    }

    /// The stable installation id.
    pub fn node_id(&self) -> &NodeId {
        self.session.node()
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn is_relay(&self) -> bool {
        self.relay.is_relay()
    }

    /// Sender-side timeout for request/response traffic.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Timeout applied when forwarding traffic for other nodes.
    pub fn forwarding_timeout(&self) -> Duration {
        self.forwarding_timeout
    }

    /// The shared admission filter.
    pub fn filter(&self) -> &Arc<ConnectionFilter> {
        &self.filter
    }

    /// Admission decision for a remote address.
    pub fn is_allowed(&self, remote_ip: &str) -> bool {
        self.filter.is_allowed(remote_ip)
    }

    /// The topology store (raw graph + LSA cache).
    pub fn topology(&self) -> &Arc<TopologyStore> {
        &self.topology
    }

    /// The connection lifecycle manager.
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn state(&self) -> NodeState {
        *lock(&self.state)
    }

    /// Display name learned from a peer's handshake, if connected since.
    pub fn peer_display_name(&self, node: &NodeId) -> Option<String> {
        lock(&self.peer_names).get(node).cloned()
    }

    /// Handshake information presented to remote nodes, advertising the
    /// given contact point as our own server endpoint.
    pub fn hello_advertising(&self, contact: Option<ContactPoint>) -> PeerHello {
        PeerHello {
            session: self.session,
            relay: self.relay.is_relay(),
            display_name: self.display_name.clone(),
            contact,
        }
    }

    /// Add a listening contact point beyond those in the configuration.
    /// Must be called before `start()`.
    pub fn add_listen_contact(&self, contact: ContactPoint) {
        lock(&self.extra_listen).push(contact);
    }

    /// Take the receiver for payloads addressed to this node.
    pub fn take_delivery_receiver(&self) -> Option<mpsc::Receiver<(NodeId, Vec<u8>)>> {
        lock(&self.delivery_rx).take()
    }

    // === Lifecycle ===

    /// Start the node: apply the filter configuration, bind listeners,
    /// spawn the event loop, and dial all startup connections.
    pub async fn start(&self) -> Result<(), NodeError> {
        {
            let mut state = lock(&self.state);
            if !state.can_start() {
                return Err(NodeError::AlreadyStarted);
            }
            *state = NodeState::Starting;
        }
        info!(
            session = %self.session,
            display_name = %self.display_name,
            relay = self.relay.is_relay(),
            "Node starting"
        );

        // admission control; a broken segment fails closed
        match &self.config.network.ip_filter {
            IpFilterState::Valid(cfg) => self.filter.reconfigure(cfg.to_rule()),
            IpFilterState::Invalid(reason) => {
                warn!(reason = %reason, "Failed to parse ipFilter configuration");
                self.filter.fail_closed();
            }
        }

        // listeners
        let (server_contacts, server_errors) = self.config.server_contact_points();
        for e in server_errors {
            warn!(error = %e, "Skipping malformed server port entry");
        }
        let mut to_listen = server_contacts;
        to_listen.extend(lock(&self.extra_listen).iter().cloned());
        for contact in to_listen {
            match self.manager.transport(contact.transport()) {
                Some(transport) => {
                    let acceptor = Arc::new(InboundAcceptor {
                        filter: Arc::clone(&self.filter),
                        manager: self.manager.clone(),
                    });
                    match transport.listen(&contact, acceptor).await {
                        Ok(()) => {
                            info!(contact = %contact, "Listening for inbound connections");
                            lock(&self.active_listeners).push(contact);
                        }
                        Err(e) => warn!(contact = %contact, error = %e, "Failed to bind server port"),
                    }
                }
                None => warn!(
                    contact = %contact,
                    transport = contact.transport(),
                    "No transport provider for server port"
                ),
            }
        }

        // event loop
        let ctx = EventCtx {
            manager: self.manager.clone(),
            topology: Arc::clone(&self.topology),
            relay: self.relay,
            peer_names: Arc::clone(&self.peer_names),
            delivery_tx: self.delivery_tx.clone(),
            forwarding_timeout: self.forwarding_timeout,
        };
        let events = lock(&self.events_rx).take().ok_or(NodeError::AlreadyStarted)?;
        *lock(&self.event_task) = Some(tokio::spawn(run_event_loop(ctx, events)));

        // startup connections
        let (outbound, outbound_errors) = self.config.outbound_contact_points();
        for e in outbound_errors {
            warn!(error = %e, "Skipping malformed connection entry");
        }
        for contact in outbound {
            if !contact.connect_on_startup() {
                debug!(contact = %contact, "Deferring connection (connectOnStartup=false)");
                continue;
            }
            if let Err(e) = self.manager.connect(contact.clone()) {
                warn!(contact = %contact, error = %e, "Failed to request startup connection");
            }
        }

        *lock(&self.state) = NodeState::Running;
        info!(state = %self.state(), "Node started");
        Ok(())
    }

    /// Stop the node: announce departure, close all connections and
    /// listeners, and stop the event loop.
    pub async fn stop(&self) -> Result<(), NodeError> {
        {
            let mut state = lock(&self.state);
            if !state.can_stop() {
                return Err(NodeError::NotStarted);
            }
            *state = NodeState::Stopping;
        }
        info!(session = %self.session, "Node stopping");

        // announce departure while links are still up
        let shutdown = self.topology.shutdown_lsa();
        self.manager.broadcast(Frame::Lsa(shutdown), None).await;
        self.topology.stats().record_sent();

        self.manager.disconnect_all().await;

        let listeners: Vec<ContactPoint> = lock(&self.active_listeners).drain(..).collect();
        for contact in listeners {
            if let Some(transport) = self.manager.transport(contact.transport()) {
                if let Err(e) = transport.close_listener(&contact).await {
                    debug!(contact = %contact, error = %e, "Listener close failed");
                }
            }
        }

        if let Some(task) = lock(&self.event_task).take() {
            task.abort();
        }

        *lock(&self.state) = NodeState::Stopped;
        info!("Node stopped");
        Ok(())
    }

    // === Connections ===

    /// Request an outbound connection (idempotent per contact point).
    pub fn connect(&self, contact: ContactPoint) -> Result<ConnectionId, NodeError> {
        Ok(self.manager.connect(contact)?)
    }

    /// Close a connection by id.
    pub async fn disconnect(&self, id: ConnectionId) -> Result<(), NodeError> {
        Ok(self.manager.disconnect(id).await?)
    }

    /// Send an application payload toward `dest`, using the best known
    /// path through the overlay.
    pub async fn send_payload(&self, dest: NodeId, data: Vec<u8>) -> Result<(), NodeError> {
        let local = *self.session.node();
        if dest == local {
            let _ = self.delivery_tx.send((local, data)).await;
            return Ok(());
        }
        let graph = self.topology.graph();
        let hop = graph
            .next_hop_toward(&local, &dest)
            .ok_or(NodeError::NoRoute(dest))?;
        let conn = self
            .manager
            .find_by_peer(&hop)
            .ok_or(NodeError::NoRoute(dest))?;
        let frame = Frame::Payload {
            origin: local,
            dest,
            data,
        };
        tokio::time::timeout(self.request_timeout, self.manager.send_to(conn, frame))
            .await
            .map_err(|_| NodeError::RequestTimeout(dest))??;
        Ok(())
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("session", &self.session)
            .field("display_name", &self.display_name)
            .field("relay", &self.relay.is_relay())
            .field("state", &self.state())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Turn connection events into topology updates and floods.
async fn run_event_loop(ctx: EventCtx, mut events: mpsc::Receiver<NetEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            NetEvent::Established {
                id,
                peer,
                display_name,
            } => {
                lock(&ctx.peer_names).insert(peer, display_name);

                // a local change floods to every neighbor, the new one included
                let lsa = ctx.topology.local_edge_added(peer);
                ctx.manager.broadcast(Frame::Lsa(lsa), None).await;
                ctx.topology.stats().record_sent();

                // full knowledge transfer so a late joiner catches up
                let batch = ctx.topology.known_lsas();
                if let Err(e) = ctx.manager.send_to(id, Frame::LsaBatch(batch)).await {
                    debug!(connection = %id, error = %e, "Failed to send initial LSA batch");
                }
            }
            NetEvent::Closed { id: _, peer } => {
                if let Some(peer) = peer {
                    // a second live connection to the same peer keeps the edge
                    if ctx.manager.find_by_peer(&peer).is_some() {
                        continue;
                    }
                    let lsa = ctx.topology.local_edge_removed(&peer);
                    ctx.manager.broadcast(Frame::Lsa(lsa), None).await;
                    ctx.topology.stats().record_sent();
                }
            }
            NetEvent::Frame { id, peer: _, frame } => {
                handle_frame(&ctx, id, frame).await;
            }
        }
    }
}

async fn handle_frame(ctx: &EventCtx, from: ConnectionId, frame: Frame) {
    match frame {
        Frame::Lsa(lsa) => {
            ingest_and_reflood(ctx, from, lsa).await;
        }
        Frame::LsaBatch(lsas) => {
            for lsa in lsas {
                ingest_and_reflood(ctx, from, lsa).await;
            }
        }
        Frame::Payload { origin, dest, data } => {
            if dest == *ctx.topology.local_node() {
                let _ = ctx.delivery_tx.send((origin, data)).await;
                return;
            }
            if !ctx.relay.accepts_traffic_for(&dest) {
                debug!(dest = %dest, "Dropping payload; this node does not forward");
                return;
            }
            let graph = ctx.topology.graph();
            let Some(hop) = ctx.relay.next_hop(&graph, &dest) else {
                debug!(dest = %dest, "No route for payload, dropping");
                return;
            };
            let Some(conn) = ctx.manager.find_by_peer(&hop) else {
                debug!(dest = %dest, hop = %hop, "Next hop not connected, dropping payload");
                return;
            };
            let frame = Frame::Payload { origin, dest, data };
            match tokio::time::timeout(ctx.forwarding_timeout, ctx.manager.send_to(conn, frame))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(dest = %dest, error = %e, "Forwarding send failed"),
                Err(_) => warn!(dest = %dest, "Forwarding timed out"),
            }
        }
    }
}

/// Re-flood accepted third-party knowledge on relay nodes, excluding the
/// link it arrived on.
async fn ingest_and_reflood(ctx: &EventCtx, from: ConnectionId, lsa: crate::topology::Lsa) {
    if ctx.topology.ingest(lsa.clone()).is_accepted() && ctx.relay.forwards_topology() {
        ctx.manager.broadcast(Frame::Lsa(lsa), Some(from)).await;
        ctx.topology.stats().record_sent();
    }
}
