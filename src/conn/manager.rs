//! Connection lifecycle manager.
//!
//! Owns the connection table and drives every transition: outbound dials,
//! inbound registration, retry with backoff, health monitoring, and
//! teardown. Long-running work (the dial itself, probes, retry timers)
//! runs on spawned tasks; the table mutex is only ever held for short
//! bookkeeping sections, never across an await.
//!
//! Tasks from a superseded link carry an epoch number and re-check it
//! under the table lock before acting, so a canceled probe or a late
//! handshake completion cannot resurrect a connection that was already
//! torn down.

use super::{
    ConnectError, Connection, ConnectionId, ConnectionRole, ConnectionState, HealthConfig,
    RetryDefaults, RetrySchedule,
};
use crate::contact::ContactPoint;
use crate::identity::NodeId;
use crate::transport::{EstablishedLink, Frame, Link, PeerHello, Transport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Notifications emitted by the manager toward the node's event loop.
#[derive(Debug)]
pub enum NetEvent {
    /// A connection reached the Established state (new topology edge).
    Established {
        id: ConnectionId,
        peer: NodeId,
        display_name: String,
    },
    /// A usable connection went away (edge removal). `peer` is `None`
    /// only if the handshake never completed.
    Closed {
        id: ConnectionId,
        peer: Option<NodeId>,
    },
    /// A frame arrived on an established connection.
    Frame {
        id: ConnectionId,
        peer: NodeId,
        frame: Frame,
    },
}

struct Entry {
    conn: Connection,
    link: Option<Link>,
    /// Whether the local side still wants this connection up. Cleared by
    /// `disconnect`; retries stop once cleared.
    intended: bool,
    /// Bumped per established link; stale tasks compare and bail out.
    epoch: u64,
}

#[derive(Default)]
struct Table {
    by_contact: HashMap<ContactPoint, ConnectionId>,
    entries: HashMap<ConnectionId, Entry>,
}

impl Table {
    fn remove_contact_mapping(&mut self, contact: &ContactPoint, id: ConnectionId) {
        if self.by_contact.get(contact) == Some(&id) {
            self.by_contact.remove(contact);
        }
    }
}

struct ManagerInner {
    hello: PeerHello,
    transports: Mutex<HashMap<String, Arc<dyn Transport>>>,
    table: Mutex<Table>,
    next_id: AtomicU64,
    events: mpsc::Sender<NetEvent>,
    retry_defaults: RetryDefaults,
    health: HealthConfig,
    shutting_down: AtomicBool,
}

impl ManagerInner {
    fn lock_table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transport_for(&self, kind: &str) -> Option<Arc<dyn Transport>> {
        self.transports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(kind)
            .cloned()
    }
}

/// The connection lifecycle manager. Cheap to clone; all clones share one
/// table.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(
        hello: PeerHello,
        events: mpsc::Sender<NetEvent>,
        retry_defaults: RetryDefaults,
        health: HealthConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                hello,
                transports: Mutex::new(HashMap::new()),
                table: Mutex::new(Table::default()),
                next_id: AtomicU64::new(1),
                events,
                retry_defaults,
                health,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// The handshake information presented to remote nodes.
    pub fn local_hello(&self) -> PeerHello {
        self.inner.hello.clone()
    }

    /// Register a transport provider for its contact point token.
    pub fn register_transport(&self, transport: Arc<dyn Transport>) {
        let kind = transport.kind().to_string();
        self.inner
            .transports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind, transport);
    }

    /// Look up a registered transport provider.
    pub fn transport(&self, kind: &str) -> Option<Arc<dyn Transport>> {
        self.inner.transport_for(kind)
    }

    /// Request a connection to `contact`.
    ///
    /// Idempotent: while an effective (non-superseded) connection to the
    /// same contact point exists, its id is returned instead of creating a
    /// second one. Otherwise a Pending entry is created under the table
    /// lock (single-winner for racing callers) and the handshake proceeds
    /// asynchronously.
    pub fn connect(&self, contact: ContactPoint) -> Result<ConnectionId, ConnectError> {
        if self.inner.shutting_down.load(Ordering::Relaxed) {
            return Err(ConnectError::ShuttingDown);
        }

        let id = {
            let mut table = self.inner.lock_table();
            if let Some(&existing) = table.by_contact.get(&contact) {
                if table
                    .entries
                    .get(&existing)
                    .is_some_and(|e| e.conn.state().is_effective() && e.intended)
                {
                    debug!(contact = %contact, connection = %existing, "Reusing effective connection");
                    return Ok(existing);
                }
                table.by_contact.remove(&contact);
            }

            let id = ConnectionId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
            table.entries.insert(
                id,
                Entry {
                    conn: Connection::new(id, ConnectionRole::Client, contact.clone()),
                    link: None,
                    intended: true,
                    epoch: 0,
                },
            );
            table.by_contact.insert(contact.clone(), id);
            id
        };

        info!(connection = %id, contact = %contact, "Connection requested");
        let schedule = RetrySchedule::for_contact(&contact, &self.inner.retry_defaults);
        spawn_attempt(Arc::clone(&self.inner), id, contact, schedule);
        Ok(id)
    }

    /// Register an inbound link accepted by a listener.
    pub async fn register_inbound(&self, established: EstablishedLink, remote_ip: String) {
        if self.inner.shutting_down.load(Ordering::Relaxed) {
            established.link.close();
            return;
        }

        let peer = established.remote.node();
        let display_name = established.remote.display_name.clone();
        let advertised = established.remote.contact.clone();
        let contact = advertised
            .clone()
            .unwrap_or_else(|| ContactPoint::new("tcp", remote_ip.clone(), 0));

        let registered = {
            let mut table = self.inner.lock_table();
            if let Some(&existing) = table.by_contact.get(&contact) {
                if table
                    .entries
                    .get(&existing)
                    .is_some_and(|e| e.conn.state().is_effective())
                {
                    // at most one effective connection per contact point
                    info!(
                        contact = %contact,
                        connection = %existing,
                        "Rejecting duplicate inbound connection"
                    );
                    None
                } else {
                    table.by_contact.remove(&contact);
                    Some(insert_inbound(&mut table, self.inner.as_ref(), peer, contact.clone(), advertised.is_some(), &established))
                }
            } else {
                Some(insert_inbound(&mut table, self.inner.as_ref(), peer, contact.clone(), advertised.is_some(), &established))
            }
        };

        let Some(id) = registered else {
            established.link.close();
            return;
        };

        info!(
            connection = %id,
            peer = %peer,
            remote_ip = %remote_ip,
            "Inbound connection established"
        );
        let _ = self
            .inner
            .events
            .send(NetEvent::Established {
                id,
                peer,
                display_name,
            })
            .await;
        spawn_rx_loop(Arc::clone(&self.inner), id, peer, established.incoming, 1);
        spawn_health_monitor(Arc::clone(&self.inner), id, established.link, 1);
    }

    /// Close a connection by local request.
    ///
    /// Clears the intention flag so no further retries happen, removes the
    /// link, and emits a `Closed` event if an edge existed.
    pub async fn disconnect(&self, id: ConnectionId) -> Result<(), ConnectError> {
        let (link, peer, had_edge) = {
            let mut table = self.inner.lock_table();
            let entry = table
                .entries
                .get_mut(&id)
                .ok_or(ConnectError::NotFound(id))?;
            entry.intended = false;
            match entry.conn.state() {
                ConnectionState::Established | ConnectionState::HealthDegraded => {
                    entry.conn.transition(ConnectionState::Closing);
                    (entry.link.take(), entry.conn.peer().copied(), true)
                }
                ConnectionState::Pending
                | ConnectionState::Connecting
                | ConnectionState::Failed => {
                    entry.conn.transition(ConnectionState::Closed);
                    let contact = entry.conn.remote().clone();
                    table.remove_contact_mapping(&contact, id);
                    (None, None, false)
                }
                ConnectionState::Closing | ConnectionState::Closed => (None, None, false),
            }
        };

        if let Some(link) = link {
            link.close();
        }

        if had_edge {
            {
                let mut table = self.inner.lock_table();
                if let Some(entry) = table.entries.get_mut(&id) {
                    entry.conn.transition(ConnectionState::Closed);
                    let contact = entry.conn.remote().clone();
                    table.remove_contact_mapping(&contact, id);
                }
            }
            info!(connection = %id, "Connection closed by local request");
            let _ = self.inner.events.send(NetEvent::Closed { id, peer }).await;
        }
        Ok(())
    }

    /// Close every connection; used during node shutdown.
    pub async fn disconnect_all(&self) {
        self.inner.shutting_down.store(true, Ordering::Relaxed);
        let ids: Vec<ConnectionId> = {
            let table = self.inner.lock_table();
            table.entries.keys().copied().collect()
        };
        for id in ids {
            let _ = self.disconnect(id).await;
        }
    }

    /// Deliver a frame to all usable connections, optionally skipping the
    /// one the knowledge arrived on.
    pub async fn broadcast(&self, frame: Frame, except: Option<ConnectionId>) {
        let targets: Vec<(ConnectionId, Link)> = {
            let table = self.inner.lock_table();
            table
                .entries
                .iter()
                .filter(|(id, e)| Some(**id) != except && e.conn.state().is_usable())
                .filter_map(|(id, e)| e.link.clone().map(|l| (*id, l)))
                .collect()
        };
        for (id, link) in targets {
            if let Err(e) = link.send(frame.clone()).await {
                debug!(connection = %id, error = %e, "Failed to deliver broadcast frame");
            }
        }
    }

    /// Deliver a frame to one connection.
    pub async fn send_to(&self, id: ConnectionId, frame: Frame) -> Result<(), ConnectError> {
        let link = {
            let table = self.inner.lock_table();
            table
                .entries
                .get(&id)
                .filter(|e| e.conn.state().is_usable())
                .and_then(|e| e.link.clone())
                .ok_or(ConnectError::NotFound(id))?
        };
        link.send(frame)
            .await
            .map_err(|source| ConnectError::SendFailed { id, source })
    }

    /// Find a usable connection whose remote node is `peer`.
    pub fn find_by_peer(&self, peer: &NodeId) -> Option<ConnectionId> {
        let table = self.inner.lock_table();
        table
            .entries
            .iter()
            .filter(|(_, e)| e.conn.state().is_usable())
            .find(|(_, e)| e.conn.peer() == Some(peer))
            .map(|(id, _)| *id)
    }

    /// A point-in-time copy of one connection's record.
    pub fn snapshot(&self, id: ConnectionId) -> Option<Connection> {
        self.inner.lock_table().entries.get(&id).map(|e| e.conn.clone())
    }

    /// Copies of all connection records, in id order.
    pub fn list(&self) -> Vec<Connection> {
        let table = self.inner.lock_table();
        let mut list: Vec<Connection> = table.entries.values().map(|e| e.conn.clone()).collect();
        list.sort_by_key(|c| c.id());
        list
    }

    /// Number of table entries (including closed ones).
    pub fn connection_count(&self) -> usize {
        self.inner.lock_table().entries.len()
    }
}

fn insert_inbound(
    table: &mut Table,
    inner: &ManagerInner,
    peer: NodeId,
    contact: ContactPoint,
    key_by_contact: bool,
    established: &EstablishedLink,
) -> ConnectionId {
    let id = ConnectionId::new(inner.next_id.fetch_add(1, Ordering::Relaxed));
    let mut conn = Connection::new(id, ConnectionRole::Server, contact.clone());
    conn.transition(ConnectionState::Connecting);
    conn.mark_established(peer);
    table.entries.insert(
        id,
        Entry {
            conn,
            link: Some(established.link.clone()),
            intended: true,
            epoch: 1,
        },
    );
    if key_by_contact {
        table.by_contact.insert(contact, id);
    }
    id
}

/// Drive one outbound connection until it is established, given up, or no
/// longer wanted. Each failed attempt schedules the next one per the
/// backoff schedule.
fn spawn_attempt(
    inner: Arc<ManagerInner>,
    id: ConnectionId,
    contact: ContactPoint,
    mut schedule: RetrySchedule,
) {
    tokio::spawn(async move {
        loop {
            {
                let mut table = inner.lock_table();
                let Some(entry) = table.entries.get_mut(&id) else { return };
                if !entry.intended || !entry.conn.state().is_effective() {
                    return;
                }
                if !entry.conn.transition(ConnectionState::Connecting) {
                    return;
                }
            }

            let dial_result = match inner.transport_for(contact.transport()) {
                Some(transport) => transport.dial(&contact).await,
                None => {
                    warn!(
                        contact = %contact,
                        transport = contact.transport(),
                        "No transport provider registered"
                    );
                    Err(crate::transport::TransportError::ConnectionRefused(
                        contact.to_string(),
                    ))
                }
            };

            match dial_result {
                Ok(established) => {
                    let peer = established.remote.node();
                    let display_name = established.remote.display_name.clone();
                    let epoch = {
                        let mut table = inner.lock_table();
                        let Some(entry) = table.entries.get_mut(&id) else {
                            established.link.close();
                            return;
                        };
                        // closed by external request while the handshake was
                        // in flight: the fresh link must not resurrect it
                        if !entry.intended
                            || entry.conn.state() != ConnectionState::Connecting
                            || !entry.conn.mark_established(peer)
                        {
                            drop(table);
                            established.link.close();
                            return;
                        }
                        entry.link = Some(established.link.clone());
                        entry.epoch += 1;
                        entry.epoch
                    };

                    info!(connection = %id, peer = %peer, contact = %contact, "Connection established");
                    let _ = inner
                        .events
                        .send(NetEvent::Established {
                            id,
                            peer,
                            display_name,
                        })
                        .await;
                    spawn_rx_loop(Arc::clone(&inner), id, peer, established.incoming, epoch);
                    spawn_health_monitor(Arc::clone(&inner), id, established.link, epoch);
                    return;
                }
                Err(e) => {
                    {
                        let mut table = inner.lock_table();
                        let Some(entry) = table.entries.get_mut(&id) else { return };
                        if !entry.intended || !entry.conn.state().is_effective() {
                            return;
                        }
                        entry.conn.transition(ConnectionState::Failed);
                    }
                    if !contact.auto_retry() {
                        warn!(
                            connection = %id,
                            contact = %contact,
                            error = %e,
                            "Connect attempt failed; auto-retry disabled, giving up"
                        );
                        return;
                    }
                    let delay = schedule.next_delay();
                    info!(
                        connection = %id,
                        contact = %contact,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Connect attempt failed, scheduling retry"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    });
}

/// Forward inbound frames to the event channel until the link dies.
fn spawn_rx_loop(
    inner: Arc<ManagerInner>,
    id: ConnectionId,
    peer: NodeId,
    mut incoming: mpsc::Receiver<Frame>,
    epoch: u64,
) {
    tokio::spawn(async move {
        while let Some(frame) = incoming.recv().await {
            {
                let table = inner.lock_table();
                match table.entries.get(&id) {
                    Some(e) if e.epoch == epoch && e.conn.state().is_usable() => {}
                    _ => return,
                }
            }
            let _ = inner.events.send(NetEvent::Frame { id, peer, frame }).await;
        }
        handle_link_down(&inner, id, epoch, "link closed by remote").await;
    });
}

/// Periodic liveness probing for one established link.
fn spawn_health_monitor(inner: Arc<ManagerInner>, id: ConnectionId, link: Link, epoch: u64) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(inner.health.jittered_interval()).await;
            {
                let table = inner.lock_table();
                match table.entries.get(&id) {
                    Some(e) if e.epoch == epoch && e.conn.state().is_usable() => {}
                    _ => return,
                }
            }

            let healthy = matches!(
                tokio::time::timeout(inner.health.probe_timeout(), link.probe()).await,
                Ok(Ok(()))
            );

            let tripped = {
                let mut table = inner.lock_table();
                let Some(entry) = table.entries.get_mut(&id) else { return };
                // a probe completing after teardown must not touch the entry
                if entry.epoch != epoch || !entry.conn.state().is_usable() {
                    return;
                }
                if healthy {
                    if entry.conn.consecutive_health_failures() > 0 {
                        debug!(
                            connection = %id,
                            failures = entry.conn.consecutive_health_failures(),
                            "Health check passed after previous failures"
                        );
                    }
                    entry.conn.record_health_success();
                    false
                } else {
                    let failures = entry.conn.record_health_failure();
                    warn!(
                        connection = %id,
                        failures,
                        limit = inner.health.failure_limit,
                        "Connection health check failed"
                    );
                    failures >= inner.health.failure_limit
                }
            };

            if tripped {
                handle_link_down(&inner, id, epoch, "health check failure limit reached").await;
                return;
            }
        }
    });
}

/// Common teardown for a link lost without local request: mark Failed,
/// emit the edge removal, and schedule a reconnect when appropriate.
async fn handle_link_down(inner: &Arc<ManagerInner>, id: ConnectionId, epoch: u64, reason: &str) {
    let (peer, link, retry_contact) = {
        let mut table = inner.lock_table();
        let Some(entry) = table.entries.get_mut(&id) else { return };
        if entry.epoch != epoch || !entry.conn.state().is_usable() {
            // torn down by someone else in the meantime
            return;
        }
        entry.conn.transition(ConnectionState::Failed);
        let peer = entry.conn.peer().copied();
        let link = entry.link.take();
        let retry = (entry.intended
            && entry.conn.role() == ConnectionRole::Client
            && entry.conn.remote().auto_retry()
            && !inner.shutting_down.load(Ordering::Relaxed))
        .then(|| entry.conn.remote().clone());
        (peer, link, retry)
    };

    if let Some(link) = link {
        link.close();
    }
    warn!(connection = %id, reason, "Connection lost");
    let _ = inner.events.send(NetEvent::Closed { id, peer }).await;

    if let Some(contact) = retry_contact {
        let schedule = RetrySchedule::for_contact(&contact, &inner.retry_defaults);
        spawn_attempt(Arc::clone(inner), id, contact, schedule);
    }
}
