//! Local link-state database.
//!
//! The store holds what this node knows: its own live neighbor set plus the
//! most recent advertisement accepted from every other origin. It decides
//! which received advertisements are news (and therefore worth re-flooding)
//! and which are stale duplicates to drop, and it rebuilds the raw
//! [`NetworkGraph`] from the accepted knowledge on demand.
//!
//! A node that does not report its links (relay disabled) advertises an
//! empty neighbor set; its raw graph still contains its own live edges,
//! since those connections exist regardless of what is advertised.

use super::{Lsa, LsaKind, NetworkGraph};
use crate::identity::NodeId;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// Result of feeding a received LSA into the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// New knowledge; the caller should re-flood it (relay nodes only).
    Accepted,
    /// Out-of-order, duplicate, or otherwise uninteresting; drop silently.
    Stale,
}

impl IngestOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, IngestOutcome::Accepted)
    }
}

/// Flooding counters, exposed for logs and diagnostics.
#[derive(Debug, Default)]
pub struct TopologyStats {
    sent: AtomicU64,
    received: AtomicU64,
    accepted: AtomicU64,
    discarded: AtomicU64,
}

/// Point-in-time copy of [`TopologyStats`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sent: u64,
    pub received: u64,
    pub accepted: u64,
    pub discarded: u64,
}

impl TopologyStats {
    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

struct StoreInner {
    sequence: u64,
    local_neighbors: BTreeSet<NodeId>,
    /// Latest accepted LSA per remote origin. Shutdown advertisements stay
    /// as tombstones so their sequence numbers keep guarding against
    /// delayed older updates resurrecting a departed node.
    remote: HashMap<NodeId, Lsa>,
}

/// Thread-safe topology store for one node.
pub struct TopologyStore {
    local: NodeId,
    advertise_links: bool,
    inner: Mutex<StoreInner>,
    stats: TopologyStats,
}

impl TopologyStore {
    /// Create a store for `local`. `advertise_links` mirrors the relay
    /// flag: when false, own LSAs carry an empty neighbor set.
    pub fn new(local: NodeId, advertise_links: bool) -> Self {
        Self {
            local,
            advertise_links,
            inner: Mutex::new(StoreInner {
                sequence: 0,
                local_neighbors: BTreeSet::new(),
                remote: HashMap::new(),
            }),
            stats: TopologyStats::default(),
        }
    }

    /// The node this store belongs to.
    pub fn local_node(&self) -> &NodeId {
        &self.local
    }

    /// Flooding counters.
    pub fn stats(&self) -> &TopologyStats {
        &self.stats
    }

    /// Record a new live connection toward `peer` and produce the LSA to
    /// flood for it.
    pub fn local_edge_added(&self, peer: NodeId) -> Lsa {
        let mut inner = self.lock();
        inner.local_neighbors.insert(peer);
        self.bump_own_lsa(&mut inner, LsaKind::Update)
    }

    /// Record a torn-down connection toward `peer` and produce the LSA to
    /// flood for it.
    pub fn local_edge_removed(&self, peer: &NodeId) -> Lsa {
        let mut inner = self.lock();
        inner.local_neighbors.remove(peer);
        self.bump_own_lsa(&mut inner, LsaKind::Update)
    }

    /// Produce the departure announcement flooded during shutdown.
    pub fn shutdown_lsa(&self) -> Lsa {
        let mut inner = self.lock();
        inner.sequence += 1;
        Lsa::shutdown(self.local, inner.sequence)
    }

    /// Produce the initial announcement flooded right after startup.
    pub fn startup_lsa(&self) -> Lsa {
        let mut inner = self.lock();
        inner.sequence += 1;
        let neighbors = self.advertised_neighbors(&inner);
        Lsa::startup(self.local, inner.sequence, neighbors)
    }

    /// The knowledge this node shares with a freshly established
    /// neighbor, own LSA first.
    ///
    /// Sent as a batch so knowledge that stopped changing before the link
    /// existed still reaches late joiners. A node that does not forward
    /// topology (relay disabled) shares only its own advertisement;
    /// handing over third-party knowledge would merge meshes it is not
    /// supposed to merge.
    pub fn known_lsas(&self) -> Vec<Lsa> {
        let inner = self.lock();
        let mut lsas = Vec::with_capacity(inner.remote.len() + 1);
        lsas.push(Lsa::update(
            self.local,
            inner.sequence,
            self.advertised_neighbors(&inner),
        ));
        if self.advertise_links {
            lsas.extend(inner.remote.values().cloned());
        }
        lsas
    }

    /// Feed a received advertisement into the store.
    pub fn ingest(&self, lsa: Lsa) -> IngestOutcome {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let outcome = self.ingest_inner(lsa);
        match outcome {
            IngestOutcome::Accepted => self.stats.accepted.fetch_add(1, Ordering::Relaxed),
            IngestOutcome::Stale => self.stats.discarded.fetch_add(1, Ordering::Relaxed),
        };
        outcome
    }

    fn ingest_inner(&self, lsa: Lsa) -> IngestOutcome {
        // own knowledge is authoritative; never accept it from the network
        if lsa.origin == self.local {
            return IngestOutcome::Stale;
        }

        let mut inner = self.lock();
        match inner.remote.get(&lsa.origin) {
            Some(existing) if lsa.sequence <= existing.sequence => {
                debug!(
                    origin = %lsa.origin,
                    sequence = lsa.sequence,
                    stored = existing.sequence,
                    "Discarding stale LSA"
                );
                IngestOutcome::Stale
            }
            None if lsa.kind == LsaKind::Shutdown => {
                // departure notice for a node we never knew; nothing to do
                IngestOutcome::Stale
            }
            _ => {
                if lsa.kind == LsaKind::Shutdown {
                    debug!(origin = %lsa.origin, "Peer announced shutdown; removing from topology");
                }
                inner.remote.insert(lsa.origin, lsa);
                IngestOutcome::Accepted
            }
        }
    }

    /// Rebuild the raw graph from local connections plus accepted LSAs.
    pub fn graph(&self) -> NetworkGraph {
        let inner = self.lock();
        let mut graph = NetworkGraph::new(self.local);
        for peer in &inner.local_neighbors {
            graph.add_edge(self.local, *peer);
        }
        for (origin, lsa) in &inner.remote {
            if lsa.kind == LsaKind::Shutdown {
                continue;
            }
            graph.add_node(*origin);
            for neighbor in &lsa.neighbors {
                graph.add_edge(*origin, *neighbor);
            }
        }
        graph
    }

    /// Canonical form of the current raw graph.
    pub fn compact(&self) -> String {
        self.graph().compact()
    }

    fn bump_own_lsa(&self, inner: &mut StoreInner, kind: LsaKind) -> Lsa {
        inner.sequence += 1;
        let neighbors = self.advertised_neighbors(inner);
        match kind {
            LsaKind::Startup => Lsa::startup(self.local, inner.sequence, neighbors),
            _ => Lsa::update(self.local, inner.sequence, neighbors),
        }
    }

    fn advertised_neighbors(&self, inner: &StoreInner) -> BTreeSet<NodeId> {
        if self.advertise_links {
            inner.local_neighbors.clone()
        } else {
            BTreeSet::new()
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for TopologyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("TopologyStore")
            .field("local", &self.local)
            .field("sequence", &inner.sequence)
            .field("local_neighbors", &inner.local_neighbors.len())
            .field("known_origins", &inner.remote.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(val: u8) -> NodeId {
        let mut bytes = [0u8; 16];
        bytes[0] = val;
        NodeId::from_bytes(bytes)
    }

    fn neighbors(ids: &[NodeId]) -> BTreeSet<NodeId> {
        ids.iter().copied().collect()
    }

    #[test]
    fn local_edges_always_appear_in_graph() {
        // even a non-advertising node sees its own live connections
        for advertise in [true, false] {
            let store = TopologyStore::new(id(1), advertise);
            store.local_edge_added(id(2));
            let graph = store.graph();
            assert!(graph.contains_edge(&id(1), &id(2)));
        }
    }

    #[test]
    fn advertised_neighbor_set_depends_on_relay_flag() {
        let reporting = TopologyStore::new(id(1), true);
        let lsa = reporting.local_edge_added(id(2));
        assert_eq!(lsa.neighbors, neighbors(&[id(2)]));

        let silent = TopologyStore::new(id(1), false);
        let lsa = silent.local_edge_added(id(2));
        assert!(lsa.neighbors.is_empty());
    }

    #[test]
    fn sequence_numbers_increase_per_change() {
        let store = TopologyStore::new(id(1), true);
        let a = store.local_edge_added(id(2));
        let b = store.local_edge_added(id(3));
        let c = store.local_edge_removed(&id(2));
        assert!(a.sequence < b.sequence);
        assert!(b.sequence < c.sequence);
        assert_eq!(c.neighbors, neighbors(&[id(3)]));
    }

    #[test]
    fn newer_lsa_is_accepted_and_replaces() {
        let store = TopologyStore::new(id(1), true);
        assert!(store
            .ingest(Lsa::update(id(2), 1, neighbors(&[id(3)])))
            .is_accepted());
        assert!(store
            .ingest(Lsa::update(id(2), 2, neighbors(&[id(4)])))
            .is_accepted());

        let graph = store.graph();
        assert!(graph.contains_edge(&id(2), &id(4)));
        assert!(!graph.contains_edge(&id(2), &id(3)));
    }

    #[test]
    fn duplicate_and_out_of_order_lsas_are_discarded() {
        let store = TopologyStore::new(id(1), true);
        assert!(store
            .ingest(Lsa::update(id(2), 5, neighbors(&[id(3)])))
            .is_accepted());
        assert_eq!(
            store.ingest(Lsa::update(id(2), 5, neighbors(&[id(9)]))),
            IngestOutcome::Stale
        );
        assert_eq!(
            store.ingest(Lsa::update(id(2), 4, neighbors(&[id(9)]))),
            IngestOutcome::Stale
        );
        // knowledge unchanged
        assert!(store.graph().contains_edge(&id(2), &id(3)));
    }

    #[test]
    fn own_origin_is_never_accepted_from_network() {
        let store = TopologyStore::new(id(1), true);
        assert_eq!(
            store.ingest(Lsa::update(id(1), 99, neighbors(&[id(7)]))),
            IngestOutcome::Stale
        );
        assert!(!store.graph().contains_edge(&id(1), &id(7)));
    }

    #[test]
    fn shutdown_removes_node_and_blocks_older_updates() {
        let store = TopologyStore::new(id(1), true);
        store.ingest(Lsa::update(id(2), 3, neighbors(&[id(3)])));
        assert!(store.ingest(Lsa::shutdown(id(2), 4)).is_accepted());

        let graph = store.graph();
        assert!(!graph.contains_node(&id(2)));

        // a delayed older update must not resurrect the node
        assert_eq!(
            store.ingest(Lsa::update(id(2), 3, neighbors(&[id(3)]))),
            IngestOutcome::Stale
        );
        assert!(!store.graph().contains_node(&id(2)));

        // but a genuinely newer startup may bring it back
        assert!(store
            .ingest(Lsa::startup(id(2), 5, neighbors(&[id(3)])))
            .is_accepted());
        assert!(store.graph().contains_edge(&id(2), &id(3)));
    }

    #[test]
    fn shutdown_for_unknown_origin_is_discarded() {
        let store = TopologyStore::new(id(1), true);
        assert_eq!(store.ingest(Lsa::shutdown(id(9), 1)), IngestOutcome::Stale);
    }

    #[test]
    fn known_lsas_cover_self_and_remotes() {
        let store = TopologyStore::new(id(1), true);
        store.local_edge_added(id(2));
        store.ingest(Lsa::update(id(2), 1, neighbors(&[id(1)])));

        let lsas = store.known_lsas();
        assert_eq!(lsas.len(), 2);
        assert_eq!(lsas[0].origin, id(1));
        assert_eq!(lsas[0].neighbors, neighbors(&[id(2)]));
        assert!(lsas.iter().any(|l| l.origin == id(2)));
    }

    #[test]
    fn non_reporting_node_shares_only_its_own_lsa() {
        let store = TopologyStore::new(id(1), false);
        store.local_edge_added(id(2));
        store.ingest(Lsa::update(id(2), 1, neighbors(&[id(1)])));

        let lsas = store.known_lsas();
        assert_eq!(lsas.len(), 1);
        assert_eq!(lsas[0].origin, id(1));
        assert!(lsas[0].neighbors.is_empty());
    }

    #[test]
    fn stats_track_ingest_outcomes() {
        let store = TopologyStore::new(id(1), true);
        store.ingest(Lsa::update(id(2), 1, neighbors(&[])));
        store.ingest(Lsa::update(id(2), 1, neighbors(&[])));
        store.stats().record_sent();

        let snapshot = store.stats().snapshot();
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.accepted, 1);
        assert_eq!(snapshot.discarded, 1);
        assert_eq!(snapshot.sent, 1);
    }
}
