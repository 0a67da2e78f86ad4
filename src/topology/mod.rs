//! Topology knowledge: the network graph and link-state advertisements.
//!
//! Each node reconstructs its own view of the overlay as a directed graph
//! whose vertices are node ids and whose edges mean "the source currently
//! has a live connection enabling traffic toward the target". Views are
//! compared across nodes through a canonical string form; two nodes with
//! equal compact representations hold the same knowledge.

mod store;

pub use store::{IngestOutcome, StatsSnapshot, TopologyStats, TopologyStore};

use crate::identity::NodeId;
use crate::utils::time::unix_millis;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

/// Why an LSA was issued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LsaKind {
    /// First advertisement after a node came up.
    Startup,
    /// Neighbor set changed.
    Update,
    /// The origin is going away; drop it from the graph.
    Shutdown,
}

/// A link-state advertisement: one node's versioned statement of its
/// current direct neighbor set.
///
/// Receivers accept an LSA only if its sequence number is newer than the
/// last one stored for the same origin, which keeps flooding loop-free and
/// prevents stale knowledge from overwriting fresh knowledge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lsa {
    pub origin: NodeId,
    pub sequence: u64,
    pub kind: LsaKind,
    pub neighbors: BTreeSet<NodeId>,
    pub timestamp_ms: u64,
}

impl Lsa {
    /// Build a startup advertisement.
    pub fn startup(origin: NodeId, sequence: u64, neighbors: BTreeSet<NodeId>) -> Self {
        Self {
            origin,
            sequence,
            kind: LsaKind::Startup,
            neighbors,
            timestamp_ms: unix_millis(),
        }
    }

    /// Build an update advertisement.
    pub fn update(origin: NodeId, sequence: u64, neighbors: BTreeSet<NodeId>) -> Self {
        Self {
            origin,
            sequence,
            kind: LsaKind::Update,
            neighbors,
            timestamp_ms: unix_millis(),
        }
    }

    /// Build a shutdown advertisement (empty neighbor set).
    pub fn shutdown(origin: NodeId, sequence: u64) -> Self {
        Self {
            origin,
            sequence,
            kind: LsaKind::Shutdown,
            neighbors: BTreeSet::new(),
            timestamp_ms: unix_millis(),
        }
    }
}

/// A node's reconstructed view of the overlay's reachability graph.
#[derive(Clone, PartialEq, Eq)]
pub struct NetworkGraph {
    local: NodeId,
    nodes: BTreeSet<NodeId>,
    edges: BTreeSet<(NodeId, NodeId)>,
}

impl NetworkGraph {
    /// Create a graph containing only the local node.
    pub fn new(local: NodeId) -> Self {
        let mut nodes = BTreeSet::new();
        nodes.insert(local);
        Self {
            local,
            nodes,
            edges: BTreeSet::new(),
        }
    }

    /// The node whose view this is.
    pub fn local(&self) -> &NodeId {
        &self.local
    }

    /// Insert a node.
    pub fn add_node(&mut self, node: NodeId) {
        self.nodes.insert(node);
    }

    /// Insert a directed edge, adding endpoints implicitly.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId) {
        self.nodes.insert(from);
        self.nodes.insert(to);
        self.edges.insert((from, to));
    }

    pub fn contains_node(&self, node: &NodeId) -> bool {
        self.nodes.contains(node)
    }

    pub fn contains_edge(&self, from: &NodeId, to: &NodeId) -> bool {
        self.edges.contains(&(*from, *to))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// All nodes, in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.iter()
    }

    /// Outgoing neighbors of a node, in id order.
    pub fn successors(&self, node: &NodeId) -> impl Iterator<Item = &NodeId> {
        self.edges
            .range((*node, NodeId::from_bytes([0; 16]))..=(*node, NodeId::from_bytes([0xff; 16])))
            .map(|(_, to)| to)
    }

    /// Canonical sorted string encoding of vertices and edges.
    ///
    /// Two nodes' views are considered converged when their compact forms
    /// are equal, so this must be deterministic across processes: both
    /// sets iterate in id order.
    pub fn compact(&self) -> String {
        let nodes: Vec<String> = self.nodes.iter().map(|n| n.to_string()).collect();
        let edges: Vec<String> = self
            .edges
            .iter()
            .map(|(a, b)| format!("{}>{}", a, b))
            .collect();
        format!("nodes[{}];links[{}]", nodes.join(","), edges.join(","))
    }

    /// One-line human summary for logs.
    pub fn summary(&self) -> String {
        format!("{} node(s), {} link(s)", self.nodes.len(), self.edges.len())
    }

    /// Hop distances from every node to `dest`, following edges forward.
    ///
    /// Implemented as a reverse breadth-first search from the destination.
    fn distances_to(&self, dest: &NodeId) -> BTreeMap<NodeId, usize> {
        let mut dist = BTreeMap::new();
        if !self.nodes.contains(dest) {
            return dist;
        }
        // reverse adjacency
        let mut preds: BTreeMap<&NodeId, Vec<&NodeId>> = BTreeMap::new();
        for (from, to) in &self.edges {
            preds.entry(to).or_default().push(from);
        }
        dist.insert(*dest, 0);
        let mut queue = VecDeque::new();
        queue.push_back(*dest);
        while let Some(current) = queue.pop_front() {
            let next_dist = dist[&current] + 1;
            if let Some(sources) = preds.get(&current) {
                for &src in sources {
                    if !dist.contains_key(src) {
                        dist.insert(*src, next_dist);
                        queue.push_back(*src);
                    }
                }
            }
        }
        dist
    }

    /// The next hop on a shortest path from `from` toward `dest`.
    ///
    /// Among equally short choices the lowest node id wins, which keeps
    /// the selection consistent within one node. Returns `None` when no
    /// path exists or `from == dest`.
    pub fn next_hop_toward(&self, from: &NodeId, dest: &NodeId) -> Option<NodeId> {
        if from == dest {
            return None;
        }
        let dist = self.distances_to(dest);
        let own = *dist.get(from)?;
        // successors iterate in id order, so the first match is the tie-break winner
        self.successors(from)
            .find(|n| dist.get(*n).is_some_and(|d| d + 1 == own))
            .copied()
    }
}

impl fmt::Debug for NetworkGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkGraph")
            .field("local", &self.local)
            .field("nodes", &self.nodes.len())
            .field("links", &self.edges.len())
            .finish()
    }
}
