//! Relay/forwarding policy.
//!
//! The relay flag is static configuration, read once at construction. A
//! relay node reports its outbound connections in its LSAs, re-floods
//! third-party topology knowledge, and forwards payload traffic toward
//! destinations it is not directly connected to; this is what merges the
//! meshes of its peers into one logical network. A non-relay node still
//! floods its own advertisements so direct neighbors know it exists, but
//! it neither re-floods nor forwards on behalf of others.

use crate::identity::NodeId;
use crate::topology::NetworkGraph;

/// Forwarding decisions for one node.
#[derive(Clone, Copy, Debug)]
pub struct RelayPolicy {
    local: NodeId,
    relay: bool,
}

impl RelayPolicy {
    pub fn new(local: NodeId, relay: bool) -> Self {
        Self { local, relay }
    }

    /// Whether this node acts as a relay.
    pub fn is_relay(&self) -> bool {
        self.relay
    }

    /// Whether this node's own LSAs report its connections.
    pub fn reports_links(&self) -> bool {
        self.relay
    }

    /// Whether an accepted third-party LSA should be re-flooded.
    pub fn forwards_topology(&self) -> bool {
        self.relay
    }

    /// Whether a payload frame for `dest` should be handled at all.
    ///
    /// Traffic for this node is always accepted; traffic for others only
    /// on relay nodes.
    pub fn accepts_traffic_for(&self, dest: &NodeId) -> bool {
        *dest == self.local || self.relay
    }

    /// Pick the next hop for a payload frame addressed to `dest`.
    ///
    /// `None` means the frame cannot be forwarded here: the policy forbids
    /// it, the destination is unknown, or no route exists.
    pub fn next_hop(&self, graph: &NetworkGraph, dest: &NodeId) -> Option<NodeId> {
        if !self.accepts_traffic_for(dest) || *dest == self.local {
            return None;
        }
        graph.next_hop_toward(&self.local, dest)
    }
}
