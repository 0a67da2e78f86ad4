//! Multi-node integration tests.
//!
//! The harness spins up N in-process nodes sharing an in-memory transport
//! hub, wires them into a topology shape, and polls the convergence
//! predicate (pairwise-equal compact graph forms). Contact points come
//! from an explicitly passed allocator so tests stay isolated and can run
//! in parallel.

mod convergence;

use crate::config::Config;
use crate::conn::HealthConfig;
use crate::contact::ContactPoint;
use crate::identity::NodeId;
use crate::node::Node;
use crate::transport::memory::{MemoryHub, MemoryTransport, MEMORY_TRANSPORT_KIND};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Allocates unique contact points and source IPs for one test network.
pub(super) struct ContactAllocator {
    next: u16,
}

impl ContactAllocator {
    fn new() -> Self {
        Self { next: 1 }
    }

    fn next_contact(&mut self) -> (ContactPoint, String) {
        let n = self.next;
        self.next += 1;
        (
            ContactPoint::new(MEMORY_TRANSPORT_KIND, format!("vnode-{}", n), 4000 + n),
            format!("10.0.0.{}", n),
        )
    }
}

/// One in-process node with its transport attachment.
pub(super) struct VirtualNode {
    pub(super) node: Node,
    pub(super) contact: ContactPoint,
    #[allow(dead_code)]
    pub(super) ip: String,
    _state_dir: TempDir,
}

impl VirtualNode {
    pub(super) fn id(&self) -> NodeId {
        *self.node.node_id()
    }

    pub(super) fn compact(&self) -> String {
        self.node.topology().compact()
    }
}

/// A test network: shared hub plus contact allocation.
pub(super) struct TestNet {
    pub(super) hub: MemoryHub,
    alloc: ContactAllocator,
}

/// Health tuning fast enough for tests while keeping
/// `interval > jitter + timeout`.
pub(super) fn fast_health() -> HealthConfig {
    HealthConfig {
        interval_msec: 60,
        max_jitter_msec: 20,
        timeout_msec: 25,
        failure_limit: 3,
    }
}

impl TestNet {
    pub(super) fn new() -> Self {
        Self {
            hub: MemoryHub::new(),
            alloc: ContactAllocator::new(),
        }
    }

    /// Spawn a started node. Virtual nodes default to relay=true, matching
    /// the convergence scenarios; production configs default to false.
    pub(super) async fn spawn_node(&mut self, relay: bool) -> VirtualNode {
        self.spawn_node_with(relay, |_| {}).await
    }

    /// Spawn a started node with extra configuration applied.
    pub(super) async fn spawn_node_with(
        &mut self,
        relay: bool,
        tweak: impl FnOnce(&mut Config),
    ) -> VirtualNode {
        let state_dir = TempDir::new().expect("temp state dir");
        let (contact, ip) = self.alloc.next_contact();

        let mut config = Config::new();
        config.relay = relay;
        config.state_dir = Some(state_dir.path().to_path_buf());
        config.health_check = fast_health();
        tweak(&mut config);

        let node = Node::new(config).expect("node creation");
        let transport = MemoryTransport::new(
            self.hub.clone(),
            node.hello_advertising(Some(contact.clone())),
            ip.clone(),
        );
        node.manager().register_transport(Arc::new(transport));
        node.add_listen_contact(contact.clone());
        node.start().await.expect("node start");

        VirtualNode {
            node,
            contact,
            ip,
            _state_dir: state_dir,
        }
    }

    /// Spawn `n` relay nodes.
    pub(super) async fn spawn_nodes(&mut self, n: usize) -> Vec<VirtualNode> {
        let mut nodes = Vec::with_capacity(n);
        for _ in 0..n {
            nodes.push(self.spawn_node(true).await);
        }
        nodes
    }
}

/// Dial `nodes[i] -> nodes[j]` for every edge.
pub(super) fn wire(nodes: &[VirtualNode], edges: &[(usize, usize)]) {
    for &(i, j) in edges {
        nodes[i]
            .node
            .connect(nodes[j].contact.clone())
            .expect("connect request");
    }
}

// === Topology shapes ===

pub(super) fn ring_edges(n: usize) -> Vec<(usize, usize)> {
    (0..n).map(|i| (i, (i + 1) % n)).collect()
}

pub(super) fn chain_edges(n: usize) -> Vec<(usize, usize)> {
    (0..n - 1).map(|i| (i, i + 1)).collect()
}

pub(super) fn star_edges(n: usize) -> Vec<(usize, usize)> {
    (1..n).map(|i| (0, i)).collect()
}

// === Convergence polling ===

/// Whether all nodes' compact graph forms are pairwise identical.
pub(super) fn converged(nodes: &[&VirtualNode]) -> bool {
    let mut forms = nodes.iter().map(|n| n.compact());
    match forms.next() {
        Some(first) => forms.all(|f| f == first),
        None => true,
    }
}

/// Poll `condition` for up to five seconds; panic with `what` on timeout.
pub(super) async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Poll until every node's compact form is identical.
pub(super) async fn wait_for_convergence(nodes: &[VirtualNode]) {
    let refs: Vec<&VirtualNode> = nodes.iter().collect();
    wait_until("topology convergence", || converged(&refs)).await;
}

/// Stop all nodes (cleanup).
pub(super) async fn stop_all(nodes: &[VirtualNode]) {
    for vn in nodes {
        let _ = vn.node.stop().await;
    }
}
