//! Link-state convergence scenarios over in-memory networks.

use super::*;

/// Ring of 5: every node ends up with the same 5-node, 10-edge view.
#[tokio::test]
async fn ring_of_five_converges() {
    let mut net = TestNet::new();
    let nodes = net.spawn_nodes(5).await;
    wire(&nodes, &ring_edges(5));

    wait_for_convergence(&nodes).await;

    let graph = nodes[0].node.topology().graph();
    assert_eq!(graph.node_count(), 5);
    // each of the 5 connections contributes one edge per side
    assert_eq!(graph.edge_count(), 10);
    for vn in &nodes {
        assert!(graph.contains_node(&vn.id()));
    }
    stop_all(&nodes).await;
}

#[tokio::test]
async fn chain_converges() {
    let mut net = TestNet::new();
    let nodes = net.spawn_nodes(4).await;
    wire(&nodes, &chain_edges(4));

    wait_for_convergence(&nodes).await;
    assert_eq!(nodes[0].node.topology().graph().edge_count(), 6);
    stop_all(&nodes).await;
}

#[tokio::test]
async fn star_converges() {
    let mut net = TestNet::new();
    let nodes = net.spawn_nodes(5).await;
    wire(&nodes, &star_edges(5));

    wait_for_convergence(&nodes).await;
    let graph = nodes[4].node.topology().graph();
    assert_eq!(graph.node_count(), 5);
    assert_eq!(graph.edge_count(), 8);
    stop_all(&nodes).await;
}

/// Tearing one ring edge down floods a fresh view that all nodes share
/// again.
#[tokio::test]
async fn edge_teardown_reconverges() {
    let mut net = TestNet::new();
    let nodes = net.spawn_nodes(5).await;
    wire(&nodes, &ring_edges(5));
    wait_for_convergence(&nodes).await;
    let before = nodes[0].compact();

    // close the 0 -> 1 connection; the ring stays connected the long way
    let conn = nodes[0]
        .node
        .manager()
        .find_by_peer(&nodes[1].id())
        .expect("connection to neighbor");
    nodes[0].node.disconnect(conn).await.unwrap();

    let refs: Vec<&VirtualNode> = nodes.iter().collect();
    wait_until("re-convergence after teardown", || {
        converged(&refs) && refs[0].compact() != before
    })
    .await;

    let graph = nodes[2].node.topology().graph();
    assert_eq!(graph.node_count(), 5);
    assert_eq!(graph.edge_count(), 8);
    assert!(!graph.contains_edge(&nodes[0].id(), &nodes[1].id()));
    assert!(!graph.contains_edge(&nodes[1].id(), &nodes[0].id()));
    stop_all(&nodes).await;
}

/// A joiner arriving after the mesh went quiet still learns everything
/// through the initial knowledge transfer.
#[tokio::test]
async fn late_joiner_catches_up() {
    let mut net = TestNet::new();
    let mut nodes = net.spawn_nodes(3).await;
    wire(&nodes, &chain_edges(3));
    wait_for_convergence(&nodes).await;

    let joiner = net.spawn_node(true).await;
    joiner.node.connect(nodes[2].contact.clone()).unwrap();
    nodes.push(joiner);

    wait_for_convergence(&nodes).await;
    assert_eq!(nodes[0].node.topology().graph().node_count(), 4);
    stop_all(&nodes).await;
}

/// Two 3-node chains joined through a relay-flagged bridge merge into one
/// 7-node network.
#[tokio::test]
async fn relay_bridge_merges_meshes() {
    let mut net = TestNet::new();
    let nodes = net.spawn_nodes(7).await;
    // 0-1-2 and 4-5-6 are chains; 3 bridges into both
    wire(&nodes, &[(0, 1), (1, 2), (3, 2), (3, 4), (4, 5), (5, 6)]);

    wait_for_convergence(&nodes).await;

    let graph = nodes[0].node.topology().graph();
    assert_eq!(graph.node_count(), 7);
    assert_eq!(graph.edge_count(), 12);
    for vn in &nodes {
        assert!(graph.contains_node(&vn.id()));
    }
    stop_all(&nodes).await;
}

/// The same shape with the bridge's relay flag off must not merge: each
/// side converges among itself, never learning the other side.
#[tokio::test]
async fn non_relay_bridge_does_not_merge() {
    let mut net = TestNet::new();
    let a = net.spawn_nodes(3).await;
    let bridge = net.spawn_node(false).await;
    let b = net.spawn_nodes(3).await;

    wire(&a, &chain_edges(3));
    wire(&b, &chain_edges(3));
    bridge.node.connect(a[2].contact.clone()).unwrap();
    bridge.node.connect(b[0].contact.clone()).unwrap();

    // each side converges among itself (bridge node visible, no links of its own)
    let a_refs: Vec<&VirtualNode> = a.iter().collect();
    let b_refs: Vec<&VirtualNode> = b.iter().collect();
    wait_until("side A convergence", || {
        converged(&a_refs) && a_refs[0].node.topology().graph().contains_node(&bridge.id())
    })
    .await;
    wait_until("side B convergence", || {
        converged(&b_refs) && b_refs[0].node.topology().graph().contains_node(&bridge.id())
    })
    .await;

    // the two sides hold different views; no single 7-node graph exists
    assert_ne!(a[0].compact(), b[0].compact());
    let a_graph = a[0].node.topology().graph();
    for vn in &b {
        assert!(!a_graph.contains_node(&vn.id()));
    }
    let b_graph = b[0].node.topology().graph();
    for vn in &a {
        assert!(!b_graph.contains_node(&vn.id()));
    }

    // the bridge itself sees both sides but keeps that knowledge to itself
    let bridge_graph = bridge.node.topology().graph();
    assert_eq!(bridge_graph.node_count(), 7);

    stop_all(&a).await;
    stop_all(&b).await;
    let _ = bridge.node.stop().await;
}

/// A stopping node announces departure; the survivors drop it from their
/// common view.
#[tokio::test]
async fn shutdown_announcement_removes_node() {
    let mut net = TestNet::new();
    let nodes = net.spawn_nodes(3).await;
    wire(&nodes, &chain_edges(3));
    wait_for_convergence(&nodes).await;

    let departed = nodes[2].id();
    nodes[2].node.stop().await.unwrap();

    wait_until("survivors drop the departed node", || {
        let g0 = nodes[0].node.topology().graph();
        let g1 = nodes[1].node.topology().graph();
        !g0.contains_node(&departed)
            && !g1.contains_node(&departed)
            && g0.compact() == g1.compact()
    })
    .await;

    assert_eq!(nodes[0].node.topology().graph().node_count(), 2);
    stop_all(&nodes[..2]).await;
}
