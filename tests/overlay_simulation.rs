//! Overlay construction and gossip delivery over the in-process simulator.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use streamnet::{DeliveryState, NodeEvent, NodeId, Simulator, StreamPartId};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;

use common::{fast_config, message, spawn_overlay, wait_until};

const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn five_nodes_converge_to_symmetric_full_mesh() {
    let sim = Simulator::new(11);
    let part = StreamPartId::new("five", 0);
    let config = fast_config(4, 11);
    let nodes = spawn_overlay(&sim, 5, &config, &part).await;

    let converged = {
        let nodes = &nodes;
        let part = &part;
        wait_until(CONVERGENCE_TIMEOUT, || async move {
            let mut lists: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
            for node in nodes {
                lists.insert(node.node_id(), node.get_neighbors(part).await);
            }
            lists.values().all(|l| l.len() == 4)
                && lists
                    .iter()
                    .all(|(id, list)| list.iter().all(|n| lists.get(n).is_some_and(|other| other.contains(id))))
        })
        .await
    };
    assert!(converged, "five node overlay did not converge to a symmetric 4-regular graph");

    for node in &nodes {
        assert_eq!(node.delivery_state(&part), Some(DeliveryState::Active));
        let purpose = part.to_string();
        assert_eq!(sim.locks_for_purpose(&node.node_id(), &purpose), 4, "one pin per neighbor");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn small_partition_caps_degree_at_member_count() {
    let sim = Simulator::new(5);
    let part = StreamPartId::new("three", 1);
    let nodes = spawn_overlay(&sim, 3, &fast_config(4, 5), &part).await;

    let converged = {
        let nodes = &nodes;
        let part = &part;
        wait_until(CONVERGENCE_TIMEOUT, || async move {
            for node in nodes {
                if node.get_neighbors(part).await.len() != 2 {
                    return false;
                }
            }
            true
        })
        .await
    };
    assert!(converged, "every node should list both other members");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn broadcast_reaches_256_nodes_exactly_once() {
    let sim = Simulator::new(256);
    let part = StreamPartId::new("large", 0);
    let config = fast_config(4, 256);
    let nodes = spawn_overlay(&sim, 256, &config, &part).await;

    let settled = {
        let nodes = &nodes;
        let part = &part;
        wait_until(Duration::from_secs(30), || async move {
            for node in nodes {
                if node.get_neighbors(part).await.len() < 2 {
                    return false;
                }
            }
            true
        })
        .await
    };
    assert!(settled, "every node should reach the minimum propagation degree");

    let mut receivers: Vec<_> = nodes.iter().map(|n| n.subscribe()).collect();
    let msg = message(&part, 0, b"to everyone");
    nodes[0].broadcast(msg.clone()).await.expect("broadcast");

    for (index, rx) in receivers.iter_mut().enumerate().skip(1) {
        let first = timeout(Duration::from_secs(10), async {
            loop {
                match rx.recv().await {
                    Ok(NodeEvent::NewMessage(m)) if m.message_id == msg.message_id => return true,
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return false,
                }
            }
        })
        .await;
        assert_eq!(first, Ok(true), "node {index} never received the broadcast");
    }

    // Gossip keeps echoing for a moment; no node may surface the message twice.
    tokio::time::sleep(Duration::from_millis(500)).await;
    for (index, rx) in receivers.iter_mut().enumerate() {
        while let Ok(event) = rx.try_recv() {
            if let NodeEvent::NewMessage(m) = event {
                assert_ne!(m.message_id, msg.message_id, "node {index} processed the message twice");
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn publisher_does_not_receive_its_own_message() {
    let sim = Simulator::new(3);
    let part = StreamPartId::new("echo", 0);
    let nodes = spawn_overlay(&sim, 4, &fast_config(3, 3), &part).await;
    let converged = {
        let nodes = &nodes;
        let part = &part;
        wait_until(CONVERGENCE_TIMEOUT, || async move {
            for node in nodes {
                if node.get_neighbors(part).await.is_empty() {
                    return false;
                }
            }
            true
        })
        .await
    };
    assert!(converged);

    let mut own = nodes[0].subscribe();
    let mut other = nodes[1].subscribe();
    let msg = message(&part, 1, b"self");
    nodes[0].broadcast(msg.clone()).await.expect("broadcast");

    let delivered = timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(NodeEvent::NewMessage(m)) = other.recv().await {
                return m;
            }
        }
    })
    .await
    .expect("neighbor receives message");
    assert_eq!(delivered, msg);

    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Ok(event) = own.try_recv() {
        assert!(!matches!(event, NodeEvent::NewMessage(_)), "publisher saw its own message");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leaving_node_is_dropped_by_neighbors_and_releases_pins() {
    let sim = Simulator::new(21);
    let part = StreamPartId::new("leave", 0);
    let nodes = spawn_overlay(&sim, 5, &fast_config(4, 21), &part).await;
    let purpose = part.to_string();

    let converged = {
        let nodes = &nodes;
        let part = &part;
        wait_until(CONVERGENCE_TIMEOUT, || async move {
            for node in nodes {
                if node.get_neighbors(part).await.len() != 4 {
                    return false;
                }
            }
            true
        })
        .await
    };
    assert!(converged);

    let leaver = nodes[4].clone();
    let mut removals = nodes[0].subscribe();
    leaver.leave_stream_part(&part).await;
    assert!(!leaver.has_stream_part(&part));
    assert_eq!(sim.locks_for_purpose(&leaver.node_id(), &purpose), 0);

    let removed = timeout(Duration::from_secs(2), async {
        loop {
            match removals.recv().await {
                Ok(NodeEvent::NeighborRemoved { node_id, .. }) if node_id == leaver.node_id() => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await;
    // The leave notice is acted on directly, well before a neighbor update.
    assert_eq!(removed, Ok(true));

    let dropped = {
        let remaining = &nodes[..4];
        let part = &part;
        let leaver_id = leaver.node_id();
        wait_until(Duration::from_secs(5), || async move {
            for node in remaining {
                if node.get_neighbors(part).await.contains(&leaver_id) {
                    return false;
                }
            }
            true
        })
        .await
    };
    assert!(dropped, "remaining nodes still list the node that left");
    for node in &nodes[..4] {
        assert_eq!(sim.lock_count(&node.node_id(), &leaver.node_id(), &purpose), 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_neighbor_is_dropped_by_neighbor_updates() {
    let sim = Simulator::new(8);
    let part = StreamPartId::new("failure", 0);
    let nodes = spawn_overlay(&sim, 4, &fast_config(3, 8), &part).await;

    let converged = {
        let nodes = &nodes;
        let part = &part;
        wait_until(CONVERGENCE_TIMEOUT, || async move {
            for node in nodes {
                if node.get_neighbors(part).await.len() != 3 {
                    return false;
                }
            }
            true
        })
        .await
    };
    assert!(converged);

    let failed = nodes[3].node_id();
    sim.set_unreachable(failed, true);
    let dropped = {
        let survivors = &nodes[..3];
        let part = &part;
        wait_until(Duration::from_secs(5), || async move {
            for node in survivors {
                if node.get_neighbors(part).await.contains(&failed) {
                    return false;
                }
            }
            true
        })
        .await
    };
    assert!(dropped, "survivors should drop the unreachable node");

    let purpose = part.to_string();
    for node in &nodes[..3] {
        assert_eq!(sim.lock_count(&node.node_id(), &failed, &purpose), 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn destroyed_network_holds_no_pins() {
    let sim = Simulator::new(31);
    let part = StreamPartId::new("teardown", 0);
    let nodes = spawn_overlay(&sim, 6, &fast_config(3, 31), &part).await;
    tokio::time::sleep(Duration::from_millis(800)).await;

    for node in &nodes {
        node.destroy().await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    for node in &nodes {
        assert!(node.is_destroyed());
        assert_eq!(sim.total_locks(&node.node_id()), 0, "node still pins connections after destroy");
    }
}
