//! Directional proxy connections between constrained and full nodes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use streamnet::{NodeConfig, NodeError, NodeEvent, ProxyDirection, Simulator, StreamNode, StreamPartId, UserId};
use tokio::time::timeout;

use common::{fast_config, message, spawn, spawn_overlay, wait_until};

fn proxy_server_config(seed: u64) -> NodeConfig {
    let mut config = fast_config(4, seed);
    config.delivery.accept_proxy_connections = true;
    config
}

fn user() -> UserId {
    UserId::from_bytes([3u8; 20])
}

async fn server_overlay(sim: &Simulator, part: &StreamPartId, count: usize) -> Vec<Arc<StreamNode>> {
    let nodes = spawn_overlay(sim, count, &proxy_server_config(99), part).await;
    let connected = {
        let nodes = &nodes;
        wait_until(Duration::from_secs(10), || async move {
            for node in nodes {
                if node.get_neighbors(part).await.len() + 1 < count {
                    return false;
                }
            }
            true
        })
        .await
    };
    assert!(connected, "server overlay did not converge");
    nodes
}

fn proxied_error(err: &anyhow::Error) -> Option<ProxyDirection> {
    match err.downcast_ref::<NodeError>() {
        Some(NodeError::ProxiedStreamPart { direction, .. }) => Some(*direction),
        _ => None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn publish_proxy_rejects_full_join() {
    let sim = Simulator::new(1);
    let part = StreamPartId::new("proxied", 0);
    let servers = server_overlay(&sim, &part, 2).await;
    let client = spawn(&sim, &fast_config(4, 1));

    client
        .set_proxies(part.clone(), vec![servers[0].peer_descriptor()], ProxyDirection::Publish, user(), None)
        .await
        .expect("set proxies");
    assert!(client.is_proxied_stream_part(&part, None));
    assert!(client.is_proxied_stream_part(&part, Some(ProxyDirection::Publish)));
    assert!(client.has_proxy_connection(&part, &servers[0].node_id(), ProxyDirection::Publish));
    assert!(servers[0].has_proxy_connection(&part, &client.node_id(), ProxyDirection::Publish));

    let err = client
        .join_stream_part(part.clone())
        .await
        .expect_err("joining a publish-proxied part must fail");
    assert_eq!(proxied_error(&err), Some(ProxyDirection::Publish));
    assert!(err.to_string().contains("publish"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subscribe_proxy_rejects_broadcast() {
    let sim = Simulator::new(2);
    let part = StreamPartId::new("proxied", 1);
    let servers = server_overlay(&sim, &part, 2).await;
    let client = spawn(&sim, &fast_config(4, 2));

    client
        .set_proxies(part.clone(), vec![servers[0].peer_descriptor()], ProxyDirection::Subscribe, user(), None)
        .await
        .expect("set proxies");

    let err = client
        .broadcast(message(&part, 0, b"upstream"))
        .await
        .expect_err("publishing on a subscribe-proxied part must fail");
    assert_eq!(proxied_error(&err), Some(ProxyDirection::Subscribe));

    // Joining is allowed to be a no-op for a subscribe proxy.
    client.join_stream_part(part.clone()).await.expect("join is a no-op");
    assert!(client.is_proxied_stream_part(&part, Some(ProxyDirection::Subscribe)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subscribe_proxy_receives_overlay_traffic() {
    let sim = Simulator::new(3);
    let part = StreamPartId::new("downstream", 0);
    let servers = server_overlay(&sim, &part, 3).await;
    let client = spawn(&sim, &fast_config(4, 3));
    client
        .set_proxies(part.clone(), vec![servers[0].peer_descriptor()], ProxyDirection::Subscribe, user(), None)
        .await
        .expect("set proxies");

    let mut events = client.subscribe();
    let msg = message(&part, 5, b"fan out");
    servers[2].broadcast(msg.clone()).await.expect("broadcast");

    let received = timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(NodeEvent::NewMessage(m)) = events.recv().await {
                return m;
            }
        }
    })
    .await
    .expect("client receives through proxy");
    assert_eq!(received, msg);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn publish_proxy_feeds_the_overlay() {
    let sim = Simulator::new(4);
    let part = StreamPartId::new("upstream", 0);
    let servers = server_overlay(&sim, &part, 3).await;
    let client = spawn(&sim, &fast_config(4, 4));
    client
        .set_proxies(part.clone(), vec![servers[0].peer_descriptor()], ProxyDirection::Publish, user(), None)
        .await
        .expect("set proxies");

    let mut receivers: Vec<_> = servers.iter().map(|s| s.subscribe()).collect();
    let msg = message(&part, 9, b"from the edge");
    client.broadcast(msg.clone()).await.expect("broadcast through proxy");

    for rx in &mut receivers {
        let received = timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(NodeEvent::NewMessage(m)) = rx.recv().await {
                    return m;
                }
            }
        })
        .await
        .expect("server receives published message");
        assert_eq!(received.message_id, msg.message_id);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn proxy_server_cannot_become_a_client() {
    let sim = Simulator::new(5);
    let part = StreamPartId::new("conflict", 0);
    let server = spawn(&sim, &proxy_server_config(5));
    let other = spawn(&sim, &proxy_server_config(6));

    let err = server
        .set_proxies(part, vec![other.peer_descriptor()], ProxyDirection::Subscribe, user(), None)
        .await
        .expect_err("proxy servers cannot use proxies");
    assert!(matches!(err.downcast_ref::<NodeError>(), Some(NodeError::AcceptsProxyConnections)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_proxy_list_tears_the_part_down() {
    let sim = Simulator::new(6);
    let part = StreamPartId::new("teardown", 0);
    let servers = server_overlay(&sim, &part, 2).await;
    let client = spawn(&sim, &fast_config(4, 6));
    client
        .set_proxies(part.clone(), vec![servers[0].peer_descriptor()], ProxyDirection::Subscribe, user(), None)
        .await
        .expect("set proxies");
    assert!(client.has_stream_part(&part));
    assert_eq!(sim.locks_for_purpose(&client.node_id(), &part.to_string()), 1);

    client
        .set_proxies(part.clone(), Vec::new(), ProxyDirection::Subscribe, user(), None)
        .await
        .expect("clear proxies");
    assert!(!client.has_stream_part(&part));
    assert_eq!(sim.locks_for_purpose(&client.node_id(), &part.to_string()), 0);

    let server = servers[0].clone();
    let client_id = client.node_id();
    let part_ref = &part;
    let released = wait_until(Duration::from_secs(2), || {
        let server = server.clone();
        async move { !server.has_proxy_connection(part_ref, &client_id, ProxyDirection::Subscribe) }
    })
    .await;
    assert!(released, "server should drop the connection on the client's leave notice");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connection_count_limits_proxies() {
    let sim = Simulator::new(7);
    let part = StreamPartId::new("count", 0);
    let servers = server_overlay(&sim, &part, 3).await;
    let client = spawn(&sim, &fast_config(4, 7));
    let peers = servers.iter().map(|s| s.peer_descriptor()).collect::<Vec<_>>();

    client
        .set_proxies(part.clone(), peers.clone(), ProxyDirection::Subscribe, user(), Some(2))
        .await
        .expect("set proxies");
    assert_eq!(client.get_neighbors(&part).await.len(), 2);

    client
        .set_proxies(part.clone(), peers, ProxyDirection::Subscribe, user(), Some(1))
        .await
        .expect("shrink proxies");
    assert_eq!(client.get_neighbors(&part).await.len(), 1);
    assert_eq!(sim.locks_for_purpose(&client.node_id(), &part.to_string()), 1);
}
