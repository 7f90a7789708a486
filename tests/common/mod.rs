//! Shared helpers for the simulator-backed integration suites.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use streamnet::{
    DeliveryConfig, MessageId, NodeConfig, PeerDescriptor, Simulator, StreamMessage, StreamNode, StreamPartId, UserId,
};
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep};

/// Timings short enough for tests that wait on convergence.
pub fn fast_config(num_of_target_neighbors: usize, seed: u64) -> NodeConfig {
    NodeConfig {
        delivery: DeliveryConfig {
            num_of_target_neighbors,
            neighbor_update_interval: Duration::from_millis(200),
            neighbor_finder_initial_wait: Duration::from_millis(20),
            neighbor_finder_interval: Duration::from_millis(50),
            rpc_timeout: Duration::from_secs(1),
            split_avoidance_base_delay: Duration::from_millis(20),
            rng_seed: Some(seed),
            ..DeliveryConfig::default()
        },
        ..NodeConfig::default()
    }
}

pub fn spawn(sim: &Simulator, config: &NodeConfig) -> Arc<StreamNode> {
    let descriptor = PeerDescriptor::new(sim.random_node_id());
    sim.spawn_node(descriptor, config.clone()).expect("spawn node")
}

/// Spawn `count` nodes; the first joins alone, the rest join concurrently.
pub async fn spawn_overlay(
    sim: &Simulator,
    count: usize,
    config: &NodeConfig,
    stream_part: &StreamPartId,
) -> Vec<Arc<StreamNode>> {
    let nodes: Vec<Arc<StreamNode>> = (0..count).map(|_| spawn(sim, config)).collect();
    nodes[0]
        .join_stream_part(stream_part.clone())
        .await
        .expect("first join");
    let mut joins = JoinSet::new();
    for node in nodes.iter().skip(1).cloned() {
        let id = stream_part.clone();
        joins.spawn(async move { node.join_stream_part(id).await });
    }
    while let Some(joined) = joins.join_next().await {
        joined.expect("join task").expect("join stream part");
    }
    nodes
}

pub fn message(stream_part: &StreamPartId, sequence_number: u32, content: &[u8]) -> StreamMessage {
    StreamMessage {
        message_id: MessageId {
            stream_id: stream_part.stream_id().to_string(),
            stream_partition: stream_part.partition(),
            timestamp: 1_700_000_000_000,
            sequence_number,
            publisher_id: UserId::from_bytes([7u8; 20]),
            msg_chain_id: "chain".into(),
        },
        prev_msg_ref: None,
        content: content.to_vec(),
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(50)).await;
    }
}
