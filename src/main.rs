use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio::time::{self, Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use streamnet::{
    DeliveryConfig, MessageId, NodeConfig, NodeEvent, PeerDescriptor, Simulator, StreamMessage, StreamNode,
    StreamPartId, UserId,
};

#[derive(Parser, Debug)]
#[command(name = "streamnet")]
#[command(author, version, about = "Run a simulated stream partition overlay and broadcast through it", long_about = None)]
struct Args {
    /// Number of simulated nodes joining the partition.
    #[arg(short, long, default_value = "64")]
    nodes: usize,

    /// Target neighbor count per node.
    #[arg(short = 'k', long, default_value = "4")]
    neighbors: usize,

    #[arg(long, default_value = "2")]
    min_propagation_targets: usize,

    /// Time given to the overlay to converge, and to the broadcast to spread.
    #[arg(long, default_value = "3000")]
    settle_ms: u64,

    #[arg(long, default_value = "42")]
    seed: u64,

    #[arg(long, default_value = "demo-stream")]
    stream: String,

    #[arg(long, default_value = "0")]
    partition: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    anyhow::ensure!(args.nodes >= 2, "at least two nodes are needed");
    let stream_part = StreamPartId::new(args.stream.clone(), args.partition);
    let settle = Duration::from_millis(args.settle_ms);

    let sim = Simulator::new(args.seed);
    let config = NodeConfig {
        delivery: DeliveryConfig {
            num_of_target_neighbors: args.neighbors,
            min_propagation_targets: args.min_propagation_targets,
            neighbor_update_interval: Duration::from_millis(500),
            rng_seed: Some(args.seed),
            ..DeliveryConfig::default()
        },
        ..NodeConfig::default()
    };

    let mut nodes: Vec<Arc<StreamNode>> = Vec::with_capacity(args.nodes);
    for _ in 0..args.nodes {
        let descriptor = PeerDescriptor::new(sim.random_node_id());
        nodes.push(sim.spawn_node(descriptor, config.clone())?);
    }
    info!(nodes = nodes.len(), %stream_part, "spawned simulated nodes");

    // The first node finds an empty partition and registers as its entry point.
    nodes[0]
        .join_stream_part(stream_part.clone())
        .await
        .context("first node failed to join")?;
    let mut joins = JoinSet::new();
    for node in nodes.iter().skip(1).cloned() {
        let id = stream_part.clone();
        joins.spawn(async move { node.join_stream_part(id).await });
    }
    while let Some(joined) = joins.join_next().await {
        if let Ok(Err(e)) = joined {
            warn!(error = %e, "node failed to join");
        }
    }

    time::sleep(settle).await;
    let mut degrees: BTreeMap<usize, usize> = BTreeMap::new();
    for node in &nodes {
        *degrees.entry(node.get_neighbors(&stream_part).await.len()).or_default() += 1;
    }
    info!(?degrees, "neighbor count distribution (degree -> nodes)");

    let mut receivers: Vec<_> = nodes.iter().map(|n| n.subscribe()).collect();
    let message = StreamMessage {
        message_id: MessageId {
            stream_id: stream_part.stream_id().to_string(),
            stream_partition: stream_part.partition(),
            timestamp: 1,
            sequence_number: 0,
            publisher_id: UserId::from_bytes([1u8; 20]),
            msg_chain_id: "demo".into(),
        },
        prev_msg_ref: None,
        content: b"hello overlay".to_vec(),
    };
    nodes[0].broadcast(message.clone()).await?;

    let deadline = Instant::now() + settle;
    let mut received = 0usize;
    let mut duplicates = 0usize;
    for rx in receivers.iter_mut().skip(1) {
        let mut copies = 0usize;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = if copies == 0 { remaining } else { Duration::from_millis(10) };
            match time::timeout(wait, rx.recv()).await {
                Ok(Ok(NodeEvent::NewMessage(msg))) if msg.message_id == message.message_id => copies += 1,
                Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => {}
                Ok(Err(RecvError::Closed)) | Err(_) => break,
            }
        }
        if copies > 0 {
            received += 1;
        }
        duplicates += copies.saturating_sub(1);
    }
    info!(
        received,
        expected = nodes.len() - 1,
        duplicates,
        delivered_envelopes = sim.delivered_envelopes(),
        "broadcast finished"
    );
    if received + 1 < nodes.len() {
        warn!(missing = nodes.len() - 1 - received, "broadcast did not reach every node");
    }

    for node in &nodes {
        node.destroy().await;
    }
    Ok(())
}
