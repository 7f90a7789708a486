//! Entry point rendezvous through the simulated DHT.

mod common;

use std::sync::Arc;
use std::time::Duration;

use streamnet::{
    AbortScope, DeliveryState, EntryPointConfig, EntryPointDiscovery, ENTRYPOINT_STORE_LIMIT, Layer1Factory,
    Layer1Node, NETWORK_SPLIT_AVOIDANCE_LIMIT, NodeEvent, PeerDescriptor, Simulator, StreamPartId,
};
use tokio::time::{sleep, timeout};

use common::{fast_config, spawn, spawn_overlay, wait_until};

fn discovery(sim: &Simulator, local: &PeerDescriptor, part: &StreamPartId) -> Arc<EntryPointDiscovery> {
    discovery_with(sim, local, part, EntryPointConfig::default(), AbortScope::new()).0
}

fn discovery_with(
    sim: &Simulator,
    local: &PeerDescriptor,
    part: &StreamPartId,
    config: EntryPointConfig,
    scope: AbortScope,
) -> (Arc<EntryPointDiscovery>, Arc<dyn Layer1Node>) {
    let layer1 = sim.layer1_factory(local.clone()).create(part);
    let discovery = Arc::new(EntryPointDiscovery::new(
        part.clone(),
        local.clone(),
        layer1.clone(),
        sim.layer0(local.clone()),
        config,
        scope,
    ));
    (discovery, layer1)
}

/// Registers a fresh peer as entry point and then stops all of its loops,
/// leaving its record in the store like a crashed node would.
async fn crashed_entry_point(sim: &Simulator, part: &StreamPartId) -> PeerDescriptor {
    let peer = PeerDescriptor::new(sim.random_node_id());
    let scope = AbortScope::new();
    let (record, _) = discovery_with(sim, &peer, part, EntryPointConfig::default(), scope.clone());
    record.store_self_as_entry_point_if_necessary(0).await;
    scope.abort();
    peer
}

fn quick_split_avoidance(max_attempts: u32) -> EntryPointConfig {
    EntryPointConfig {
        store_interval: Duration::from_secs(30),
        split_avoidance_base_delay: Duration::from_millis(10),
        split_avoidance_max_attempts: max_attempts,
        ..EntryPointConfig::default()
    }
}

fn keep_alive_only(store_interval: Duration, ttl: Duration) -> EntryPointConfig {
    EntryPointConfig {
        store_interval,
        ttl,
        split_avoidance_max_attempts: 0,
        ..EntryPointConfig::default()
    }
}

#[tokio::test]
async fn empty_partition_yields_self_as_sole_entry_point() {
    let sim = Simulator::new(1);
    let local = PeerDescriptor::new(sim.random_node_id());
    let part = StreamPartId::new("empty", 0);
    let discovery = discovery(&sim, &local, &part);

    let result = discovery.discover_entry_points_from_dht(0).await;
    assert!(result.entry_points_from_dht);
    assert_eq!(result.discovered_entry_points, vec![local]);
}

#[tokio::test]
async fn known_entry_points_skip_the_dht() {
    let sim = Simulator::new(1);
    let local = PeerDescriptor::new(sim.random_node_id());
    let part = StreamPartId::new("known", 0);
    let discovery = discovery(&sim, &local, &part);

    let result = discovery.discover_entry_points_from_dht(2).await;
    assert!(!result.entry_points_from_dht);
    assert!(result.discovered_entry_points.is_empty());
}

#[tokio::test]
async fn registered_node_does_not_register_twice() {
    let sim = Simulator::new(2);
    let local = PeerDescriptor::new(sim.random_node_id());
    let part = StreamPartId::new("once", 0);
    let discovery = discovery(&sim, &local, &part);

    discovery.store_self_as_entry_point_if_necessary(1).await;
    assert!(discovery.is_local_node_entry_point());
    assert_eq!(sim.store_operations(), 1);

    discovery.store_self_as_entry_point_if_necessary(1).await;
    discovery.store_self_as_entry_point_if_necessary(0).await;
    assert_eq!(sim.store_operations(), 1, "second registration must be skipped");
    assert_eq!(sim.live_records(&part.data_key()), 1);

    discovery.destroy().await;
    assert!(!discovery.is_local_node_entry_point());
    assert_eq!(sim.live_records(&part.data_key()), 0);
}

#[tokio::test]
async fn deleted_and_undecodable_records_are_ignored() {
    let sim = Simulator::new(3);
    let part = StreamPartId::new("stale", 0);
    let key = part.data_key();

    let departed = PeerDescriptor::new(sim.random_node_id());
    let record = discovery(&sim, &departed, &part);
    record.store_self_as_entry_point_if_necessary(0).await;
    record.destroy().await;
    let garbage_storer = sim.layer0(PeerDescriptor::new(sim.random_node_id()));
    garbage_storer
        .store_data(key, vec![0xFF, 0x01], Duration::from_secs(60))
        .await
        .expect("store garbage");

    let local = PeerDescriptor::new(sim.random_node_id());
    let result = discovery(&sim, &local, &part).discover_entry_points_from_dht(0).await;
    assert_eq!(result.discovered_entry_points, vec![local]);
}

#[tokio::test]
async fn fetch_failure_is_treated_as_no_data() {
    let sim = Simulator::new(4);
    let part = StreamPartId::new("unreachable", 0);
    let registered = PeerDescriptor::new(sim.random_node_id());
    discovery(&sim, &registered, &part)
        .store_self_as_entry_point_if_necessary(0)
        .await;

    let local = PeerDescriptor::new(sim.random_node_id());
    sim.set_unreachable(local.node_id, true);
    let result = discovery(&sim, &local, &part).discover_entry_points_from_dht(0).await;
    assert!(result.entry_points_from_dht);
    assert_eq!(result.discovered_entry_points, vec![local]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn first_joiner_registers_and_later_joiners_find_it() {
    let sim = Simulator::new(5);
    let part = StreamPartId::new("rendezvous", 0);
    let config = fast_config(4, 5);

    let first = spawn(&sim, &config);
    first.join_stream_part(part.clone()).await.expect("first join");
    assert!(first.is_local_entry_point(&part));
    assert_eq!(sim.live_records(&part.data_key()), 1);

    let second = spawn(&sim, &config);
    second.join_stream_part(part.clone()).await.expect("second join");
    let linked = {
        let (first, second, part) = (&first, &second, &part);
        wait_until(Duration::from_secs(5), || async move {
            first.get_neighbors(part).await.contains(&second.node_id())
                && second.get_neighbors(part).await.contains(&first.node_id())
        })
        .await
    };
    assert!(linked, "second joiner should reach the first through its record");
    assert_eq!(sim.partition_members(&part).len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn seeded_entry_points_are_not_registered() {
    let sim = Simulator::new(6);
    let part = StreamPartId::new("seeded", 0);
    let config = fast_config(4, 6);

    let first = spawn(&sim, &config);
    first.set_stream_part_entry_points(part.clone(), vec![first.peer_descriptor()]);
    first.join_stream_part(part.clone()).await.expect("join");
    assert!(!first.is_local_entry_point(&part));
    assert_eq!(sim.store_operations(), 0);

    let second = spawn(&sim, &config);
    second.set_stream_part_entry_points(part.clone(), vec![first.peer_descriptor()]);
    second.join_stream_part(part.clone()).await.expect("join");
    assert_eq!(sim.store_operations(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leaving_deletes_the_entry_point_record() {
    let sim = Simulator::new(7);
    let part = StreamPartId::new("cleanup", 0);
    let node = spawn(&sim, &fast_config(4, 7));
    node.join_stream_part(part.clone()).await.expect("join");
    assert_eq!(sim.live_records(&part.data_key()), 1);

    node.leave_stream_part(&part).await;
    assert_eq!(sim.live_records(&part.data_key()), 0);
    assert!(sim.partition_members(&part).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn entry_point_departure_is_reported_to_neighbors() {
    let sim = Simulator::new(8);
    let part = StreamPartId::new("departure", 0);
    let nodes = spawn_overlay(&sim, 2, &fast_config(4, 8), &part).await;
    let (entry_point, other) = (&nodes[0], &nodes[1]);

    let part_ref = &part;
    let linked = wait_until(Duration::from_secs(5), || async move {
        other.get_neighbors(part_ref).await.contains(&entry_point.node_id())
    })
    .await;
    assert!(linked);
    assert!(entry_point.is_local_entry_point(&part));

    let mut events = other.subscribe();
    entry_point.leave_stream_part(&part).await;
    let detected = timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(NodeEvent::EntryPointLeaveDetected { stream_part }) => return stream_part,
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
    .expect("entry point leave detected");
    assert_eq!(detected, part);

    // The remaining node is still registered, so the partition stays discoverable.
    let sim_ref = &sim;
    let discoverable = wait_until(Duration::from_secs(2), || async move {
        sim_ref.live_records(&part_ref.data_key()) >= 1
    })
    .await;
    assert!(discoverable);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_entry_point_does_not_block_joining() {
    let sim = Simulator::new(9);
    let part = StreamPartId::new("crashed", 0);
    let config = fast_config(4, 9);

    let first = spawn(&sim, &config);
    first.join_stream_part(part.clone()).await.expect("first join");
    sim.set_unreachable(first.node_id(), true);

    let second = spawn(&sim, &config);
    second
        .join_stream_part(part.clone())
        .await
        .expect("join despite an unreachable entry point");
    assert!(second.has_stream_part(&part));
    assert_eq!(second.delivery_state(&part), Some(DeliveryState::Active));
    assert!(second.is_local_entry_point(&part));
    assert_eq!(sim.live_records(&part.data_key()), 2);

    let third = spawn(&sim, &config);
    third.join_stream_part(part.clone()).await.expect("third join");
    let linked = {
        let (second, third, part) = (&second, &third, &part);
        wait_until(Duration::from_secs(5), || async move {
            third.get_neighbors(part).await.contains(&second.node_id())
        })
        .await
    };
    assert!(linked, "later joiners should reach the node that took over");
    assert!(!third.get_neighbors(&part).await.contains(&first.node_id()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn split_avoidance_skips_entry_points_that_stay_unreachable() {
    let sim = Simulator::new(10);
    let part = StreamPartId::new("isolated", 0);
    let stale = crashed_entry_point(&sim, &part).await;
    sim.set_unreachable(stale.node_id, true);

    let local = PeerDescriptor::new(sim.random_node_id());
    let (discovery, layer1) = discovery_with(&sim, &local, &part, quick_split_avoidance(4), AbortScope::new());
    layer1.start().await.expect("start layer1");
    let found = discovery.discover_entry_points_from_dht(0).await;
    assert_eq!(found.discovered_entry_points, vec![stale.clone()]);
    assert!(layer1.join_dht(&found.discovered_entry_points).await.is_err());

    discovery
        .store_self_as_entry_point_if_necessary(found.discovered_entry_points.len())
        .await;
    assert!(discovery.is_local_node_entry_point());
    let remembered = {
        let discovery = &discovery;
        wait_until(Duration::from_secs(2), || async move { discovery.avoided_count() == 1 }).await
    };
    assert!(remembered, "the unreachable entry point should be remembered");

    let rediscovered = discovery.discover_entry_points_from_dht(0).await;
    assert_eq!(rediscovered.discovered_entry_points, vec![local.clone()]);

    // Every round fails, so nothing is forgotten once the attempts run out.
    sleep(Duration::from_millis(500)).await;
    assert_eq!(discovery.avoided_count(), 1);
    discovery.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn successful_split_avoidance_forgets_skipped_entry_points() {
    let sim = Simulator::new(11);
    let part = StreamPartId::new("recovering", 0);
    let stale = crashed_entry_point(&sim, &part).await;
    sim.set_unreachable(stale.node_id, true);

    let local = PeerDescriptor::new(sim.random_node_id());
    let (discovery, layer1) = discovery_with(&sim, &local, &part, quick_split_avoidance(8), AbortScope::new());
    layer1.start().await.expect("start layer1");
    discovery.store_self_as_entry_point_if_necessary(1).await;
    let remembered = {
        let discovery = &discovery;
        wait_until(Duration::from_secs(2), || async move { discovery.avoided_count() == 1 }).await
    };
    assert!(remembered);

    let mut peers = Vec::new();
    for _ in 0..NETWORK_SPLIT_AVOIDANCE_LIMIT {
        let peer = PeerDescriptor::new(sim.random_node_id());
        let peer_layer1 = sim.layer1_factory(peer.clone()).create(&part);
        peer_layer1.start().await.expect("start peer");
        peer_layer1.join_dht(&[local.clone()]).await.expect("join through local");
        peers.push(peer_layer1);
    }

    let forgotten = {
        let discovery = &discovery;
        wait_until(Duration::from_secs(5), || async move { discovery.avoided_count() == 0 }).await
    };
    assert!(forgotten, "a successful round should clear the skip set");
    assert!(layer1.neighbor_count() >= NETWORK_SPLIT_AVOIDANCE_LIMIT);
    discovery.destroy().await;
}

#[tokio::test]
async fn keep_alive_restores_record_while_partition_is_small() {
    let sim = Simulator::new(12);
    let part = StreamPartId::new("small", 0);
    let local = PeerDescriptor::new(sim.random_node_id());
    let config = keep_alive_only(Duration::from_millis(50), Duration::from_secs(60));
    let (discovery, _) = discovery_with(&sim, &local, &part, config, AbortScope::new());

    discovery.store_self_as_entry_point_if_necessary(0).await;
    assert_eq!(sim.store_operations(), 1);
    let refreshed = {
        let sim = &sim;
        wait_until(Duration::from_secs(2), || async move { sim.store_operations() >= 4 }).await
    };
    assert!(refreshed, "the record should be re-stored every interval");
    assert_eq!(sim.live_records(&part.data_key()), 1);

    discovery.destroy().await;
    let stopped_at = sim.store_operations();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(sim.store_operations(), stopped_at);
    assert_eq!(sim.live_records(&part.data_key()), 0);
}

#[tokio::test]
async fn keep_alive_stops_once_enough_other_entry_points_exist() {
    let sim = Simulator::new(13);
    let part = StreamPartId::new("crowded", 0);
    let local = PeerDescriptor::new(sim.random_node_id());
    let config = keep_alive_only(Duration::from_millis(150), Duration::from_millis(50));
    let (discovery, _) = discovery_with(&sim, &local, &part, config, AbortScope::new());

    discovery.store_self_as_entry_point_if_necessary(0).await;
    for _ in 0..ENTRYPOINT_STORE_LIMIT {
        crashed_entry_point(&sim, &part).await;
    }
    let registered = sim.store_operations();
    assert_eq!(registered, 1 + ENTRYPOINT_STORE_LIMIT);

    // Our own record expires before the first tick and is not renewed.
    sleep(Duration::from_millis(700)).await;
    assert_eq!(sim.store_operations(), registered);
    assert_eq!(sim.live_records(&part.data_key()), ENTRYPOINT_STORE_LIMIT);
    assert!(discovery.is_local_node_entry_point());
    discovery.destroy().await;
}
