//! # In-Process Simulator
//!
//! A single hub standing in for the network and the DHT, used by the tests
//! and the demo binary.
//!
//! | Piece | Implements |
//! |-------|------------|
//! | [`SimTransport`] | [`Transport`]: envelopes are bincode-encoded and decoded on every hop |
//! | [`SimLayer1`] | [`Layer1Node`]: per-partition membership with XOR-closest views |
//! | [`SimLayer1Factory`] | [`Layer1Factory`] |
//!
//! All nodes share one in-memory key/value store with TTLs, so entry point
//! records written by one node are visible to every other node. Reachability
//! can be toggled per node, and connection pins are counted per local node so
//! tests can assert that every lock was released.
//!
//! Requests are answered inline on the caller's task. Notifications are
//! delivered on a spawned task, like a fire-and-forget datagram.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::sync::broadcast;
use tracing::trace;

use crate::identity::{DataKey, NodeId, PeerDescriptor, StreamPartId, sort_by_distance};
use crate::locks::ConnectionLocks;
use crate::messages::{
    RpcEnvelope, RpcNotification, RpcPayload, RpcRequest, RpcResponse, deserialize_envelope, serialize_envelope,
};
use crate::node::{NodeConfig, StreamNode};
use crate::protocols::{ContactEvent, DataEntry, Layer1Factory, Layer1Node, RpcHandler, Transport};

/// Close contacts reported by a simulated Layer1 node.
pub const DEFAULT_LAYER1_NEIGHBOR_LIMIT: usize = 8;

const CONTACT_EVENT_CAPACITY: usize = 256;

/// Stream part id reserved for the node-wide rendezvous DHT.
const LAYER0_STREAM_ID: &str = "layer0";

struct StoredRecord {
    data: Vec<u8>,
    storer: PeerDescriptor,
    expires: Instant,
    deleted: bool,
}

struct Member {
    descriptor: PeerDescriptor,
    events: broadcast::Sender<ContactEvent>,
    joined: bool,
}

struct SimInner {
    handlers: RwLock<HashMap<NodeId, Weak<dyn RpcHandler>>>,
    unreachable: RwLock<HashSet<NodeId>>,
    locks: Mutex<HashMap<NodeId, ConnectionLocks>>,
    store: Mutex<HashMap<DataKey, Vec<StoredRecord>>>,
    partitions: Mutex<HashMap<StreamPartId, HashMap<NodeId, Member>>>,
    rng: Mutex<StdRng>,
    latency: Option<Duration>,
    neighbor_limit: usize,
    store_operations: AtomicUsize,
    delivered: AtomicUsize,
}

#[derive(Clone)]
pub struct Simulator {
    inner: Arc<SimInner>,
}

impl Simulator {
    pub fn new(seed: u64) -> Self {
        Self::with_latency(seed, None)
    }

    pub fn with_latency(seed: u64, latency: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(SimInner {
                handlers: RwLock::new(HashMap::new()),
                unreachable: RwLock::new(HashSet::new()),
                locks: Mutex::new(HashMap::new()),
                store: Mutex::new(HashMap::new()),
                partitions: Mutex::new(HashMap::new()),
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
                latency,
                neighbor_limit: DEFAULT_LAYER1_NEIGHBOR_LIMIT,
                store_operations: AtomicUsize::new(0),
                delivered: AtomicUsize::new(0),
            }),
        }
    }

    /// A fresh node id drawn from the simulator's seeded rng.
    pub fn random_node_id(&self) -> NodeId {
        match self.inner.rng.lock() {
            Ok(mut rng) => NodeId::random(&mut *rng),
            Err(_) => NodeId::random(&mut rand::thread_rng()),
        }
    }

    pub fn transport(&self, local: PeerDescriptor) -> Arc<SimTransport> {
        Arc::new(SimTransport {
            local,
            sim: self.clone(),
        })
    }

    /// Rendezvous DHT shared by every partition of one node.
    pub fn layer0(&self, local: PeerDescriptor) -> Arc<SimLayer1> {
        Arc::new(SimLayer1::new(self.clone(), local, StreamPartId::new(LAYER0_STREAM_ID, 0)))
    }

    pub fn layer1_factory(&self, local: PeerDescriptor) -> Arc<SimLayer1Factory> {
        Arc::new(SimLayer1Factory {
            sim: self.clone(),
            local,
        })
    }

    /// Route inbound RPCs for `id` to `handler`. Only a weak reference is kept.
    pub fn register<H: RpcHandler>(&self, id: NodeId, handler: &Arc<H>) {
        let weak: Weak<dyn RpcHandler> = Arc::downgrade(handler) as Weak<dyn RpcHandler>;
        if let Ok(mut handlers) = self.inner.handlers.write() {
            handlers.insert(id, weak);
        }
    }

    pub fn unregister(&self, id: &NodeId) {
        if let Ok(mut handlers) = self.inner.handlers.write() {
            handlers.remove(id);
        }
    }

    /// Build, register and start a [`StreamNode`] wired to this simulator.
    pub fn spawn_node(&self, local: PeerDescriptor, config: NodeConfig) -> Result<Arc<StreamNode>> {
        let node = Arc::new(StreamNode::new(
            config,
            self.transport(local.clone()),
            self.layer0(local.clone()),
            self.layer1_factory(local.clone()),
        ));
        self.register(local.node_id, &node);
        node.start().context("failed to start simulated node")?;
        Ok(node)
    }

    pub fn set_unreachable(&self, id: NodeId, unreachable: bool) {
        if let Ok(mut set) = self.inner.unreachable.write() {
            if unreachable {
                set.insert(id);
            } else {
                set.remove(&id);
            }
        }
    }

    fn is_reachable(&self, id: &NodeId) -> bool {
        self.inner.unreachable.read().is_ok_and(|set| !set.contains(id))
    }

    fn handler(&self, id: &NodeId) -> Option<Arc<dyn RpcHandler>> {
        self.inner.handlers.read().ok()?.get(id)?.upgrade()
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Pins held by `local` on its connection to `peer` for `purpose`.
    pub fn lock_count(&self, local: &NodeId, peer: &NodeId, purpose: &str) -> usize {
        self.inner
            .locks
            .lock()
            .ok()
            .and_then(|locks| locks.get(local).map(|l| l.count(peer, purpose)))
            .unwrap_or(0)
    }

    /// All pins held by `local`.
    pub fn total_locks(&self, local: &NodeId) -> usize {
        self.inner
            .locks
            .lock()
            .ok()
            .and_then(|locks| locks.get(local).map(ConnectionLocks::total))
            .unwrap_or(0)
    }

    pub fn locks_for_purpose(&self, local: &NodeId, purpose: &str) -> usize {
        self.inner
            .locks
            .lock()
            .ok()
            .and_then(|locks| locks.get(local).map(|l| l.count_for_purpose(purpose)))
            .unwrap_or(0)
    }

    /// Successful `store_data` calls across all nodes.
    pub fn store_operations(&self) -> usize {
        self.inner.store_operations.load(Ordering::SeqCst)
    }

    /// Live, non-deleted records under `key`.
    pub fn live_records(&self, key: &DataKey) -> usize {
        let now = Instant::now();
        self.inner
            .store
            .lock()
            .ok()
            .and_then(|store| {
                store
                    .get(key)
                    .map(|records| records.iter().filter(|r| !r.deleted && r.expires > now).count())
            })
            .unwrap_or(0)
    }

    /// Nodes that have joined the Layer1 DHT of `stream_part`.
    pub fn partition_members(&self, stream_part: &StreamPartId) -> Vec<NodeId> {
        self.inner
            .partitions
            .lock()
            .ok()
            .and_then(|partitions| {
                partitions
                    .get(stream_part)
                    .map(|members| members.values().filter(|m| m.joined).map(|m| m.descriptor.node_id).collect())
            })
            .unwrap_or_default()
    }

    /// Envelopes handed to a handler so far.
    pub fn delivered_envelopes(&self) -> usize {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Transport plumbing
    // ========================================================================

    fn check_link(&self, source: &NodeId, target: &NodeId) -> Result<()> {
        if !self.is_reachable(source) || !self.is_reachable(target) {
            bail!("{} is unreachable", target.short());
        }
        Ok(())
    }

    fn round_trip(&self, envelope: &RpcEnvelope) -> Result<RpcEnvelope> {
        let bytes = serialize_envelope(envelope).context("failed to encode envelope")?;
        deserialize_envelope(&bytes).context("failed to decode envelope")
    }

    async fn delay(&self) {
        if let Some(latency) = self.inner.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn with_locks<R>(&self, local: NodeId, f: impl FnOnce(&mut ConnectionLocks) -> R) -> Option<R> {
        let mut locks = self.inner.locks.lock().ok()?;
        Some(f(locks.entry(local).or_default()))
    }

    // ========================================================================
    // Layer1 membership
    // ========================================================================

    fn add_member(&self, stream_part: &StreamPartId, descriptor: PeerDescriptor, events: broadcast::Sender<ContactEvent>) {
        if let Ok(mut partitions) = self.inner.partitions.lock() {
            partitions.entry(stream_part.clone()).or_default().insert(
                descriptor.node_id,
                Member {
                    descriptor,
                    events,
                    joined: false,
                },
            );
        }
    }

    fn mark_joined(&self, stream_part: &StreamPartId, local: &PeerDescriptor, entry_points: &[PeerDescriptor]) -> Result<()> {
        let mut partitions = self
            .inner
            .partitions
            .lock()
            .map_err(|_| anyhow!("partition table poisoned"))?;
        let members = partitions
            .get_mut(stream_part)
            .ok_or_else(|| anyhow!("layer1 node for {stream_part} not started"))?;
        let reachable_seed = entry_points.iter().any(|p| {
            p.node_id == local.node_id
                || (self.is_reachable(&p.node_id) && members.get(&p.node_id).is_some_and(|m| m.joined))
        });
        // The local DHT node is up either way, it just starts out alone.
        let newly_joined = match members.get_mut(&local.node_id) {
            Some(member) => !std::mem::replace(&mut member.joined, true),
            None => bail!("layer1 node for {stream_part} not started"),
        };
        if newly_joined {
            for member in members.values().filter(|m| m.joined && m.descriptor.node_id != local.node_id) {
                let _ = member.events.send(ContactEvent::NewContact(local.clone()));
            }
        }
        if !reachable_seed {
            bail!("no reachable entry point for {stream_part}");
        }
        Ok(())
    }

    fn remove_member(&self, stream_part: &StreamPartId, local: &PeerDescriptor) {
        let Ok(mut partitions) = self.inner.partitions.lock() else {
            return;
        };
        let Some(members) = partitions.get_mut(stream_part) else {
            return;
        };
        let was_joined = members.remove(&local.node_id).is_some_and(|m| m.joined);
        if was_joined {
            for member in members.values().filter(|m| m.joined) {
                let _ = member.events.send(ContactEvent::ContactRemoved(local.clone()));
            }
        }
    }

    fn live_peers(&self, stream_part: &StreamPartId, local: &NodeId) -> Vec<PeerDescriptor> {
        let Ok(partitions) = self.inner.partitions.lock() else {
            return Vec::new();
        };
        let Some(members) = partitions.get(stream_part) else {
            return Vec::new();
        };
        if !members.get(local).is_some_and(|m| m.joined) {
            return Vec::new();
        }
        members
            .values()
            .filter(|m| m.joined && m.descriptor.node_id != *local && self.is_reachable(&m.descriptor.node_id))
            .map(|m| m.descriptor.clone())
            .collect()
    }
}

// ============================================================================
// Transport
// ============================================================================

pub struct SimTransport {
    local: PeerDescriptor,
    sim: Simulator,
}

#[async_trait]
impl Transport for SimTransport {
    fn local_descriptor(&self) -> PeerDescriptor {
        self.local.clone()
    }

    async fn request(&self, target: &PeerDescriptor, request: RpcRequest) -> Result<RpcResponse> {
        self.sim.check_link(&self.local.node_id, &target.node_id)?;
        let envelope = self.sim.round_trip(&RpcEnvelope {
            source: self.local.clone(),
            target: target.node_id,
            payload: RpcPayload::Request(request),
        })?;
        let RpcPayload::Request(request) = envelope.payload else {
            bail!("request envelope changed shape");
        };
        let handler = self
            .sim
            .handler(&target.node_id)
            .ok_or_else(|| anyhow!("no endpoint for {}", target.node_id.short()))?;
        self.sim.delay().await;
        self.sim.inner.delivered.fetch_add(1, Ordering::Relaxed);
        let response = handler.handle_request(envelope.source, request).await;

        self.sim.check_link(&target.node_id, &self.local.node_id)?;
        let envelope = self.sim.round_trip(&RpcEnvelope {
            source: target.clone(),
            target: self.local.node_id,
            payload: RpcPayload::Response(response),
        })?;
        self.sim.delay().await;
        match envelope.payload {
            RpcPayload::Response(RpcResponse::Error { message }) => Err(anyhow!("remote error: {message}")),
            RpcPayload::Response(response) => Ok(response),
            _ => bail!("response envelope changed shape"),
        }
    }

    async fn notify(&self, target: &PeerDescriptor, notification: RpcNotification) -> Result<()> {
        self.sim.check_link(&self.local.node_id, &target.node_id)?;
        let envelope = self.sim.round_trip(&RpcEnvelope {
            source: self.local.clone(),
            target: target.node_id,
            payload: RpcPayload::Notification(notification),
        })?;
        let RpcPayload::Notification(notification) = envelope.payload else {
            bail!("notification envelope changed shape");
        };
        let handler = self
            .sim
            .handler(&target.node_id)
            .ok_or_else(|| anyhow!("no endpoint for {}", target.node_id.short()))?;
        let sim = self.sim.clone();
        let source = envelope.source;
        tokio::spawn(async move {
            sim.delay().await;
            sim.inner.delivered.fetch_add(1, Ordering::Relaxed);
            handler.handle_notification(source, notification).await;
        });
        Ok(())
    }

    fn lock_connection(&self, target: &PeerDescriptor, purpose: &str) {
        self.sim
            .with_locks(self.local.node_id, |locks| locks.lock(target.node_id, purpose));
    }

    fn unlock_connection(&self, target: &PeerDescriptor, purpose: &str) {
        self.sim
            .with_locks(self.local.node_id, |locks| locks.unlock(target.node_id, purpose));
    }
}

// ============================================================================
// Layer1
// ============================================================================

pub struct SimLayer1 {
    sim: Simulator,
    local: PeerDescriptor,
    stream_part: StreamPartId,
    events: broadcast::Sender<ContactEvent>,
}

impl SimLayer1 {
    pub fn new(sim: Simulator, local: PeerDescriptor, stream_part: StreamPartId) -> Self {
        let (events, _) = broadcast::channel(CONTACT_EVENT_CAPACITY);
        Self {
            sim,
            local,
            stream_part,
            events,
        }
    }
}

#[async_trait]
impl Layer1Node for SimLayer1 {
    async fn start(&self) -> Result<()> {
        self.sim
            .add_member(&self.stream_part, self.local.clone(), self.events.clone());
        Ok(())
    }

    async fn stop(&self) {
        self.sim.remove_member(&self.stream_part, &self.local);
    }

    async fn join_dht(&self, entry_points: &[PeerDescriptor]) -> Result<()> {
        self.sim.delay().await;
        self.sim.mark_joined(&self.stream_part, &self.local, entry_points)?;
        trace!(stream_part = %self.stream_part, node = %self.local.node_id.short(), "joined simulated dht");
        Ok(())
    }

    fn neighbors(&self) -> Vec<PeerDescriptor> {
        let mut peers = self.sim.live_peers(&self.stream_part, &self.local.node_id);
        sort_by_distance(&self.local.node_id, &mut peers);
        peers.truncate(self.sim.inner.neighbor_limit);
        peers
    }

    fn neighbor_count(&self) -> usize {
        self.neighbors().len()
    }

    fn random_contacts(&self, limit: usize) -> Vec<PeerDescriptor> {
        let peers = self.sim.live_peers(&self.stream_part, &self.local.node_id);
        match self.sim.inner.rng.lock() {
            Ok(mut rng) => peers.choose_multiple(&mut *rng, limit).cloned().collect(),
            Err(_) => peers.into_iter().take(limit).collect(),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ContactEvent> {
        self.events.subscribe()
    }

    async fn store_data(&self, key: DataKey, data: Vec<u8>, ttl: Duration) -> Result<Vec<PeerDescriptor>> {
        if !self.sim.is_reachable(&self.local.node_id) {
            bail!("store from unreachable node");
        }
        self.sim.delay().await;
        let mut store = self
            .sim
            .inner
            .store
            .lock()
            .map_err(|_| anyhow!("data store poisoned"))?;
        let records = store.entry(key).or_default();
        records.retain(|r| r.storer != self.local);
        records.push(StoredRecord {
            data,
            storer: self.local.clone(),
            expires: Instant::now() + ttl,
            deleted: false,
        });
        self.sim.inner.store_operations.fetch_add(1, Ordering::SeqCst);
        Ok(vec![self.local.clone()])
    }

    async fn fetch_data(&self, key: DataKey) -> Result<Vec<DataEntry>> {
        if !self.sim.is_reachable(&self.local.node_id) {
            bail!("fetch from unreachable node");
        }
        self.sim.delay().await;
        let now = Instant::now();
        let store = self
            .sim
            .inner
            .store
            .lock()
            .map_err(|_| anyhow!("data store poisoned"))?;
        Ok(store
            .get(&key)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.expires > now)
                    .map(|r| DataEntry {
                        data: r.data.clone(),
                        storer: r.storer.clone(),
                        deleted: r.deleted,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_data(&self, key: DataKey) -> Result<()> {
        let mut store = self
            .sim
            .inner
            .store
            .lock()
            .map_err(|_| anyhow!("data store poisoned"))?;
        if let Some(records) = store.get_mut(&key) {
            for record in records.iter_mut().filter(|r| r.storer == self.local) {
                record.deleted = true;
            }
        }
        Ok(())
    }
}

pub struct SimLayer1Factory {
    sim: Simulator,
    local: PeerDescriptor,
}

impl Layer1Factory for SimLayer1Factory {
    fn create(&self, stream_part: &StreamPartId) -> Arc<dyn Layer1Node> {
        Arc::new(SimLayer1::new(self.sim.clone(), self.local.clone(), stream_part.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NODE_ID_LEN;
    use crate::messages::NeighborUpdate;

    fn peer(byte: u8) -> PeerDescriptor {
        PeerDescriptor::new(NodeId::from_bytes([byte; NODE_ID_LEN]))
    }

    struct Echo {
        notifications: AtomicUsize,
    }

    #[async_trait]
    impl RpcHandler for Echo {
        async fn handle_request(&self, source: PeerDescriptor, request: RpcRequest) -> RpcResponse {
            match request {
                RpcRequest::NeighborUpdate(update) => RpcResponse::NeighborUpdate(NeighborUpdate {
                    sender_id: update.sender_id,
                    stream_part_id: update.stream_part_id,
                    neighbor_descriptors: vec![source],
                    remove_me: false,
                }),
                _ => RpcResponse::Error {
                    message: "unsupported".into(),
                },
            }
        }

        async fn handle_notification(&self, _source: PeerDescriptor, _notification: RpcNotification) {
            self.notifications.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn update_request() -> RpcRequest {
        RpcRequest::NeighborUpdate(NeighborUpdate {
            sender_id: peer(1).node_id,
            stream_part_id: StreamPartId::new("s", 0),
            neighbor_descriptors: Vec::new(),
            remove_me: false,
        })
    }

    #[tokio::test]
    async fn requests_reach_registered_handler_and_respect_reachability() {
        let sim = Simulator::new(1);
        let echo = Arc::new(Echo {
            notifications: AtomicUsize::new(0),
        });
        sim.register(peer(2).node_id, &echo);
        let transport = sim.transport(peer(1));

        let response = transport.request(&peer(2), update_request()).await.expect("request");
        match response {
            RpcResponse::NeighborUpdate(update) => assert_eq!(update.neighbor_descriptors, vec![peer(1)]),
            other => panic!("unexpected response {other:?}"),
        }

        sim.set_unreachable(peer(2).node_id, true);
        assert!(transport.request(&peer(2), update_request()).await.is_err());
        sim.set_unreachable(peer(2).node_id, false);

        assert!(transport.request(&peer(3), update_request()).await.is_err());
    }

    #[tokio::test]
    async fn dropped_handler_is_unreachable() {
        let sim = Simulator::new(1);
        let echo = Arc::new(Echo {
            notifications: AtomicUsize::new(0),
        });
        sim.register(peer(2).node_id, &echo);
        drop(echo);
        let transport = sim.transport(peer(1));
        assert!(transport.request(&peer(2), update_request()).await.is_err());
    }

    #[tokio::test]
    async fn connection_locks_are_counted_per_local_node() {
        let sim = Simulator::new(1);
        let transport = sim.transport(peer(1));
        transport.lock_connection(&peer(2), "s#0");
        transport.lock_connection(&peer(2), "s#0");
        transport.lock_connection(&peer(2), "s#1");
        assert_eq!(sim.lock_count(&peer(1).node_id, &peer(2).node_id, "s#0"), 2);
        assert_eq!(sim.total_locks(&peer(1).node_id), 3);
        assert_eq!(sim.total_locks(&peer(2).node_id), 0);

        transport.unlock_connection(&peer(2), "s#0");
        transport.unlock_connection(&peer(2), "s#0");
        transport.unlock_connection(&peer(2), "s#1");
        assert_eq!(sim.total_locks(&peer(1).node_id), 0);
    }

    #[tokio::test]
    async fn layer1_join_announces_to_joined_members() {
        let sim = Simulator::new(1);
        let part = StreamPartId::new("s", 0);
        let first = SimLayer1::new(sim.clone(), peer(1), part.clone());
        let second = SimLayer1::new(sim.clone(), peer(2), part.clone());
        first.start().await.expect("start");
        second.start().await.expect("start");
        first.join_dht(&[peer(1)]).await.expect("self join");

        let mut events = first.subscribe();
        second.join_dht(&[peer(1)]).await.expect("join via first");
        match events.recv().await {
            Ok(ContactEvent::NewContact(p)) => assert_eq!(p, peer(2)),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(first.neighbors(), vec![peer(2)]);
        assert_eq!(second.random_contacts(5), vec![peer(1)]);

        second.stop().await;
        assert!(first.neighbors().is_empty());
        assert!(matches!(events.recv().await, Ok(ContactEvent::ContactRemoved(_))));
    }

    #[tokio::test]
    async fn layer1_join_without_live_seed_still_comes_up() {
        let sim = Simulator::new(1);
        let part = StreamPartId::new("s", 0);
        let seed = SimLayer1::new(sim.clone(), peer(1), part.clone());
        let joiner = SimLayer1::new(sim.clone(), peer(2), part.clone());
        seed.start().await.expect("start");
        joiner.start().await.expect("start");

        // The seed never joined, so it cannot answer.
        assert!(joiner.join_dht(&[peer(1)]).await.is_err());
        assert_eq!(sim.partition_members(&part), vec![peer(2).node_id]);
        assert!(joiner.neighbors().is_empty());

        let mut events = joiner.subscribe();
        seed.join_dht(&[peer(1)]).await.expect("self join");
        match events.recv().await {
            Ok(ContactEvent::NewContact(p)) => assert_eq!(p, peer(1)),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(joiner.neighbors(), vec![peer(1)]);
    }

    #[tokio::test]
    async fn stored_records_expire_and_can_be_deleted() {
        let sim = Simulator::new(1);
        let layer0 = sim.layer0(peer(1));
        let key = StreamPartId::new("s", 0).data_key();
        layer0
            .store_data(key, vec![1, 2, 3], Duration::from_secs(60))
            .await
            .expect("store");
        layer0
            .store_data(key, vec![4], Duration::from_secs(60))
            .await
            .expect("re-store");
        let entries = layer0.fetch_data(key).await.expect("fetch");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].data, vec![4]);
        assert_eq!(sim.store_operations(), 2);

        layer0.delete_data(key).await.expect("delete");
        let entries = layer0.fetch_data(key).await.expect("fetch");
        assert!(entries[0].deleted);
        assert_eq!(sim.live_records(&key), 0);

        layer0
            .store_data(key, vec![5], Duration::from_millis(1))
            .await
            .expect("short store");
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(layer0.fetch_data(key).await.expect("fetch").is_empty());
    }
}
