//! # Stream Node API
//!
//! A [`StreamNode`] is the upward-facing entry point of the overlay. It owns
//! one [`StreamPartDelivery`] per stream partition and routes inbound RPCs to
//! it by the stream part id carried in every message.
//!
//! ## Quick Start
//!
//! ```ignore
//! let sim = Simulator::new(7);
//! let node = sim.spawn_node(PeerDescriptor::new(id), NodeConfig::default()).await?;
//!
//! let mut events = node.subscribe();
//! node.join_stream_part(StreamPartId::new("prices", 0)).await?;
//! node.broadcast(message).await?;
//!
//! while let Ok(NodeEvent::NewMessage(msg)) = events.recv().await {
//!     println!("got {:?}", msg.message_id);
//! }
//! ```
//!
//! ## Partition variants
//!
//! | Variant | Composition |
//! |---------|-------------|
//! | `FullGraph` | Layer1 DHT node + [`DeliveryLayerNode`] + [`EntryPointDiscovery`] |
//! | `Proxy` | [`ProxyClient`] relaying through full nodes |
//!
//! A partition is either one or the other. Publishing on a subscribe-only
//! proxied partition, or joining a publish-only proxied partition as a full
//! participant, fails with [`NodeError::ProxiedStreamPart`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, trace, warn};

use crate::delivery::{DeliveryConfig, DeliveryLayerNode, DeliveryState};
use crate::entry_point::EntryPointDiscovery;
use crate::events::{EventEmitter, NodeEvent};
use crate::identity::{NodeId, PeerDescriptor, StreamPartId, UserId};
use crate::messages::{ProxyDirection, RpcNotification, RpcRequest, RpcResponse, StreamMessage};
use crate::propagation::Propagation;
use crate::protocols::{Layer1Factory, Layer1Node, RpcHandler, Transport};
use crate::proxy::ProxyClient;
use crate::remote::RpcContext;
use crate::scope::AbortScope;

/// Entry points handed to one Layer1 DHT join.
const ENTRY_POINT_SAMPLE_SIZE: usize = 4;

// ============================================================================
// Errors and configuration
// ============================================================================

/// Misuse of the node API, surfaced to the caller.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("stream part {stream_part} is proxied in {direction} direction")]
    ProxiedStreamPart {
        stream_part: StreamPartId,
        direction: ProxyDirection,
    },
    #[error("node accepts proxy connections and cannot be a proxy client")]
    AcceptsProxyConnections,
    #[error("node has been destroyed")]
    Destroyed,
    #[error("node has not been started")]
    NotStarted,
    #[error("already started")]
    AlreadyStarted,
}

#[derive(Clone, Debug, Default)]
pub struct NodeConfig {
    /// Template applied to every joined partition.
    pub delivery: DeliveryConfig,
    /// Partitions seeded with entry points skip DHT discovery.
    pub known_entry_points: HashMap<StreamPartId, Vec<PeerDescriptor>>,
}

/// Per-partition composition, selected once at join time.
#[derive(Clone)]
pub enum StreamPartDelivery {
    FullGraph {
        layer1: Arc<dyn Layer1Node>,
        node: Arc<DeliveryLayerNode>,
        discovery: Arc<EntryPointDiscovery>,
    },
    Proxy {
        client: Arc<ProxyClient>,
    },
}

#[derive(Clone, Debug)]
pub struct StreamPartInfo {
    pub id: StreamPartId,
    pub neighbors: Vec<NodeId>,
    pub layer1_neighbors: Vec<PeerDescriptor>,
    pub proxied: Option<ProxyDirection>,
}

#[derive(Clone, Debug)]
pub struct NodeInfo {
    pub peer_descriptor: PeerDescriptor,
    pub stream_parts: Vec<StreamPartInfo>,
}

// ============================================================================
// Stream node
// ============================================================================

pub struct StreamNode {
    transport: Arc<dyn Transport>,
    layer0: Arc<dyn Layer1Node>,
    layer1_factory: Arc<dyn Layer1Factory>,
    config: DeliveryConfig,
    known_entry_points: RwLock<HashMap<StreamPartId, Vec<PeerDescriptor>>>,
    stream_parts: RwLock<HashMap<StreamPartId, StreamPartDelivery>>,
    events: EventEmitter,
    scope: AbortScope,
    rng: Mutex<StdRng>,
    started: AtomicBool,
    destroyed: AtomicBool,
}

impl StreamNode {
    /// `layer0` holds the entry point records of every partition;
    /// `layer1_factory` creates the per-partition DHT views.
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        layer0: Arc<dyn Layer1Node>,
        layer1_factory: Arc<dyn Layer1Factory>,
    ) -> Self {
        let local = transport.local_descriptor();
        let rng = match config.delivery.rng_seed {
            Some(seed) => {
                let mut salt = [0u8; 8];
                salt.copy_from_slice(&local.node_id.as_bytes()[..8]);
                StdRng::seed_from_u64(seed ^ u64::from_le_bytes(salt))
            }
            None => StdRng::from_entropy(),
        };
        Self {
            transport,
            layer0,
            layer1_factory,
            config: config.delivery,
            known_entry_points: RwLock::new(config.known_entry_points),
            stream_parts: RwLock::new(HashMap::new()),
            events: EventEmitter::default(),
            scope: AbortScope::new(),
            rng: Mutex::new(rng),
            started: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Start reacting to node-level events. Must be called before joining.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(NodeError::Destroyed.into());
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(NodeError::AlreadyStarted.into());
        }
        let mut events = self.events.subscribe();
        let node = Arc::downgrade(self);
        self.scope.spawn(async move {
            loop {
                match events.recv().await {
                    Ok(NodeEvent::EntryPointLeaveDetected { stream_part }) => {
                        let Some(node) = node.upgrade() else { return };
                        node.handle_entry_point_leave(&stream_part).await;
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return,
                }
            }
        });
        info!(node = %self.node_id().short(), "stream node started");
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(NodeError::Destroyed.into());
        }
        if !self.started.load(Ordering::SeqCst) {
            return Err(NodeError::NotStarted.into());
        }
        Ok(())
    }

    fn fork_rng(&self) -> StdRng {
        match self.rng.lock() {
            Ok(mut rng) => StdRng::seed_from_u64(rng.r#gen()),
            Err(_) => StdRng::from_entropy(),
        }
    }

    fn delivery(&self, id: &StreamPartId) -> Option<StreamPartDelivery> {
        self.stream_parts.read().ok()?.get(id).cloned()
    }

    fn context(&self, id: &StreamPartId) -> RpcContext {
        RpcContext::new(self.transport.clone(), id.clone(), self.config.rpc_timeout)
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Join `id` as a full participant. A no-op if already joined.
    pub async fn join_stream_part(&self, id: StreamPartId) -> Result<()> {
        self.ensure_running()?;
        if self.is_proxied_stream_part(&id, Some(ProxyDirection::Publish)) {
            return Err(NodeError::ProxiedStreamPart {
                stream_part: id,
                direction: ProxyDirection::Publish,
            }
            .into());
        }
        if self.has_stream_part(&id) {
            return Ok(());
        }

        let layer1 = self.layer1_factory.create(&id);
        let scope = self.scope.child();
        let discovery = Arc::new(EntryPointDiscovery::new(
            id.clone(),
            self.peer_descriptor(),
            layer1.clone(),
            self.layer0.clone(),
            self.config.entry_point(),
            scope.child(),
        ));
        let mut rng = self.fork_rng();
        let node = Arc::new(DeliveryLayerNode::new(
            self.context(&id),
            self.config.clone(),
            layer1.clone(),
            self.events.clone(),
            &mut rng,
            scope,
            discovery.registration_flag(),
        ));

        // Registered before starting so that inbound handshakes are routed
        // while the Layer1 join is still in flight.
        {
            let mut parts = self
                .stream_parts
                .write()
                .map_err(|_| anyhow::anyhow!("stream part registry poisoned"))?;
            if parts.contains_key(&id) {
                return Ok(());
            }
            parts.insert(
                id.clone(),
                StreamPartDelivery::FullGraph {
                    layer1: layer1.clone(),
                    node: node.clone(),
                    discovery: discovery.clone(),
                },
            );
        }

        if let Err(e) = self.start_full_graph(&id, &layer1, &node, &discovery, &mut rng).await {
            warn!(stream_part = %id, error = %e, "failed to join stream part");
            if let Ok(mut parts) = self.stream_parts.write() {
                parts.remove(&id);
            }
            node.stop().await;
            discovery.destroy().await;
            layer1.stop().await;
            return Err(e);
        }
        info!(stream_part = %id, neighbors = layer1.neighbor_count(), "joined stream part");
        self.events.emit(NodeEvent::StreamPartJoined(id));
        Ok(())
    }

    async fn start_full_graph(
        &self,
        id: &StreamPartId,
        layer1: &Arc<dyn Layer1Node>,
        node: &Arc<DeliveryLayerNode>,
        discovery: &Arc<EntryPointDiscovery>,
        rng: &mut StdRng,
    ) -> Result<()> {
        node.start().await?;
        layer1.start().await.context("failed to start layer1 node")?;

        let known = self.known_entry_points(id);
        let discovered = discovery.discover_entry_points_from_dht(known.len()).await;
        let entry_points = if discovered.entry_points_from_dht {
            discovered.discovered_entry_points.clone()
        } else {
            known
        };
        let sample: Vec<PeerDescriptor> = entry_points
            .choose_multiple(rng, ENTRY_POINT_SAMPLE_SIZE)
            .cloned()
            .collect();
        debug!(stream_part = %id, entry_points = sample.len(), from_dht = discovered.entry_points_from_dht, "joining layer1 dht");
        // An unreachable sample leaves us alone in the DHT; self-registration
        // and split avoidance below pick the partition up from there.
        if let Err(e) = layer1.join_dht(&sample).await {
            debug!(stream_part = %id, error = %e, "no entry point answered the dht join");
        }

        if discovered.entry_points_from_dht {
            discovery
                .store_self_as_entry_point_if_necessary(discovered.discovered_entry_points.len())
                .await;
        }
        node.refresh_contacts().await;
        node.activate();
        Ok(())
    }

    /// Leave `id`, notifying neighbors and deleting our entry point record.
    pub async fn leave_stream_part(&self, id: &StreamPartId) {
        let removed = self.stream_parts.write().ok().and_then(|mut parts| parts.remove(id));
        let Some(delivery) = removed else {
            return;
        };
        Self::teardown(delivery).await;
        debug!(stream_part = %id, "left stream part");
        self.events.emit(NodeEvent::StreamPartLeft(id.clone()));
    }

    async fn teardown(delivery: StreamPartDelivery) {
        match delivery {
            StreamPartDelivery::FullGraph { layer1, node, discovery } => {
                // Leave notices read the registration flag, so stop the node first.
                node.stop().await;
                discovery.destroy().await;
                layer1.stop().await;
            }
            StreamPartDelivery::Proxy { client } => client.stop().await,
        }
    }

    /// Publish a message, joining its stream part first if necessary.
    pub async fn broadcast(&self, msg: StreamMessage) -> Result<()> {
        self.ensure_running()?;
        let id = msg.stream_part_id();
        if self.is_proxied_stream_part(&id, Some(ProxyDirection::Subscribe)) {
            return Err(NodeError::ProxiedStreamPart {
                stream_part: id,
                direction: ProxyDirection::Subscribe,
            }
            .into());
        }
        if !self.has_stream_part(&id) {
            self.join_stream_part(id.clone()).await?;
        }
        match self.delivery(&id) {
            Some(StreamPartDelivery::FullGraph { node, .. }) => node.broadcast(msg).await,
            Some(StreamPartDelivery::Proxy { client }) => client.broadcast(msg),
            None => trace!(stream_part = %id, "stream part left before broadcast"),
        }
        Ok(())
    }

    /// Relay `id` through `peers` instead of joining its overlay.
    ///
    /// An empty peer list or a connection count of zero leaves the stream part.
    pub async fn set_proxies(
        &self,
        id: StreamPartId,
        peers: Vec<PeerDescriptor>,
        direction: ProxyDirection,
        user_id: UserId,
        connection_count: Option<usize>,
    ) -> Result<()> {
        self.ensure_running()?;
        if self.config.accept_proxy_connections {
            return Err(NodeError::AcceptsProxyConnections.into());
        }
        if peers.is_empty() || connection_count == Some(0) {
            self.leave_stream_part(&id).await;
            return Ok(());
        }
        let client = match self.delivery(&id) {
            Some(StreamPartDelivery::Proxy { client }) => client,
            existing => {
                if existing.is_some() {
                    debug!(stream_part = %id, "switching full graph stream part to proxy");
                    self.leave_stream_part(&id).await;
                }
                let ctx = self.context(&id);
                let scope = self.scope.child();
                let propagation = Arc::new(Propagation::new(self.config.propagation(), scope.child()));
                let client = Arc::new(ProxyClient::new(ctx, propagation, self.events.clone(), scope));
                if let Ok(mut parts) = self.stream_parts.write() {
                    parts.insert(id.clone(), StreamPartDelivery::Proxy { client: client.clone() });
                }
                self.events.emit(NodeEvent::StreamPartJoined(id.clone()));
                client
            }
        };
        client.set_proxies(peers, direction, user_id, connection_count).await
    }

    /// Seed `id` with entry points; later joins skip DHT discovery.
    pub fn set_stream_part_entry_points(&self, id: StreamPartId, entry_points: Vec<PeerDescriptor>) {
        if let Ok(mut known) = self.known_entry_points.write() {
            known.insert(id, entry_points);
        }
    }

    fn known_entry_points(&self, id: &StreamPartId) -> Vec<PeerDescriptor> {
        self.known_entry_points
            .read()
            .ok()
            .and_then(|known| known.get(id).cloned())
            .unwrap_or_default()
    }

    async fn handle_entry_point_leave(&self, id: &StreamPartId) {
        if self.destroyed.load(Ordering::SeqCst) || !self.known_entry_points(id).is_empty() {
            return;
        }
        let Some(StreamPartDelivery::FullGraph { discovery, .. }) = self.delivery(id) else {
            return;
        };
        if discovery.is_local_node_entry_point() {
            return;
        }
        debug!(stream_part = %id, "entry point left, checking registrations");
        let result = discovery.discover_entry_points_from_dht(0).await;
        discovery
            .store_self_as_entry_point_if_necessary(result.discovered_entry_points.len())
            .await;
    }

    /// Leave every stream part and stop all background work. Idempotent.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<StreamPartDelivery> = match self.stream_parts.write() {
            Ok(mut parts) => parts.drain().map(|(_, d)| d).collect(),
            Err(_) => Vec::new(),
        };
        for delivery in drained {
            Self::teardown(delivery).await;
        }
        self.scope.abort();
        info!(node = %self.node_id().short(), "stream node destroyed");
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub fn node_id(&self) -> NodeId {
        self.transport.local_descriptor().node_id
    }

    pub fn peer_descriptor(&self) -> PeerDescriptor {
        self.transport.local_descriptor()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn stream_parts(&self) -> Vec<StreamPartId> {
        self.stream_parts
            .read()
            .map(|parts| parts.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_stream_part(&self, id: &StreamPartId) -> bool {
        self.stream_parts.read().is_ok_and(|parts| parts.contains_key(id))
    }

    /// Target neighbors of a full graph part, or proxies of a proxied one.
    pub async fn get_neighbors(&self, id: &StreamPartId) -> Vec<NodeId> {
        match self.delivery(id) {
            Some(StreamPartDelivery::FullGraph { node, .. }) => node.neighbor_ids().await,
            Some(StreamPartDelivery::Proxy { client }) => client.connection_ids(),
            None => Vec::new(),
        }
    }

    pub fn delivery_state(&self, id: &StreamPartId) -> Option<DeliveryState> {
        match self.delivery(id)? {
            StreamPartDelivery::FullGraph { node, .. } => Some(node.state()),
            StreamPartDelivery::Proxy { .. } => None,
        }
    }

    pub fn is_local_entry_point(&self, id: &StreamPartId) -> bool {
        matches!(
            self.delivery(id),
            Some(StreamPartDelivery::FullGraph { discovery, .. }) if discovery.is_local_node_entry_point()
        )
    }

    /// Whether a proxy connection to or from `node_id` exists in `direction`.
    pub fn has_proxy_connection(&self, id: &StreamPartId, node_id: &NodeId, direction: ProxyDirection) -> bool {
        match self.delivery(id) {
            Some(StreamPartDelivery::FullGraph { node, .. }) => node
                .proxy_server()
                .is_some_and(|server| server.direction_of(node_id) == Some(direction)),
            Some(StreamPartDelivery::Proxy { client }) => client.has_connection(node_id, direction),
            None => false,
        }
    }

    /// Whether `id` is proxied, optionally in a specific direction.
    pub fn is_proxied_stream_part(&self, id: &StreamPartId, direction: Option<ProxyDirection>) -> bool {
        match self.delivery(id) {
            Some(StreamPartDelivery::Proxy { client }) => match direction {
                Some(direction) => client.direction() == Some(direction),
                None => true,
            },
            _ => false,
        }
    }

    pub async fn info(&self) -> NodeInfo {
        let mut entries: Vec<(StreamPartId, StreamPartDelivery)> = self
            .stream_parts
            .read()
            .map(|parts| parts.iter().map(|(id, d)| (id.clone(), d.clone())).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));

        let mut stream_parts = Vec::with_capacity(entries.len());
        for (id, delivery) in entries {
            let info = match delivery {
                StreamPartDelivery::FullGraph { node, .. } => StreamPartInfo {
                    id,
                    neighbors: node.neighbor_ids().await,
                    layer1_neighbors: node.layer1_neighbors(),
                    proxied: None,
                },
                StreamPartDelivery::Proxy { client } => StreamPartInfo {
                    id,
                    neighbors: client.connection_ids(),
                    layer1_neighbors: Vec::new(),
                    proxied: client.direction(),
                },
            };
            stream_parts.push(info);
        }
        NodeInfo {
            peer_descriptor: self.peer_descriptor(),
            stream_parts,
        }
    }
}

// ============================================================================
// Inbound RPC routing
// ============================================================================

#[async_trait]
impl RpcHandler for StreamNode {
    async fn handle_request(&self, source: PeerDescriptor, request: RpcRequest) -> RpcResponse {
        let id = request.stream_part_id().clone();
        match self.delivery(&id) {
            Some(StreamPartDelivery::FullGraph { node, .. }) => node.handle_request(request).await,
            _ => {
                trace!(stream_part = %id, peer = %source.node_id.short(), method = request.method(), "request for unknown stream part");
                RpcResponse::Error {
                    message: format!("stream part {id} not joined"),
                }
            }
        }
    }

    async fn handle_notification(&self, source: PeerDescriptor, notification: RpcNotification) {
        let id = notification.stream_part_id();
        match (self.delivery(&id), notification) {
            (Some(StreamPartDelivery::FullGraph { node, .. }), RpcNotification::StreamMessage(msg)) => {
                node.on_stream_message(msg, source.node_id).await;
            }
            (Some(StreamPartDelivery::FullGraph { node, .. }), RpcNotification::LeaveNotice(notice)) => {
                node.on_leave_notice(notice).await;
            }
            (Some(StreamPartDelivery::Proxy { client }), RpcNotification::StreamMessage(msg)) => {
                client.on_stream_message(msg, source.node_id);
            }
            (Some(StreamPartDelivery::Proxy { client }), RpcNotification::LeaveNotice(notice)) => {
                client.on_leave_notice(&notice.sender_id);
            }
            (None, notification) => {
                trace!(stream_part = %id, peer = %source.node_id.short(), method = notification.method(), "notification for unknown stream part");
            }
        }
    }
}
