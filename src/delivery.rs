//! # Delivery Layer Node
//!
//! Per-partition orchestrator composing the neighbor state, handshaker,
//! neighbor finder, neighbor update manager, propagation and (optionally) a
//! proxy server. One instance is the unit of "having joined a partition".
//!
//! ## State Machine
//!
//! ```text
//! Uninitialized --start()--> Joining --activate()--> Active
//!        \                      |                      |
//!         +----------------- stop() -> Leaving -> Stopped
//! ```
//!
//! Every loop and timer belongs to one [`AbortScope`]; `stop()` aborts it
//! before sending leave notices, so nothing fires after a node has left.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tracing::{debug, info, trace};

use crate::events::EventEmitter;
use crate::handshaker::{DEFAULT_NUM_OF_TARGET_NEIGHBORS, Handshaker};
use crate::identity::{NodeId, PeerDescriptor, sort_by_distance};
use crate::messages::{LeaveNotice, ProxyConnectionResponse, ProxyDirection, RpcRequest, RpcResponse, StreamMessage};
use crate::neighbor_finder::{self, NeighborFinder, NeighborFinderConfig};
use crate::neighbor_update::{DEFAULT_NEIGHBOR_UPDATE_INTERVAL, NeighborUpdateManager};
use crate::neighbors::{NeighborState, Neighbors};
use crate::node::NodeError;
use crate::propagation::{self, Propagation, PropagationConfig};
use crate::protocols::{ContactEvent, Layer1Node};
use crate::proxy::ProxyServer;
use crate::remote::{self, RemoteNodeHandle, RpcContext};
use crate::entry_point::{self, EntryPointConfig};
use crate::scope::AbortScope;

// ============================================================================
// Configuration
// ============================================================================

pub const DEFAULT_MAX_CONTACT_COUNT: usize = 20;

#[derive(Clone, Debug)]
pub struct DeliveryConfig {
    pub num_of_target_neighbors: usize,
    pub max_contact_count: usize,
    pub min_propagation_targets: usize,
    pub neighbor_update_interval: Duration,
    pub neighbor_finder_initial_wait: Duration,
    pub neighbor_finder_interval: Duration,
    pub rpc_timeout: Duration,
    pub entry_point_store_interval: Duration,
    pub entry_point_ttl: Duration,
    pub split_avoidance_base_delay: Duration,
    pub split_avoidance_max_attempts: u32,
    pub seen_cache_size: usize,
    pub seen_cache_ttl: Duration,
    pub propagation_buffer_ttl: Duration,
    pub accept_proxy_connections: bool,
    /// Seed for every random choice the node makes; entropy when `None`.
    pub rng_seed: Option<u64>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            num_of_target_neighbors: DEFAULT_NUM_OF_TARGET_NEIGHBORS,
            max_contact_count: DEFAULT_MAX_CONTACT_COUNT,
            min_propagation_targets: propagation::DEFAULT_MIN_PROPAGATION_TARGETS,
            neighbor_update_interval: DEFAULT_NEIGHBOR_UPDATE_INTERVAL,
            neighbor_finder_initial_wait: neighbor_finder::DEFAULT_INITIAL_WAIT,
            neighbor_finder_interval: neighbor_finder::DEFAULT_INTERVAL,
            rpc_timeout: remote::DEFAULT_RPC_TIMEOUT,
            entry_point_store_interval: entry_point::DEFAULT_STORE_INTERVAL,
            entry_point_ttl: entry_point::DEFAULT_ENTRY_POINT_TTL,
            split_avoidance_base_delay: entry_point::DEFAULT_SPLIT_AVOIDANCE_BASE_DELAY,
            split_avoidance_max_attempts: entry_point::DEFAULT_SPLIT_AVOIDANCE_MAX_ATTEMPTS,
            seen_cache_size: propagation::DEFAULT_SEEN_CACHE_SIZE,
            seen_cache_ttl: propagation::DEFAULT_SEEN_CACHE_TTL,
            propagation_buffer_ttl: propagation::DEFAULT_PROPAGATION_BUFFER_TTL,
            accept_proxy_connections: false,
            rng_seed: None,
        }
    }
}

impl DeliveryConfig {
    pub fn propagation(&self) -> PropagationConfig {
        PropagationConfig {
            min_propagation_targets: self.min_propagation_targets,
            seen_cache_size: self.seen_cache_size,
            seen_cache_ttl: self.seen_cache_ttl,
            buffer_ttl: self.propagation_buffer_ttl,
            ..PropagationConfig::default()
        }
    }

    pub fn entry_point(&self) -> EntryPointConfig {
        EntryPointConfig {
            store_interval: self.entry_point_store_interval,
            ttl: self.entry_point_ttl,
            split_avoidance_base_delay: self.split_avoidance_base_delay,
            split_avoidance_max_attempts: self.split_avoidance_max_attempts,
        }
    }

    fn neighbor_finder(&self) -> NeighborFinderConfig {
        NeighborFinderConfig {
            min_count: self.num_of_target_neighbors,
            initial_wait: self.neighbor_finder_initial_wait,
            interval: self.neighbor_finder_interval,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryState {
    Uninitialized,
    Joining,
    Active,
    Leaving,
    Stopped,
}

// ============================================================================
// Delivery layer node
// ============================================================================

pub struct DeliveryLayerNode {
    ctx: RpcContext,
    config: DeliveryConfig,
    layer1: Arc<dyn Layer1Node>,
    neighbors: Arc<Neighbors>,
    handshaker: Arc<Handshaker>,
    finder: Arc<NeighborFinder>,
    updates: Arc<NeighborUpdateManager>,
    propagation: Arc<Propagation>,
    proxy_server: Option<ProxyServer>,
    events: EventEmitter,
    scope: AbortScope,
    state: Mutex<DeliveryState>,
    local_entry_point: Arc<AtomicBool>,
}

impl DeliveryLayerNode {
    /// `local_entry_point` reads `true` while the local node is registered as
    /// an entry point of this partition; it is carried in leave notices.
    pub fn new(
        ctx: RpcContext,
        config: DeliveryConfig,
        layer1: Arc<dyn Layer1Node>,
        events: EventEmitter,
        rng: &mut StdRng,
        scope: AbortScope,
        local_entry_point: Arc<AtomicBool>,
    ) -> Self {
        let propagation = Arc::new(Propagation::new(config.propagation(), scope.clone()));
        let state = NeighborState::new(ctx.local_id(), config.num_of_target_neighbors, config.max_contact_count, rng);
        let neighbors = Arc::new(Neighbors::new(ctx.clone(), state, events.clone(), propagation.clone()));
        let handshaker = Arc::new(Handshaker::new(neighbors.clone(), config.num_of_target_neighbors));
        let finder = Arc::new(NeighborFinder::new(
            handshaker.clone(),
            neighbors.clone(),
            config.neighbor_finder(),
            scope.child(),
        ));
        let updates = Arc::new(NeighborUpdateManager::new(
            neighbors.clone(),
            finder.clone(),
            config.neighbor_update_interval,
            config.num_of_target_neighbors,
            scope.child(),
        ));
        let proxy_server = config
            .accept_proxy_connections
            .then(|| ProxyServer::new(ctx.clone()));
        Self {
            ctx,
            config,
            layer1,
            neighbors,
            handshaker,
            finder,
            updates,
            propagation,
            proxy_server,
            events,
            scope,
            state: Mutex::new(DeliveryState::Uninitialized),
            local_entry_point,
        }
    }

    pub fn state(&self) -> DeliveryState {
        self.state.lock().map(|s| *s).unwrap_or(DeliveryState::Stopped)
    }

    fn transition(&self, from: &[DeliveryState], to: DeliveryState) -> bool {
        match self.state.lock() {
            Ok(mut state) if from.contains(&state) => {
                trace!(stream_part = %self.ctx.stream_part(), from = ?*state, ?to, "state transition");
                *state = to;
                true
            }
            _ => false,
        }
    }

    /// Start the maintenance loops and begin listening to Layer1 contact events.
    pub async fn start(self: &Arc<Self>) -> Result<(), NodeError> {
        if !self.transition(&[DeliveryState::Uninitialized], DeliveryState::Joining) {
            return Err(NodeError::AlreadyStarted);
        }
        let mut contacts = self.layer1.subscribe();
        let this = Arc::clone(self);
        self.scope.spawn(async move {
            loop {
                match contacts.recv().await {
                    Ok(event) => this.on_contact_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        trace!(skipped, "contact events lagged");
                        this.refresh_contacts().await;
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        });
        self.refresh_contacts().await;
        self.updates.start();
        self.finder.start(Vec::new());
        Ok(())
    }

    /// Mark the partition joined once Layer1 has joined the DHT.
    pub fn activate(&self) -> bool {
        let activated = self.transition(&[DeliveryState::Joining], DeliveryState::Active);
        if activated {
            info!(stream_part = %self.ctx.stream_part(), "stream part active");
        }
        activated
    }

    /// Stop every loop, release every pin and tell neighbors we are leaving.
    pub async fn stop(&self) {
        let from = [
            DeliveryState::Uninitialized,
            DeliveryState::Joining,
            DeliveryState::Active,
        ];
        if !self.transition(&from, DeliveryState::Leaving) {
            return;
        }
        self.finder.stop();
        self.updates.stop();
        self.scope.abort();

        let is_entry_point = self.local_entry_point.load(Ordering::SeqCst);
        let departed = self.neighbors.clear().await;
        let mut notices = JoinSet::new();
        for remote in departed {
            notices.spawn(async move { remote.leave_stream_part_notice(is_entry_point).await });
        }
        while notices.join_next().await.is_some() {}
        if let Some(server) = &self.proxy_server {
            server.stop().await;
        }
        self.transition(&[DeliveryState::Leaving], DeliveryState::Stopped);
        debug!(stream_part = %self.ctx.stream_part(), "stream part stopped");
    }

    fn is_running(&self) -> bool {
        matches!(self.state(), DeliveryState::Joining | DeliveryState::Active)
    }

    // ========================================================================
    // Messaging
    // ========================================================================

    pub async fn broadcast(&self, msg: StreamMessage) {
        if !self.is_running() || !self.propagation.mark_and_check_new(&msg.message_id) {
            return;
        }
        let targets = self.propagation_targets().await;
        self.propagation.feed_unseen_message(&msg, targets, None);
    }

    pub async fn on_stream_message(&self, msg: StreamMessage, source: NodeId) {
        if !self.is_running() {
            return;
        }
        if let Some(server) = &self.proxy_server
            && server.direction_of(&source) == Some(ProxyDirection::Subscribe)
        {
            trace!(peer = %source.short(), "dropping message from subscribe-only proxy client");
            return;
        }
        if !self.propagation.mark_and_check_new(&msg.message_id) {
            return;
        }
        self.events.new_message(msg.clone());
        let targets = self.propagation_targets().await;
        self.propagation.feed_unseen_message(&msg, targets, Some(source));
    }

    async fn propagation_targets(&self) -> Vec<RemoteNodeHandle> {
        let mut targets = self.neighbors.target_handles().await;
        if let Some(server) = &self.proxy_server {
            targets.extend(server.subscribers());
        }
        targets
    }

    // ========================================================================
    // Inbound RPC
    // ========================================================================

    pub async fn handle_request(&self, request: RpcRequest) -> RpcResponse {
        if !self.is_running() {
            return RpcResponse::Error {
                message: format!("stream part {} is not running", self.ctx.stream_part()),
            };
        }
        match request {
            RpcRequest::Handshake(req) => RpcResponse::Handshake(self.handshaker.on_handshake_request(req).await),
            RpcRequest::NeighborUpdate(req) => RpcResponse::NeighborUpdate(self.updates.on_neighbor_update(req).await),
            RpcRequest::ProxyConnection(req) => match &self.proxy_server {
                Some(server) => RpcResponse::ProxyConnection(server.on_connection_request(req)),
                None => RpcResponse::ProxyConnection(ProxyConnectionResponse { accepted: false }),
            },
        }
    }

    pub async fn on_leave_notice(&self, notice: LeaveNotice) {
        if !self.is_running() {
            return;
        }
        let sender = notice.sender_id;
        if let Some(server) = &self.proxy_server
            && server.remove_connection(&sender).is_some()
        {
            debug!(peer = %sender.short(), "proxy client left");
            return;
        }
        let removed = self.neighbors.forget(&sender).await;
        if removed.is_some() {
            debug!(stream_part = %self.ctx.stream_part(), peer = %sender.short(), "neighbor left");
        }
        if notice.is_entry_point {
            self.events.entry_point_leave_detected(self.ctx.stream_part().clone());
        }
        self.finder.start(vec![sender]);
    }

    // ========================================================================
    // Layer1 contacts
    // ========================================================================

    async fn on_contact_event(&self, event: ContactEvent) {
        self.refresh_contacts().await;
        if let ContactEvent::NewContact(peer) = event {
            trace!(peer = %peer.node_id.short(), "new layer1 contact");
            if self.neighbors.target_count().await < self.config.num_of_target_neighbors {
                self.finder.start(Vec::new());
            }
        }
    }

    /// Refill the contact pools from the Layer1 view.
    pub async fn refresh_contacts(&self) {
        let mut nearby = self.layer1.neighbors();
        sort_by_distance(&self.ctx.local_id(), &mut nearby);
        let random = self.layer1.random_contacts(self.config.max_contact_count);
        self.neighbors.refresh_contacts(nearby, random).await;
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub async fn neighbor_ids(&self) -> Vec<NodeId> {
        self.neighbors.target_ids().await
    }

    pub async fn neighbor_descriptors(&self) -> Vec<PeerDescriptor> {
        self.neighbors
            .target_handles()
            .await
            .iter()
            .map(|h| h.descriptor().clone())
            .collect()
    }

    pub fn layer1_neighbors(&self) -> Vec<PeerDescriptor> {
        self.layer1.neighbors()
    }

    pub fn proxy_server(&self) -> Option<&ProxyServer> {
        self.proxy_server.as_ref()
    }
}
