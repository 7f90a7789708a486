//! # Proxy Relay
//!
//! Directional relay for constrained peers that do not join the overlay.
//!
//! | Side | Role |
//! |------|------|
//! | [`ProxyServer`] | full node; tracks accepted connections as direction-restricted pseudo-neighbors |
//! | [`ProxyClient`] | constrained node; publishes through, or subscribes via, a set of proxies |
//!
//! Directions are named from the client's point of view. A publish-direction
//! connection carries messages client → server, where they are gossiped
//! onward. A subscribe-direction connection carries gossip server → client
//! and the server never accepts messages from it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::task::JoinSet;
use tracing::{debug, info, trace};

use crate::events::EventEmitter;
use crate::identity::{NodeId, PeerDescriptor, UserId};
use crate::messages::{ProxyConnectionRequest, ProxyConnectionResponse, ProxyDirection, StreamMessage};
use crate::propagation::Propagation;
use crate::remote::{ProxyConnectionRemote, RemoteNodeHandle, RpcContext};
use crate::scope::AbortScope;

#[derive(Clone, Debug)]
pub struct ProxyConnection {
    pub direction: ProxyDirection,
    pub user_id: UserId,
    pub remote: RemoteNodeHandle,
}

// ============================================================================
// Server side
// ============================================================================

pub struct ProxyServer {
    ctx: RpcContext,
    connections: Mutex<HashMap<NodeId, ProxyConnection>>,
}

impl ProxyServer {
    pub fn new(ctx: RpcContext) -> Self {
        Self {
            ctx,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn on_connection_request(&self, request: ProxyConnectionRequest) -> ProxyConnectionResponse {
        let Ok(mut connections) = self.connections.lock() else {
            return ProxyConnectionResponse { accepted: false };
        };
        let sender = request.sender_descriptor.node_id;
        if sender == self.ctx.local_id() {
            return ProxyConnectionResponse { accepted: false };
        }
        let remote = self.ctx.remote(request.sender_descriptor);
        let descriptor = remote.descriptor().clone();
        let connection = ProxyConnection {
            direction: request.direction,
            user_id: request.user_id,
            remote,
        };
        if connections.insert(sender, connection).is_none() {
            self.ctx.lock_connection(&descriptor);
        }
        info!(
            stream_part = %self.ctx.stream_part(),
            peer = %sender.short(),
            direction = %request.direction,
            user = %request.user_id,
            "accepted proxy connection"
        );
        ProxyConnectionResponse { accepted: true }
    }

    pub fn remove_connection(&self, id: &NodeId) -> Option<ProxyConnection> {
        let removed = self.connections.lock().ok()?.remove(id)?;
        self.ctx.unlock_connection(removed.remote.descriptor());
        debug!(
            stream_part = %self.ctx.stream_part(),
            peer = %id.short(),
            user = %removed.user_id,
            "proxy connection closed"
        );
        Some(removed)
    }

    pub fn direction_of(&self, id: &NodeId) -> Option<ProxyDirection> {
        self.connections.lock().ok()?.get(id).map(|c| c.direction)
    }

    /// Connections that receive gossip from us.
    pub fn subscribers(&self) -> Vec<RemoteNodeHandle> {
        self.connections
            .lock()
            .map(|connections| {
                connections
                    .values()
                    .filter(|c| c.direction == ProxyDirection::Subscribe)
                    .map(|c| c.remote.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Drop every connection, telling each client we are gone.
    pub async fn stop(&self) {
        let drained: Vec<ProxyConnection> = match self.connections.lock() {
            Ok(mut connections) => connections.drain().map(|(_, c)| c).collect(),
            Err(_) => return,
        };
        let mut notices = JoinSet::new();
        for connection in drained {
            self.ctx.unlock_connection(connection.remote.descriptor());
            notices.spawn(async move { connection.remote.leave_stream_part_notice(false).await });
        }
        while notices.join_next().await.is_some() {}
    }
}

// ============================================================================
// Client side
// ============================================================================

pub struct ProxyClient {
    ctx: RpcContext,
    propagation: Arc<Propagation>,
    events: EventEmitter,
    scope: AbortScope,
    direction: Mutex<Option<ProxyDirection>>,
    connections: Mutex<HashMap<NodeId, RemoteNodeHandle>>,
}

impl ProxyClient {
    pub fn new(ctx: RpcContext, propagation: Arc<Propagation>, events: EventEmitter, scope: AbortScope) -> Self {
        Self {
            ctx,
            propagation,
            events,
            scope,
            direction: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Connect to up to `connection_count` of `peers` (all of them by default)
    /// and disconnect proxies that are no longer wanted.
    pub async fn set_proxies(
        &self,
        peers: Vec<PeerDescriptor>,
        direction: ProxyDirection,
        user_id: UserId,
        connection_count: Option<usize>,
    ) -> Result<()> {
        let own_id = self.ctx.local_id();
        let peers: Vec<PeerDescriptor> = peers.into_iter().filter(|p| p.node_id != own_id).collect();
        let wanted = connection_count.unwrap_or(peers.len()).min(peers.len());

        let previous = match self.direction.lock() {
            Ok(mut current) => current.replace(direction),
            Err(_) => anyhow::bail!("proxy client state poisoned"),
        };
        let mut to_drop: Vec<RemoteNodeHandle> = Vec::new();
        {
            let Ok(mut connections) = self.connections.lock() else {
                anyhow::bail!("proxy client state poisoned");
            };
            let keep: Vec<NodeId> = if previous == Some(direction) {
                peers
                    .iter()
                    .map(|p| p.node_id)
                    .filter(|id| connections.contains_key(id))
                    .take(wanted)
                    .collect()
            } else {
                Vec::new()
            };
            let dropped: Vec<NodeId> = connections.keys().filter(|id| !keep.contains(id)).copied().collect();
            for id in dropped {
                if let Some(remote) = connections.remove(&id) {
                    self.ctx.unlock_connection(remote.descriptor());
                    to_drop.push(remote);
                }
            }
        }
        for remote in to_drop {
            debug!(peer = %remote.id().short(), "closing proxy connection");
            remote.leave_stream_part_notice(false).await;
        }

        for peer in peers {
            if self.connection_count() >= wanted {
                break;
            }
            if self.has_connection_to(&peer.node_id) {
                continue;
            }
            let remote = self.ctx.remote(peer);
            let accepted = ProxyConnectionRemote::new(remote.clone())
                .request_connection(direction, user_id)
                .await;
            if accepted {
                if let Ok(mut connections) = self.connections.lock()
                    && connections.insert(remote.id(), remote.clone()).is_none()
                {
                    self.ctx.lock_connection(remote.descriptor());
                }
                info!(stream_part = %self.ctx.stream_part(), peer = %remote.id().short(), %direction, "proxy connected");
            } else {
                debug!(peer = %remote.id().short(), "proxy connection rejected");
            }
        }
        Ok(())
    }

    pub fn direction(&self) -> Option<ProxyDirection> {
        self.direction.lock().ok().and_then(|d| *d)
    }

    pub fn has_connection(&self, node_id: &NodeId, direction: ProxyDirection) -> bool {
        self.direction() == Some(direction) && self.has_connection_to(node_id)
    }

    fn has_connection_to(&self, node_id: &NodeId) -> bool {
        self.connections
            .lock()
            .map(|c| c.contains_key(node_id))
            .unwrap_or(false)
    }

    pub fn connection_ids(&self) -> Vec<NodeId> {
        self.connections
            .lock()
            .map(|c| c.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Publish through every connected proxy.
    pub fn broadcast(&self, msg: StreamMessage) {
        if !self.propagation.mark_and_check_new(&msg.message_id) {
            return;
        }
        let targets = self.targets();
        self.propagation.feed_unseen_message(&msg, targets, None);
    }

    pub fn on_stream_message(&self, msg: StreamMessage, source: NodeId) {
        if self.direction() != Some(ProxyDirection::Subscribe) || !self.has_connection_to(&source) {
            trace!(peer = %source.short(), "ignoring message from non-proxy");
            return;
        }
        if self.propagation.mark_and_check_new(&msg.message_id) {
            self.events.new_message(msg);
        }
    }

    pub fn on_leave_notice(&self, sender: &NodeId) {
        let removed = self.connections.lock().ok().and_then(|mut c| c.remove(sender));
        if let Some(remote) = removed {
            self.ctx.unlock_connection(remote.descriptor());
            debug!(peer = %sender.short(), "proxy left");
        }
    }

    pub async fn stop(&self) {
        self.scope.abort();
        let drained: Vec<RemoteNodeHandle> = match self.connections.lock() {
            Ok(mut connections) => connections.drain().map(|(_, c)| c).collect(),
            Err(_) => return,
        };
        let mut notices = JoinSet::new();
        for remote in drained {
            self.ctx.unlock_connection(remote.descriptor());
            notices.spawn(async move { remote.leave_stream_part_notice(false).await });
        }
        while notices.join_next().await.is_some() {}
    }

    fn targets(&self) -> Vec<RemoteNodeHandle> {
        if self.direction() != Some(ProxyDirection::Publish) {
            return Vec::new();
        }
        self.connections
            .lock()
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }
}
