//! # Per-Peer RPC Proxies
//!
//! Thin wrappers that bind a [`PeerDescriptor`] to the [`Transport`] and one
//! stream partition. Every neighbor-facing call goes through here, and every
//! call converts transport errors and timeouts into a negative application
//! result logged at `trace`/`debug`. Nothing in this module returns an error to
//! a maintenance loop.
//!
//! | Wrapper | Verbs |
//! |---------|-------|
//! | [`RemoteNodeHandle`] | stream message delivery, leave notice |
//! | [`RemoteHandshaker`] | handshake |
//! | [`RemoteNeighborUpdateManager`] | neighbor list exchange |
//! | [`ProxyConnectionRemote`] | proxy connection request |

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, trace};

use crate::identity::{NodeId, PeerDescriptor, StreamPartId, UserId};
use crate::messages::{
    HandshakeRequest, LeaveNotice, NeighborUpdate, ProxyConnectionRequest, ProxyDirection, RpcNotification,
    RpcRequest, RpcResponse, StreamMessage,
};
use crate::protocols::Transport;

/// Default deadline for one request/response exchange.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport bound to one local identity and one stream partition.
#[derive(Clone)]
pub struct RpcContext {
    local: PeerDescriptor,
    stream_part: StreamPartId,
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl fmt::Debug for RpcContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcContext")
            .field("local", &self.local.node_id)
            .field("stream_part", &self.stream_part)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RpcContext {
    pub fn new(transport: Arc<dyn Transport>, stream_part: StreamPartId, timeout: Duration) -> Self {
        Self {
            local: transport.local_descriptor(),
            stream_part,
            transport,
            timeout,
        }
    }

    pub fn local_descriptor(&self) -> &PeerDescriptor {
        &self.local
    }

    pub fn local_id(&self) -> NodeId {
        self.local.node_id
    }

    pub fn stream_part(&self) -> &StreamPartId {
        &self.stream_part
    }

    /// Purpose under which gossip edges of this partition pin connections.
    pub fn lock_purpose(&self) -> String {
        self.stream_part.to_string()
    }

    pub fn lock_connection(&self, target: &PeerDescriptor) {
        self.transport.lock_connection(target, &self.lock_purpose());
    }

    pub fn unlock_connection(&self, target: &PeerDescriptor) {
        self.transport.unlock_connection(target, &self.lock_purpose());
    }

    pub fn remote(&self, descriptor: PeerDescriptor) -> RemoteNodeHandle {
        RemoteNodeHandle {
            descriptor,
            ctx: self.clone(),
        }
    }

    async fn request(&self, target: &PeerDescriptor, request: RpcRequest) -> Result<RpcResponse> {
        let method = request.method();
        match tokio::time::timeout(self.timeout, self.transport.request(target, request)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("{method} to {} timed out after {:?}", target.node_id.short(), self.timeout)),
        }
    }

    async fn notify(&self, target: &PeerDescriptor, notification: RpcNotification) -> Result<()> {
        let method = notification.method();
        match tokio::time::timeout(self.timeout, self.transport.notify(target, notification)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("{method} to {} timed out after {:?}", target.node_id.short(), self.timeout)),
        }
    }
}

// ============================================================================
// Delivery verbs
// ============================================================================

/// A peer plus an RPC client bound to one stream partition.
#[derive(Clone)]
pub struct RemoteNodeHandle {
    descriptor: PeerDescriptor,
    ctx: RpcContext,
}

impl fmt::Debug for RemoteNodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteNodeHandle({}, {})", self.descriptor.node_id.short(), self.ctx.stream_part)
    }
}

impl RemoteNodeHandle {
    pub fn descriptor(&self) -> &PeerDescriptor {
        &self.descriptor
    }

    pub fn id(&self) -> NodeId {
        self.descriptor.node_id
    }

    pub fn context(&self) -> &RpcContext {
        &self.ctx
    }

    pub async fn send_stream_message(&self, msg: StreamMessage) {
        if let Err(e) = self
            .ctx
            .notify(&self.descriptor, RpcNotification::StreamMessage(msg))
            .await
        {
            trace!(peer = %self.id().short(), error = %e, "stream message send failed");
        }
    }

    pub async fn leave_stream_part_notice(&self, is_entry_point: bool) {
        let notice = LeaveNotice {
            sender_id: self.ctx.local_id(),
            stream_part_id: self.ctx.stream_part.clone(),
            is_entry_point,
        };
        if let Err(e) = self
            .ctx
            .notify(&self.descriptor, RpcNotification::LeaveNotice(notice))
            .await
        {
            trace!(peer = %self.id().short(), error = %e, "leave notice failed");
        }
    }
}

// ============================================================================
// Handshake
// ============================================================================

#[derive(Clone, Debug, Default)]
pub struct HandshakeResult {
    pub accepted: bool,
    pub interleave_target: Option<PeerDescriptor>,
}

pub struct RemoteHandshaker {
    remote: RemoteNodeHandle,
}

impl RemoteHandshaker {
    pub fn new(remote: RemoteNodeHandle) -> Self {
        Self { remote }
    }

    pub async fn handshake(
        &self,
        neighbor_ids: Vec<NodeId>,
        concurrent_handshake_target_id: Option<NodeId>,
        interleave_source_id: Option<NodeId>,
    ) -> HandshakeResult {
        let ctx = &self.remote.ctx;
        let request_id = hex::encode(rand::random::<[u8; 8]>());
        let request = RpcRequest::Handshake(HandshakeRequest {
            stream_part_id: ctx.stream_part.clone(),
            request_id: request_id.clone(),
            neighbor_ids,
            concurrent_handshake_target_id,
            interleave_source_id,
            sender_descriptor: ctx.local.clone(),
        });
        match ctx.request(&self.remote.descriptor, request).await {
            Ok(RpcResponse::Handshake(resp)) if resp.request_id == request_id => HandshakeResult {
                accepted: resp.accepted,
                interleave_target: resp.interleave_target_descriptor,
            },
            Ok(other) => {
                debug!(peer = %self.remote.id().short(), response = ?other, "unexpected handshake response");
                HandshakeResult::default()
            }
            Err(e) => {
                debug!(peer = %self.remote.id().short(), error = %e, "handshake failed");
                HandshakeResult::default()
            }
        }
    }
}

// ============================================================================
// Neighbor update
// ============================================================================

#[derive(Clone, Debug)]
pub struct NeighborUpdateResult {
    pub peer_descriptors: Vec<PeerDescriptor>,
    pub remove_me: bool,
}

pub struct RemoteNeighborUpdateManager {
    remote: RemoteNodeHandle,
}

impl RemoteNeighborUpdateManager {
    pub fn new(remote: RemoteNodeHandle) -> Self {
        Self { remote }
    }

    /// Exchange neighbor lists. Any failure asks the caller to drop the peer.
    pub async fn update_neighbors(&self, neighbors: Vec<PeerDescriptor>) -> NeighborUpdateResult {
        let ctx = &self.remote.ctx;
        let request = RpcRequest::NeighborUpdate(NeighborUpdate {
            sender_id: ctx.local_id(),
            stream_part_id: ctx.stream_part.clone(),
            neighbor_descriptors: neighbors,
            remove_me: false,
        });
        match ctx.request(&self.remote.descriptor, request).await {
            Ok(RpcResponse::NeighborUpdate(resp)) => NeighborUpdateResult {
                peer_descriptors: resp.neighbor_descriptors,
                remove_me: resp.remove_me,
            },
            Ok(other) => {
                debug!(peer = %self.remote.id().short(), response = ?other, "unexpected neighbor update response");
                Self::failed()
            }
            Err(e) => {
                debug!(peer = %self.remote.id().short(), error = %e, "neighbor update failed");
                Self::failed()
            }
        }
    }

    fn failed() -> NeighborUpdateResult {
        NeighborUpdateResult {
            peer_descriptors: Vec::new(),
            remove_me: true,
        }
    }
}

// ============================================================================
// Proxy connection
// ============================================================================

pub struct ProxyConnectionRemote {
    remote: RemoteNodeHandle,
}

impl ProxyConnectionRemote {
    pub fn new(remote: RemoteNodeHandle) -> Self {
        Self { remote }
    }

    pub async fn request_connection(&self, direction: ProxyDirection, user_id: UserId) -> bool {
        let ctx = &self.remote.ctx;
        let request = RpcRequest::ProxyConnection(ProxyConnectionRequest {
            stream_part_id: ctx.stream_part.clone(),
            direction,
            user_id,
            sender_descriptor: ctx.local.clone(),
        });
        match ctx.request(&self.remote.descriptor, request).await {
            Ok(RpcResponse::ProxyConnection(resp)) => resp.accepted,
            Ok(other) => {
                debug!(peer = %self.remote.id().short(), response = ?other, "unexpected proxy connection response");
                false
            }
            Err(e) => {
                debug!(peer = %self.remote.id().short(), error = %e, "proxy connection request failed");
                false
            }
        }
    }
}
