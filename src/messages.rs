//! # Wire Protocol Messages
//!
//! This module defines all serializable message types exchanged between
//! overlay nodes. Exact framing is the transport's concern; envelopes that
//! cross a byte boundary are encoded with bincode under a size limit.
//!
//! ## Protocol Types
//!
//! | Verb | Request | Response |
//! |------|---------|----------|
//! | Handshake | `HandshakeRequest` | `HandshakeResponse` |
//! | Neighbor update | `NeighborUpdate` | `NeighborUpdate` |
//! | Proxy connection | `ProxyConnectionRequest` | `ProxyConnectionResponse` |
//! | Delivery | `StreamMessage` | (notification) |
//! | Leave | `LeaveNotice` | (notification) |
//!
//! ## Message Identity
//!
//! A [`StreamMessage`] is identified by its [`MessageId`]
//! `(stream_id, partition, timestamp, sequence_number, publisher_id, msg_chain_id)`.
//! Propagation deduplicates on exactly that tuple.

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::identity::{NodeId, PeerDescriptor, StreamPartId, UserId};

/// Maximum size of a stream message payload (1 MiB).
pub const MAX_CONTENT_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization.
/// Leaves room for envelope framing around a maximal payload.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_CONTENT_SIZE as u64) + 64 * 1024;

/// Returns bincode options with size limits enforced.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Serialize with the same options the bounded decoder expects.
pub fn serialize_bounded<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

pub fn serialize_envelope(envelope: &RpcEnvelope) -> Result<Vec<u8>, bincode::Error> {
    serialize_bounded(envelope)
}

pub fn deserialize_envelope(data: &[u8]) -> Result<RpcEnvelope, bincode::Error> {
    deserialize_bounded(data)
}

// ============================================================================
// Stream messages
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId {
    pub stream_id: String,
    pub stream_partition: u32,
    pub timestamp: u64,
    pub sequence_number: u32,
    pub publisher_id: UserId,
    pub msg_chain_id: String,
}

impl MessageId {
    pub fn stream_part_id(&self) -> StreamPartId {
        StreamPartId::new(self.stream_id.clone(), self.stream_partition)
    }
}

/// Causal reference to the previous message in the same chain.
/// Carried opaquely by the overlay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub timestamp: u64,
    pub sequence_number: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessage {
    pub message_id: MessageId,
    pub prev_msg_ref: Option<MessageRef>,
    pub content: Vec<u8>,
}

impl StreamMessage {
    pub fn stream_part_id(&self) -> StreamPartId {
        self.message_id.stream_part_id()
    }
}

// ============================================================================
// Handshake
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub stream_part_id: StreamPartId,
    pub request_id: String,
    /// Current target neighbors of the requester.
    pub neighbor_ids: Vec<NodeId>,
    /// The other target of a parallel handshake round, if any.
    pub concurrent_handshake_target_id: Option<NodeId>,
    /// Set when this handshake follows an interleave offer made by that node.
    pub interleave_source_id: Option<NodeId>,
    pub sender_descriptor: PeerDescriptor,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub request_id: String,
    pub accepted: bool,
    pub interleave_target_descriptor: Option<PeerDescriptor>,
}

// ============================================================================
// Neighbor update
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NeighborUpdate {
    pub sender_id: NodeId,
    pub stream_part_id: StreamPartId,
    pub neighbor_descriptors: Vec<PeerDescriptor>,
    pub remove_me: bool,
}

// ============================================================================
// Leave
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaveNotice {
    pub sender_id: NodeId,
    pub stream_part_id: StreamPartId,
    /// Whether the leaving node had registered itself as an entry point.
    pub is_entry_point: bool,
}

// ============================================================================
// Proxy connections
// ============================================================================

/// Direction of a proxy connection, from the client's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProxyDirection {
    Publish,
    Subscribe,
}

impl std::fmt::Display for ProxyDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyDirection::Publish => write!(f, "publish"),
            ProxyDirection::Subscribe => write!(f, "subscribe"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyConnectionRequest {
    pub stream_part_id: StreamPartId,
    pub direction: ProxyDirection,
    pub user_id: UserId,
    pub sender_descriptor: PeerDescriptor,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyConnectionResponse {
    pub accepted: bool,
}

// ============================================================================
// Envelopes
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcRequest {
    Handshake(HandshakeRequest),
    NeighborUpdate(NeighborUpdate),
    ProxyConnection(ProxyConnectionRequest),
}

impl RpcRequest {
    pub fn method(&self) -> &'static str {
        match self {
            RpcRequest::Handshake(_) => "handshake",
            RpcRequest::NeighborUpdate(_) => "neighborUpdate",
            RpcRequest::ProxyConnection(_) => "requestConnection",
        }
    }

    pub fn stream_part_id(&self) -> &StreamPartId {
        match self {
            RpcRequest::Handshake(req) => &req.stream_part_id,
            RpcRequest::NeighborUpdate(req) => &req.stream_part_id,
            RpcRequest::ProxyConnection(req) => &req.stream_part_id,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcResponse {
    Handshake(HandshakeResponse),
    NeighborUpdate(NeighborUpdate),
    ProxyConnection(ProxyConnectionResponse),
    Error { message: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcNotification {
    StreamMessage(StreamMessage),
    LeaveNotice(LeaveNotice),
}

impl RpcNotification {
    pub fn method(&self) -> &'static str {
        match self {
            RpcNotification::StreamMessage(_) => "sendStreamMessage",
            RpcNotification::LeaveNotice(_) => "leaveStreamPartNotice",
        }
    }

    pub fn stream_part_id(&self) -> StreamPartId {
        match self {
            RpcNotification::StreamMessage(msg) => msg.stream_part_id(),
            RpcNotification::LeaveNotice(notice) => notice.stream_part_id.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcPayload {
    Request(RpcRequest),
    Response(RpcResponse),
    Notification(RpcNotification),
}

/// Addressed unit carried by the transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcEnvelope {
    pub source: PeerDescriptor,
    pub target: NodeId,
    pub payload: RpcPayload,
}
