//! # Identities and Stream Partitions
//!
//! This module defines the identifiers used throughout the overlay:
//!
//! - [`NodeId`]: fixed-length 32-byte node identifier, the unit of XOR-metric distance
//! - [`PeerDescriptor`]: immutable peer identity (id, transport addresses, node type, region)
//! - [`StreamPartId`]: `(stream_id, partition)` key; one overlay graph exists per value
//! - [`UserId`]: declared user identity carried by proxy connection requests
//!
//! ## Invariants
//!
//! - `PeerDescriptor` equality and hashing consider the node id bytes only
//! - XOR distance is symmetric, `d(a, a) == 0`
//! - `StreamPartId` round-trips through its `stream#partition` string form

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Length of a node identifier in bytes.
pub const NODE_ID_LEN: usize = 32;

/// Maximum length of a stream id.
pub const MAX_STREAM_ID_LENGTH: usize = 256;

/// Key under which a partition's entry points are stored in the DHT.
pub type DataKey = [u8; NODE_ID_LEN];

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    #[inline]
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a uniformly random identifier from the supplied source.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; NODE_ID_LEN];
        rng.fill(&mut bytes[..]);
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> [u8; NODE_ID_LEN] {
        let mut out = [0u8; NODE_ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s.trim_start_matches("0x"))?;
        if bytes.len() != NODE_ID_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; NODE_ID_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Short prefix used in log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

/// Compare two XOR distances (big-endian byte order).
///
/// Returns `Ordering::Less` when `a` denotes the smaller distance.
#[inline]
pub fn distance_cmp(a: &[u8; NODE_ID_LEN], b: &[u8; NODE_ID_LEN]) -> Ordering {
    a.cmp(b)
}

/// Sort descriptors by XOR distance to `reference`, closest first.
///
/// This is the ordering contract for the nearby contact pool: `NodeList`
/// treats the first element as "closest" and the last as "furthest".
pub fn sort_by_distance(reference: &NodeId, peers: &mut [PeerDescriptor]) {
    peers.sort_by(|a, b| {
        distance_cmp(&reference.xor_distance(&a.node_id), &reference.xor_distance(&b.node_id))
    });
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; NODE_ID_LEN]> for NodeId {
    fn from(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum NodeType {
    #[default]
    Native,
    Browser,
}

/// Immutable identity of a peer.
///
/// Two descriptors are equal when their node ids are equal; addresses, type
/// and region are informational.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub node_id: NodeId,
    pub addrs: Vec<String>,
    pub node_type: NodeType,
    pub region: Option<u32>,
}

impl PeerDescriptor {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            addrs: Vec::new(),
            node_type: NodeType::Native,
            region: None,
        }
    }

    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addrs.push(addr.into());
        self
    }

    pub fn with_region(mut self, region: u32) -> Self {
        self.region = Some(region);
        self
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.node_id
    }
}

impl PartialEq for PeerDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
    }
}

impl Eq for PeerDescriptor {}

impl Hash for PeerDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node_id.hash(state);
    }
}

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamPartId {
    stream_id: String,
    partition: u32,
}

impl StreamPartId {
    pub fn new(stream_id: impl Into<String>, partition: u32) -> Self {
        Self {
            stream_id: stream_id.into(),
            partition,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// DHT key for this partition's entry point records.
    pub fn data_key(&self) -> DataKey {
        *blake3::hash(self.to_string().as_bytes()).as_bytes()
    }
}

impl fmt::Display for StreamPartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.stream_id, self.partition)
    }
}

impl fmt::Debug for StreamPartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamPartId({self})")
    }
}

impl FromStr for StreamPartId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (stream_id, partition) = s
            .rsplit_once('#')
            .ok_or_else(|| anyhow::anyhow!("stream part id must have the form STREAM#PARTITION"))?;
        if stream_id.is_empty() || stream_id.len() > MAX_STREAM_ID_LENGTH {
            anyhow::bail!("invalid stream id length {}", stream_id.len());
        }
        let partition = partition
            .parse::<u32>()
            .map_err(|e| anyhow::anyhow!("invalid partition {partition:?}: {e}"))?;
        Ok(Self::new(stream_id, partition))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct UserId([u8; 20]);

impl UserId {
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId(0x{})", hex::encode(self.0))
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}
