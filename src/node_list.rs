//! # Candidate Peer Lists
//!
//! [`NodeList`] is the bounded, deduplicated collection of remote handles that
//! underlies every neighbor-related view of a stream partition (target
//! neighbors, nearby contacts, random contacts, proxy connections).
//!
//! ## Ordering Contract
//!
//! The list keeps insertion order and never computes distance itself.
//! "Closest" is the first element of the exclusion-filtered sequence and
//! "furthest" the last. Callers that feed it from the Layer1 view insert
//! contacts sorted by XOR distance to the local id, closest first
//! (see [`sort_by_distance`](crate::identity::sort_by_distance)).
//!
//! ## Invariants
//!
//! - `size() <= limit`
//! - the owner's own id is never present
//! - selection on an empty (or fully excluded) list returns `None`

use rand::Rng;
use rand::rngs::StdRng;

use crate::identity::{NodeId, PeerDescriptor};
use crate::remote::RemoteNodeHandle;

#[derive(Debug)]
pub struct NodeList {
    own_id: NodeId,
    limit: usize,
    nodes: Vec<RemoteNodeHandle>,
    rng: StdRng,
}

impl NodeList {
    pub fn new(own_id: NodeId, limit: usize, rng: StdRng) -> Self {
        Self {
            own_id,
            limit,
            nodes: Vec::with_capacity(limit),
            rng,
        }
    }

    /// Insert a handle. Returns `true` only for a new entry.
    ///
    /// An id already present has its handle replaced in place; the own id and
    /// inserts into a full list are ignored.
    pub fn add(&mut self, handle: RemoteNodeHandle) -> bool {
        let id = handle.id();
        if id == self.own_id {
            return false;
        }
        if let Some(existing) = self.nodes.iter_mut().find(|n| n.id() == id) {
            *existing = handle;
            return false;
        }
        if self.nodes.len() >= self.limit {
            return false;
        }
        self.nodes.push(handle);
        true
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<RemoteNodeHandle> {
        let pos = self.nodes.iter().position(|n| n.id() == *id)?;
        Some(self.nodes.remove(pos))
    }

    pub fn has(&self, id: &NodeId) -> bool {
        self.nodes.iter().any(|n| n.id() == *id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&RemoteNodeHandle> {
        self.nodes.iter().find(|n| n.id() == *id)
    }

    pub fn get_closest(&self, exclude: &[NodeId]) -> Option<RemoteNodeHandle> {
        self.filtered(exclude).next().cloned()
    }

    pub fn get_furthest(&self, exclude: &[NodeId]) -> Option<RemoteNodeHandle> {
        self.filtered(exclude).last().cloned()
    }

    pub fn get_random(&mut self, exclude: &[NodeId]) -> Option<RemoteNodeHandle> {
        let candidates: Vec<&RemoteNodeHandle> = self
            .nodes
            .iter()
            .filter(|n| !exclude.contains(&n.id()))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let pick = self.rng.gen_range(0..candidates.len());
        Some(candidates[pick].clone())
    }

    /// `[]`, `[only]`, or `[closest, furthest]` of the filtered sequence.
    pub fn get_closest_and_furthest(&self, exclude: &[NodeId]) -> Vec<RemoteNodeHandle> {
        let filtered: Vec<&RemoteNodeHandle> = self.filtered(exclude).collect();
        match filtered.as_slice() {
            [] => Vec::new(),
            [only] => vec![(*only).clone()],
            [first, .., last] => vec![(*first).clone(), (*last).clone()],
        }
    }

    /// Clear, then insert up to `limit` handles in iteration order.
    pub fn replace_all(&mut self, handles: impl IntoIterator<Item = RemoteNodeHandle>) {
        self.nodes.clear();
        for handle in handles {
            if self.nodes.len() >= self.limit {
                break;
            }
            self.add(handle);
        }
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn size_excluding(&self, exclude: &[NodeId]) -> usize {
        self.filtered(exclude).count()
    }

    pub fn is_full(&self) -> bool {
        self.nodes.len() >= self.limit
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id()).collect()
    }

    pub fn descriptors(&self) -> Vec<PeerDescriptor> {
        self.nodes.iter().map(|n| n.descriptor().clone()).collect()
    }

    pub fn all(&self) -> Vec<RemoteNodeHandle> {
        self.nodes.clone()
    }

    pub fn clear(&mut self) -> Vec<RemoteNodeHandle> {
        std::mem::take(&mut self.nodes)
    }

    fn filtered<'a>(&'a self, exclude: &'a [NodeId]) -> impl DoubleEndedIterator<Item = &'a RemoteNodeHandle> + 'a {
        self.nodes.iter().filter(move |n| !exclude.contains(&n.id()))
    }
}
