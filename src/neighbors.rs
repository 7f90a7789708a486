//! # Per-Partition Neighbor State
//!
//! [`NeighborState`] groups the node lists of one stream partition together
//! with the set of ongoing handshakes. [`Neighbors`] guards it with an async
//! mutex and owns the side effects of every target-neighbor change:
//!
//! | Change | Side effects |
//! |--------|--------------|
//! | neighbor added | pin connection, `NeighborAdded` event, flush parked propagation |
//! | neighbor removed | unpin connection, `NeighborRemoved` event |
//!
//! The side effects are synchronous and run while the state lock is held,
//! so a connection is pinned exactly once per insert and released exactly
//! once per removal no matter how handshakes and removals interleave.
//! The lock is never held across an RPC.

use std::collections::HashSet;
use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::{Mutex, MutexGuard};

use crate::events::EventEmitter;
use crate::identity::{NodeId, PeerDescriptor};
use crate::node_list::NodeList;
use crate::propagation::Propagation;
use crate::remote::{RemoteNodeHandle, RpcContext};

pub struct NeighborState {
    pub target_neighbors: NodeList,
    pub nearby_contacts: NodeList,
    pub random_contacts: NodeList,
    pub ongoing_handshakes: HashSet<NodeId>,
    /// Set once the partition is torn down; no neighbor is admitted after.
    pub closed: bool,
}

impl NeighborState {
    pub fn new(own_id: NodeId, num_of_target_neighbors: usize, max_contact_count: usize, rng: &mut StdRng) -> Self {
        let mut fork = || StdRng::from_rng(&mut *rng).unwrap_or_else(|_| StdRng::from_entropy());
        Self {
            target_neighbors: NodeList::new(own_id, num_of_target_neighbors, fork()),
            nearby_contacts: NodeList::new(own_id, num_of_target_neighbors + 1, fork()),
            random_contacts: NodeList::new(own_id, max_contact_count, fork()),
            ongoing_handshakes: HashSet::new(),
            closed: false,
        }
    }

    /// Slots taken by neighbors and in-flight handshakes.
    pub fn occupied(&self) -> usize {
        self.target_neighbors.size() + self.ongoing_handshakes.len()
    }

    /// Ids across all contact pools that are neither neighbors nor excluded.
    pub fn remaining_candidates(&self, excluded: &[NodeId]) -> usize {
        let mut ids: HashSet<NodeId> = self.nearby_contacts.ids().into_iter().collect();
        ids.extend(self.random_contacts.ids());
        ids.iter()
            .filter(|id| !excluded.contains(id) && !self.target_neighbors.has(id))
            .count()
    }
}

pub struct Neighbors {
    ctx: RpcContext,
    state: Mutex<NeighborState>,
    events: EventEmitter,
    propagation: Arc<Propagation>,
}

impl Neighbors {
    pub fn new(ctx: RpcContext, state: NeighborState, events: EventEmitter, propagation: Arc<Propagation>) -> Self {
        Self {
            ctx,
            state: Mutex::new(state),
            events,
            propagation,
        }
    }

    pub fn context(&self) -> &RpcContext {
        &self.ctx
    }

    pub async fn lock(&self) -> MutexGuard<'_, NeighborState> {
        self.state.lock().await
    }

    /// Insert into the target neighbors through a held guard.
    pub fn add_locked(&self, state: &mut NeighborState, handle: RemoteNodeHandle) -> bool {
        if state.closed {
            return false;
        }
        let added = state.target_neighbors.add(handle.clone());
        if added {
            self.ctx.lock_connection(handle.descriptor());
            self.events.neighbor_added(self.ctx.stream_part().clone(), handle.id());
            self.propagation.on_neighbor_joined(&handle);
        }
        added
    }

    /// Remove from the target neighbors through a held guard.
    pub fn remove_locked(&self, state: &mut NeighborState, id: &NodeId) -> Option<RemoteNodeHandle> {
        let removed = state.target_neighbors.remove(id)?;
        self.ctx.unlock_connection(removed.descriptor());
        self.events.neighbor_removed(self.ctx.stream_part().clone(), removed.id());
        Some(removed)
    }

    pub async fn add(&self, handle: RemoteNodeHandle) -> bool {
        let mut state = self.state.lock().await;
        self.add_locked(&mut state, handle)
    }

    pub async fn remove(&self, id: &NodeId) -> Option<RemoteNodeHandle> {
        let mut state = self.state.lock().await;
        self.remove_locked(&mut state, id)
    }

    /// Drop `id` from every pool. Returns the removed target neighbor, if any.
    pub async fn forget(&self, id: &NodeId) -> Option<RemoteNodeHandle> {
        let mut state = self.state.lock().await;
        state.nearby_contacts.remove(id);
        state.random_contacts.remove(id);
        self.remove_locked(&mut state, id)
    }

    /// Remove every target neighbor, releasing each pin once, and refuse
    /// further additions.
    pub async fn clear(&self) -> Vec<RemoteNodeHandle> {
        let mut state = self.state.lock().await;
        state.closed = true;
        let ids = state.target_neighbors.ids();
        let removed = ids
            .iter()
            .filter_map(|id| self.remove_locked(&mut state, id))
            .collect();
        state.nearby_contacts.clear();
        state.random_contacts.clear();
        state.ongoing_handshakes.clear();
        removed
    }

    pub async fn target_handles(&self) -> Vec<RemoteNodeHandle> {
        self.state.lock().await.target_neighbors.all()
    }

    pub async fn target_ids(&self) -> Vec<NodeId> {
        self.state.lock().await.target_neighbors.ids()
    }

    pub async fn target_count(&self) -> usize {
        self.state.lock().await.target_neighbors.size()
    }

    pub async fn has_target(&self, id: &NodeId) -> bool {
        self.state.lock().await.target_neighbors.has(id)
    }

    /// Replace the contact pools with fresh views from Layer1.
    pub async fn refresh_contacts(&self, nearby: Vec<PeerDescriptor>, random: Vec<PeerDescriptor>) {
        let mut state = self.state.lock().await;
        state
            .nearby_contacts
            .replace_all(nearby.into_iter().map(|d| self.ctx.remote(d)));
        state
            .random_contacts
            .replace_all(random.into_iter().map(|d| self.ctx.remote(d)));
    }

    /// Merge descriptors into the nearby pool. Existing entries are kept.
    pub async fn merge_nearby(&self, descriptors: Vec<PeerDescriptor>) {
        let mut state = self.state.lock().await;
        for descriptor in descriptors {
            state.nearby_contacts.add(self.ctx.remote(descriptor));
        }
    }
}
