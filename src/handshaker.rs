//! # Handshaker
//!
//! Bidirectional neighbor-acceptance protocol for one stream partition.
//!
//! ## Client side
//!
//! [`Handshaker::attempt_handshakes_on_contacts`] fills free slots, where
//! `headroom = N - (target_neighbors + ongoing_handshakes)`:
//!
//! | Headroom | Action |
//! |----------|--------|
//! | `> 2` | two parallel handshakes (nearby closest + furthest, random fallback) |
//! | `1..=2` | one handshake (nearby closest, else random) |
//! | `<= 0` | nothing |
//!
//! Targets are reserved in `ongoing_handshakes` while the state lock is held,
//! so a round never starts more handshakes than there is headroom. Rejected
//! or unreachable targets are appended to the returned exclusion list.
//!
//! ## Server side
//!
//! [`Handshaker::on_handshake_request`] accepts, in order:
//!
//! 1. a requester that is already a neighbor or mid-handshake with us
//! 2. an interleave handshake whose source is our neighbor (source edge is swapped out)
//! 3. any requester while there is headroom
//! 4. when full, the requester in place of our furthest neighbor outside the
//!    requester's own neighborhood, which is returned as the interleave target
//!
//! and rejects otherwise.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::identity::{NodeId, PeerDescriptor};
use crate::messages::{HandshakeRequest, HandshakeResponse};
use crate::neighbors::{NeighborState, Neighbors};
use crate::remote::{RemoteHandshaker, RemoteNodeHandle, RpcContext};

pub const PARALLEL_HANDSHAKE_COUNT: usize = 2;

pub const DEFAULT_NUM_OF_TARGET_NEIGHBORS: usize = 4;

pub struct Handshaker {
    ctx: RpcContext,
    neighbors: Arc<Neighbors>,
    num_of_target_neighbors: usize,
}

impl Handshaker {
    pub fn new(neighbors: Arc<Neighbors>, num_of_target_neighbors: usize) -> Self {
        Self {
            ctx: neighbors.context().clone(),
            neighbors,
            num_of_target_neighbors,
        }
    }

    // ========================================================================
    // Client side
    // ========================================================================

    pub async fn attempt_handshakes_on_contacts(&self, excluded: Vec<NodeId>) -> Vec<NodeId> {
        let n = self.num_of_target_neighbors;
        let (targets, mut excluded) = {
            let mut state = self.neighbors.lock().await;
            let mut excluded = excluded;
            for id in state.target_neighbors.ids() {
                push_unique(&mut excluded, id);
            }
            let occupied = state.occupied();
            if occupied + PARALLEL_HANDSHAKE_COUNT < n {
                trace!(stream_part = %self.ctx.stream_part(), "attempting parallel handshakes");
                let mut selection_exclude = excluded.clone();
                selection_exclude.extend(state.ongoing_handshakes.iter().copied());
                let mut targets = state.nearby_contacts.get_closest_and_furthest(&selection_exclude);
                while targets.len() < PARALLEL_HANDSHAKE_COUNT {
                    let mut exclude = selection_exclude.clone();
                    exclude.extend(targets.iter().map(|t| t.id()));
                    match state.random_contacts.get_random(&exclude) {
                        Some(random) => targets.push(random),
                        None => break,
                    }
                }
                targets.truncate(PARALLEL_HANDSHAKE_COUNT);
                for target in &targets {
                    state.ongoing_handshakes.insert(target.id());
                }
                (targets, excluded)
            } else if occupied < n {
                trace!(stream_part = %self.ctx.stream_part(), "attempting handshake with new target");
                let mut selection_exclude = excluded.clone();
                selection_exclude.extend(state.ongoing_handshakes.iter().copied());
                let target = state
                    .nearby_contacts
                    .get_closest(&selection_exclude)
                    .or_else(|| state.random_contacts.get_random(&selection_exclude));
                let targets: Vec<RemoteNodeHandle> = target.into_iter().collect();
                for target in &targets {
                    state.ongoing_handshakes.insert(target.id());
                }
                (targets, excluded)
            } else {
                return excluded;
            }
        };

        match targets.as_slice() {
            [] => {}
            [single] => {
                if !self.handshake_with_target(single.clone(), None).await {
                    push_unique(&mut excluded, single.id());
                }
            }
            [first, second, ..] => {
                let (a, b) = tokio::join!(
                    self.handshake_with_target(first.clone(), Some(second.id())),
                    self.handshake_with_target(second.clone(), Some(first.id())),
                );
                if !a {
                    push_unique(&mut excluded, first.id());
                }
                if !b {
                    push_unique(&mut excluded, second.id());
                }
            }
        }
        excluded
    }

    /// Handshake a target already reserved in `ongoing_handshakes`.
    async fn handshake_with_target(&self, target: RemoteNodeHandle, concurrent_id: Option<NodeId>) -> bool {
        let target_id = target.id();
        let neighbor_ids = self.neighbors.target_ids().await;
        let result = RemoteHandshaker::new(target.clone())
            .handshake(neighbor_ids, concurrent_id, None)
            .await;

        {
            let mut state = self.neighbors.lock().await;
            state.ongoing_handshakes.remove(&target_id);
            if result.accepted {
                self.accept_locked(&mut state, target);
            }
        }

        if result.accepted {
            debug!(stream_part = %self.ctx.stream_part(), peer = %target_id.short(), "handshake accepted");
        }
        if let Some(interleave_target) = result.interleave_target {
            self.handshake_with_interleaving(interleave_target, target_id).await;
        }
        result.accepted
    }

    /// Handshake a node the remote dropped in our favor, so it can take our
    /// place next to that node.
    pub async fn handshake_with_interleaving(&self, target: PeerDescriptor, interleave_source_id: NodeId) -> bool {
        let target_id = target.node_id;
        let neighbor_ids = {
            let mut state = self.neighbors.lock().await;
            if target_id == self.ctx.local_id()
                || state.target_neighbors.has(&target_id)
                || state.ongoing_handshakes.contains(&target_id)
                || state.occupied() >= self.num_of_target_neighbors
            {
                trace!(peer = %target_id.short(), "skipping interleave handshake");
                return false;
            }
            state.ongoing_handshakes.insert(target_id);
            state.target_neighbors.ids()
        };

        let remote = self.ctx.remote(target);
        let result = RemoteHandshaker::new(remote.clone())
            .handshake(neighbor_ids, None, Some(interleave_source_id))
            .await;

        let mut state = self.neighbors.lock().await;
        state.ongoing_handshakes.remove(&target_id);
        if result.accepted {
            self.accept_locked(&mut state, remote);
        }
        result.accepted
    }

    /// Record an accepted edge. If there is no room for it after all, tell the
    /// remote so it does not keep a one-sided edge.
    fn accept_locked(&self, state: &mut NeighborState, remote: RemoteNodeHandle) {
        let id = remote.id();
        if !self.neighbors.add_locked(state, remote.clone()) && !state.target_neighbors.has(&id) {
            debug!(peer = %id.short(), "accepted handshake without room, sending leave notice");
            tokio::spawn(async move {
                remote.leave_stream_part_notice(false).await;
            });
        }
    }

    // ========================================================================
    // Server side
    // ========================================================================

    pub async fn on_handshake_request(&self, request: HandshakeRequest) -> HandshakeResponse {
        let requester = request.sender_descriptor.node_id;
        let request_id = request.request_id.clone();
        let accept = |interleave_target_descriptor: Option<PeerDescriptor>| HandshakeResponse {
            request_id: request_id.clone(),
            accepted: true,
            interleave_target_descriptor,
        };
        if requester == self.ctx.local_id() {
            return reject(&request_id);
        }

        let n = self.num_of_target_neighbors;
        let mut state = self.neighbors.lock().await;
        let remote = self.ctx.remote(request.sender_descriptor.clone());

        if state.target_neighbors.has(&requester) || state.ongoing_handshakes.contains(&requester) {
            self.neighbors.add_locked(&mut state, remote);
            return accept(None);
        }

        if let Some(source) = request.interleave_source_id
            && state.target_neighbors.has(&source)
        {
            self.neighbors.remove_locked(&mut state, &source);
            self.neighbors.add_locked(&mut state, remote);
            trace!(peer = %requester.short(), source = %source.short(), "accepted interleave handshake");
            return accept(None);
        }

        if state.occupied() < n {
            if self.neighbors.add_locked(&mut state, remote) {
                return accept(None);
            }
            return reject(&request_id);
        }

        let mut exclude = request.neighbor_ids.clone();
        exclude.push(requester);
        if let Some(concurrent) = request.concurrent_handshake_target_id {
            exclude.push(concurrent);
        }
        if state.target_neighbors.size_excluding(&exclude) >= 2
            && let Some(furthest) = state.target_neighbors.get_furthest(&exclude)
        {
            self.neighbors.remove_locked(&mut state, &furthest.id());
            self.neighbors.add_locked(&mut state, remote);
            debug!(
                peer = %requester.short(),
                interleave_target = %furthest.id().short(),
                "full, accepting with interleave"
            );
            return accept(Some(furthest.descriptor().clone()));
        }

        reject(&request_id)
    }
}

fn reject(request_id: &str) -> HandshakeResponse {
    HandshakeResponse {
        request_id: request_id.to_string(),
        accepted: false,
        interleave_target_descriptor: None,
    }
}

fn push_unique(ids: &mut Vec<NodeId>, id: NodeId) {
    if !ids.contains(&id) {
        ids.push(id);
    }
}
