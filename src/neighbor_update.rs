//! # Neighbor Update Manager
//!
//! Every `neighbor_update_interval` each target neighbor receives our full
//! neighbor list and answers with its own. Returned descriptors are merged
//! into the nearby contact pool, which is how neighbors-of-neighbors spread
//! through the overlay. A neighbor that answers `remove_me`, or does not
//! answer at all, is dropped at once and the neighbor finder is restarted.
//!
//! The server side answers `remove_me = true` to any sender that is not one
//! of our target neighbors, which resolves one-sided edges.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::messages::NeighborUpdate;
use crate::neighbor_finder::NeighborFinder;
use crate::neighbors::Neighbors;
use crate::remote::RemoteNeighborUpdateManager;
use crate::scope::AbortScope;

pub const DEFAULT_NEIGHBOR_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

pub struct NeighborUpdateManager {
    neighbors: Arc<Neighbors>,
    finder: Arc<NeighborFinder>,
    interval: Duration,
    num_of_target_neighbors: usize,
    scope: AbortScope,
}

impl NeighborUpdateManager {
    pub fn new(
        neighbors: Arc<Neighbors>,
        finder: Arc<NeighborFinder>,
        interval: Duration,
        num_of_target_neighbors: usize,
        scope: AbortScope,
    ) -> Self {
        Self {
            neighbors,
            finder,
            interval,
            num_of_target_neighbors,
            scope,
        }
    }

    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let scope = self.scope.clone();
        self.scope.spawn(async move {
            while scope.sleep(this.interval).await {
                this.update_neighbor_info().await;
            }
        });
    }

    pub fn stop(&self) {
        self.scope.abort();
    }

    /// One exchange round with every current target neighbor.
    pub async fn update_neighbor_info(&self) {
        let handles = self.neighbors.target_handles().await;
        if handles.is_empty() {
            self.restart_finder_if_needed().await;
            return;
        }
        let own_neighbors: Vec<_> = handles.iter().map(|h| h.descriptor().clone()).collect();

        let mut exchanges = JoinSet::new();
        for handle in handles {
            let descriptors = own_neighbors.clone();
            exchanges.spawn(async move {
                let id = handle.id();
                let result = RemoteNeighborUpdateManager::new(handle)
                    .update_neighbors(descriptors)
                    .await;
                (id, result)
            });
        }

        while let Some(joined) = exchanges.join_next().await {
            if self.scope.is_aborted() {
                return;
            }
            let Ok((id, result)) = joined else {
                continue;
            };
            if result.remove_me {
                if self.neighbors.remove(&id).await.is_some() {
                    debug!(peer = %id.short(), "neighbor asked to be removed or is unreachable");
                }
                self.finder.start(vec![id]);
            } else {
                let own_id = self.neighbors.context().local_id();
                let merged: Vec<_> = result
                    .peer_descriptors
                    .into_iter()
                    .filter(|d| d.node_id != own_id)
                    .collect();
                trace!(peer = %id.short(), merged = merged.len(), "merging neighbor update");
                self.neighbors.merge_nearby(merged).await;
            }
        }
        self.restart_finder_if_needed().await;
    }

    /// Server side of the exchange.
    pub async fn on_neighbor_update(&self, update: NeighborUpdate) -> NeighborUpdate {
        let ctx = self.neighbors.context();
        if self.neighbors.has_target(&update.sender_id).await {
            let own_id = ctx.local_id();
            let merged: Vec<_> = update
                .neighbor_descriptors
                .into_iter()
                .filter(|d| d.node_id != own_id)
                .collect();
            self.neighbors.merge_nearby(merged).await;
            let neighbor_descriptors = self
                .neighbors
                .target_handles()
                .await
                .iter()
                .map(|h| h.descriptor().clone())
                .collect();
            NeighborUpdate {
                sender_id: own_id,
                stream_part_id: ctx.stream_part().clone(),
                neighbor_descriptors,
                remove_me: false,
            }
        } else {
            trace!(peer = %update.sender_id.short(), "neighbor update from non-neighbor");
            NeighborUpdate {
                sender_id: ctx.local_id(),
                stream_part_id: ctx.stream_part().clone(),
                neighbor_descriptors: Vec::new(),
                remove_me: true,
            }
        }
    }

    async fn restart_finder_if_needed(&self) {
        if self.neighbors.target_count().await < self.num_of_target_neighbors && !self.finder.is_running() {
            self.finder.start(Vec::new());
        }
    }
}
