//! # Neighbor Finder
//!
//! Polling loop that drives a partition toward its target neighbor count.
//! After an initial wait it runs two handshake rounds concurrently per tick,
//! carrying the growing exclusion list from tick to tick, and stops on its
//! own once enough neighbors exist or no unexcluded candidate is left in any
//! contact pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::trace;

use crate::handshaker::Handshaker;
use crate::identity::NodeId;
use crate::neighbors::Neighbors;
use crate::scope::AbortScope;

pub const DEFAULT_INITIAL_WAIT: Duration = Duration::from_millis(100);

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Clone, Debug)]
pub struct NeighborFinderConfig {
    pub min_count: usize,
    pub initial_wait: Duration,
    pub interval: Duration,
}

pub struct NeighborFinder {
    handshaker: Arc<Handshaker>,
    neighbors: Arc<Neighbors>,
    config: NeighborFinderConfig,
    scope: AbortScope,
    running: Mutex<Option<(u64, AbortScope)>>,
    generation: AtomicU64,
}

impl NeighborFinder {
    pub fn new(
        handshaker: Arc<Handshaker>,
        neighbors: Arc<Neighbors>,
        config: NeighborFinderConfig,
        scope: AbortScope,
    ) -> Self {
        Self {
            handshaker,
            neighbors,
            config,
            scope,
            running: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Start searching unless a search is already running.
    pub fn start(self: &Arc<Self>, excluded: Vec<NodeId>) {
        let Ok(mut running) = self.running.lock() else {
            return;
        };
        if running.is_some() || self.scope.is_aborted() {
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let run_scope = self.scope.child();
        *running = Some((generation, run_scope.clone()));
        drop(running);

        let this = Arc::clone(self);
        let loop_scope = run_scope.clone();
        run_scope.spawn(async move {
            this.find_neighbors(&loop_scope, excluded).await;
            this.finish(generation);
        });
    }

    pub fn stop(&self) {
        if let Ok(mut running) = self.running.lock()
            && let Some((_, scope)) = running.take()
        {
            scope.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().map(|r| r.is_some()).unwrap_or(false)
    }

    async fn find_neighbors(&self, scope: &AbortScope, mut excluded: Vec<NodeId>) {
        if !scope.sleep(self.config.initial_wait).await {
            return;
        }
        loop {
            let (a, b) = tokio::join!(
                self.handshaker.attempt_handshakes_on_contacts(excluded.clone()),
                self.handshaker.attempt_handshakes_on_contacts(excluded.clone()),
            );
            for id in a.into_iter().chain(b) {
                if !excluded.contains(&id) {
                    excluded.push(id);
                }
            }

            let (count, remaining) = {
                let state = self.neighbors.lock().await;
                (state.target_neighbors.size(), state.remaining_candidates(&excluded))
            };
            if count >= self.config.min_count || remaining == 0 {
                trace!(count, excluded = excluded.len(), "neighbor search finished");
                return;
            }
            if !scope.sleep(self.config.interval).await {
                return;
            }
        }
    }

    fn finish(&self, generation: u64) {
        if let Ok(mut running) = self.running.lock()
            && running.as_ref().is_some_and(|(g, _)| *g == generation)
        {
            *running = None;
        }
    }
}
