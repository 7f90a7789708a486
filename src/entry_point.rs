//! # Entry Point Discovery
//!
//! DHT-based bootstrap of stream partition membership.
//!
//! ## Discovery
//!
//! Entry points are [`PeerDescriptor`]s stored under
//! [`StreamPartId::data_key`]. Records flagged deleted are ignored, and so are
//! records that fail to decode. A fetch error is treated exactly like "no
//! data". When nothing is found the local node is its own sole entry point.
//!
//! ## Self-registration
//!
//! A node registers itself when fewer than [`ENTRYPOINT_STORE_LIMIT`] live
//! records were seen, or when its Layer1 neighbor count is below
//! [`NETWORK_SPLIT_AVOIDANCE_LIMIT`]. A registered node re-stores its record
//! every `store_interval` while it is still among the discovered records or
//! the partition is still under the limit.
//!
//! ## Network split avoidance
//!
//! While the Layer1 neighbor count stays under the split-avoidance limit the
//! node retries with exponential back-off: rediscover, re-join the DHT and
//! remember entry points that did not become neighbors. Remembered nodes are
//! skipped by later discoveries (unless nothing else is left) and are
//! forgotten after a successful round.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::identity::{NodeId, PeerDescriptor, StreamPartId};
use crate::messages::{deserialize_bounded, serialize_bounded};
use crate::protocols::Layer1Node;
use crate::scope::AbortScope;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Live entry point records tolerated per partition.
pub const ENTRYPOINT_STORE_LIMIT: usize = 8;

/// Layer1 neighbor count under which a network split is suspected.
pub const NETWORK_SPLIT_AVOIDANCE_LIMIT: usize = 4;

pub const DEFAULT_STORE_INTERVAL: Duration = Duration::from_secs(60);

pub const DEFAULT_ENTRY_POINT_TTL: Duration = Duration::from_secs(120);

pub const DEFAULT_SPLIT_AVOIDANCE_BASE_DELAY: Duration = Duration::from_millis(500);

pub const DEFAULT_SPLIT_AVOIDANCE_MAX_ATTEMPTS: u32 = 6;

#[derive(Clone, Debug)]
pub struct EntryPointConfig {
    pub store_interval: Duration,
    pub ttl: Duration,
    pub split_avoidance_base_delay: Duration,
    pub split_avoidance_max_attempts: u32,
}

impl Default for EntryPointConfig {
    fn default() -> Self {
        Self {
            store_interval: DEFAULT_STORE_INTERVAL,
            ttl: DEFAULT_ENTRY_POINT_TTL,
            split_avoidance_base_delay: DEFAULT_SPLIT_AVOIDANCE_BASE_DELAY,
            split_avoidance_max_attempts: DEFAULT_SPLIT_AVOIDANCE_MAX_ATTEMPTS,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FindEntryPointsResult {
    pub entry_points_from_dht: bool,
    pub discovered_entry_points: Vec<PeerDescriptor>,
}

/// Run `task` until it succeeds, waiting `base_delay * 2^i` after attempt `i`.
///
/// Returns `true` if an attempt succeeded before the attempts ran out or the
/// scope was aborted.
pub async fn exponential_run_off<F, Fut>(
    scope: &AbortScope,
    description: &str,
    base_delay: Duration,
    max_attempts: u32,
    mut task: F,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    for attempt in 1..=max_attempts {
        if scope.is_aborted() {
            return false;
        }
        match task().await {
            Ok(()) => return true,
            Err(e) => {
                let delay = base_delay.saturating_mul(2u32.saturating_pow(attempt));
                trace!(attempt, ?delay, error = %e, "{description} failed, retrying");
                if !scope.sleep(delay).await {
                    return false;
                }
            }
        }
    }
    false
}

pub struct EntryPointDiscovery {
    stream_part: StreamPartId,
    local: PeerDescriptor,
    layer1: Arc<dyn Layer1Node>,
    store: Arc<dyn Layer1Node>,
    config: EntryPointConfig,
    scope: AbortScope,
    split_avoided: Mutex<HashSet<NodeId>>,
    stored: Arc<AtomicBool>,
}

impl EntryPointDiscovery {
    /// `layer1` is the partition's DHT view; `store` holds the records.
    pub fn new(
        stream_part: StreamPartId,
        local: PeerDescriptor,
        layer1: Arc<dyn Layer1Node>,
        store: Arc<dyn Layer1Node>,
        config: EntryPointConfig,
        scope: AbortScope,
    ) -> Self {
        Self {
            stream_part,
            local,
            layer1,
            store,
            config,
            scope,
            split_avoided: Mutex::new(HashSet::new()),
            stored: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn discover_entry_points_from_dht(&self, known_entry_point_count: usize) -> FindEntryPointsResult {
        if known_entry_point_count > 0 {
            return FindEntryPointsResult {
                entry_points_from_dht: false,
                discovered_entry_points: Vec::new(),
            };
        }
        let mut discovered_entry_points = self.discover_entry_points().await;
        if discovered_entry_points.is_empty() {
            discovered_entry_points.push(self.local.clone());
        }
        FindEntryPointsResult {
            entry_points_from_dht: true,
            discovered_entry_points,
        }
    }

    async fn discover_entry_points(&self) -> Vec<PeerDescriptor> {
        let discovered = self.query_entry_points().await;
        let filtered: Vec<PeerDescriptor> = match self.split_avoided.lock() {
            Ok(avoided) => discovered
                .iter()
                .filter(|p| !avoided.contains(&p.node_id))
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        };
        // All of them were considered offline before; try them again anyway.
        if filtered.is_empty() { discovered } else { filtered }
    }

    async fn query_entry_points(&self) -> Vec<PeerDescriptor> {
        match self.store.fetch_data(self.stream_part.data_key()).await {
            Ok(entries) => entries
                .into_iter()
                .filter(|entry| !entry.deleted)
                .filter_map(|entry| match deserialize_bounded::<PeerDescriptor>(&entry.data) {
                    Ok(descriptor) => Some(descriptor),
                    Err(e) => {
                        trace!(storer = %entry.storer.node_id.short(), error = %e, "undecodable entry point record");
                        None
                    }
                })
                .collect(),
            Err(e) => {
                trace!(stream_part = %self.stream_part, error = %e, "entry point fetch failed");
                Vec::new()
            }
        }
    }

    pub async fn store_self_as_entry_point_if_necessary(self: &Arc<Self>, current_entry_point_count: usize) {
        if self.scope.is_aborted() {
            return;
        }
        let possible_split = self.layer1.neighbor_count() < NETWORK_SPLIT_AVOIDANCE_LIMIT;
        if (current_entry_point_count < ENTRYPOINT_STORE_LIMIT || possible_split)
            && !self.stored.swap(true, Ordering::SeqCst)
        {
            info!(stream_part = %self.stream_part, "registering self as entry point");
            self.store_self_as_entry_point().await;
            self.keep_self_as_entry_point();
        }
        if possible_split {
            let this = Arc::clone(self);
            self.scope.spawn(async move {
                this.avoid_network_split().await;
            });
        }
    }

    async fn store_self_as_entry_point(&self) -> bool {
        let data = match serialize_bounded(&self.local) {
            Ok(data) => data,
            Err(e) => {
                warn!(stream_part = %self.stream_part, error = %e, "failed to encode entry point record");
                return false;
            }
        };
        match self
            .store
            .store_data(self.stream_part.data_key(), data, self.config.ttl)
            .await
        {
            Ok(storers) => {
                trace!(stream_part = %self.stream_part, storers = storers.len(), "stored self as entry point");
                true
            }
            Err(e) => {
                warn!(stream_part = %self.stream_part, error = %e, "failed to store self as entry point");
                false
            }
        }
    }

    fn keep_self_as_entry_point(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let scope = self.scope.clone();
        self.scope.spawn(async move {
            while scope.sleep(this.config.store_interval).await {
                trace!(stream_part = %this.stream_part, "keeping self as entry point");
                let discovered = this.discover_entry_points().await;
                if discovered.len() < ENTRYPOINT_STORE_LIMIT || discovered.contains(&this.local) {
                    this.store_self_as_entry_point().await;
                }
            }
        });
    }

    async fn avoid_network_split(&self) {
        let succeeded = exponential_run_off(
            &self.scope,
            "avoid network split",
            self.config.split_avoidance_base_delay,
            self.config.split_avoidance_max_attempts,
            || async move {
                let rediscovered = self.discover_entry_points().await;
                if let Err(e) = self.layer1.join_dht(&rediscovered).await {
                    trace!(error = %e, "rejoin during split avoidance failed");
                }
                if self.layer1.neighbor_count() < NETWORK_SPLIT_AVOIDANCE_LIMIT {
                    let neighbors = self.layer1.neighbors();
                    if let Ok(mut avoided) = self.split_avoided.lock() {
                        avoided.extend(
                            rediscovered
                                .iter()
                                .filter(|p| p.node_id != self.local.node_id && !neighbors.contains(p))
                                .map(|p| p.node_id),
                        );
                    }
                    anyhow::bail!("network split is still possible");
                }
                Ok::<(), anyhow::Error>(())
            },
        )
        .await;
        if succeeded {
            if let Ok(mut avoided) = self.split_avoided.lock() {
                avoided.clear();
            }
            debug!(stream_part = %self.stream_part, "network split avoided");
        }
    }

    pub fn is_local_node_entry_point(&self) -> bool {
        self.stored.load(Ordering::SeqCst)
    }

    /// Shared flag that reads `true` once the local node has registered.
    pub fn registration_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stored)
    }

    pub fn avoided_count(&self) -> usize {
        self.split_avoided.lock().map(|a| a.len()).unwrap_or(0)
    }

    /// Cancel every loop and delete our record if we registered one.
    pub async fn destroy(&self) {
        self.scope.abort();
        if self.stored.swap(false, Ordering::SeqCst)
            && let Err(e) = self.store.delete_data(self.stream_part.data_key()).await
        {
            trace!(stream_part = %self.stream_part, error = %e, "failed to delete entry point record");
        }
    }
}
