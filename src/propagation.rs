//! # Propagation
//!
//! Best-effort gossip fan-out with message deduplication.
//!
//! ## Deduplication
//!
//! [`SeenMessageCache`] is a bounded LRU of [`MessageId`]s with a TTL. A message
//! whose id is present is dropped before it is delivered or forwarded again,
//! which terminates gossip and guarantees at-most-once processing per node.
//!
//! ## Fan-out
//!
//! An unseen message is sent to every eligible target except the node it came
//! from. Each send is an independent fire-and-forget task, so one failing
//! neighbor never aborts the rest of the fan-out. When fewer than
//! `min_propagation_targets` sends were made, the message is parked as a
//! pending task and handed to neighbors that join before it expires.

use std::collections::{HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::trace;

use crate::identity::NodeId;
use crate::messages::{MessageId, StreamMessage};
use crate::remote::RemoteNodeHandle;
use crate::scope::AbortScope;

// ============================================================================
// Configuration Constants
// ============================================================================

pub const DEFAULT_MIN_PROPAGATION_TARGETS: usize = 2;

pub const DEFAULT_SEEN_CACHE_SIZE: usize = 10_000;

pub const DEFAULT_SEEN_CACHE_TTL: Duration = Duration::from_secs(300);

pub const DEFAULT_PROPAGATION_BUFFER_TTL: Duration = Duration::from_secs(10);

/// Upper bound on parked propagation tasks.
pub const MAX_PENDING_TASKS: usize = 150;

#[derive(Clone, Debug)]
pub struct PropagationConfig {
    pub min_propagation_targets: usize,
    pub seen_cache_size: usize,
    pub seen_cache_ttl: Duration,
    pub buffer_ttl: Duration,
    pub max_pending_tasks: usize,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            min_propagation_targets: DEFAULT_MIN_PROPAGATION_TARGETS,
            seen_cache_size: DEFAULT_SEEN_CACHE_SIZE,
            seen_cache_ttl: DEFAULT_SEEN_CACHE_TTL,
            buffer_ttl: DEFAULT_PROPAGATION_BUFFER_TTL,
            max_pending_tasks: MAX_PENDING_TASKS,
        }
    }
}

// ============================================================================
// Seen message cache
// ============================================================================

pub struct SeenMessageCache {
    entries: LruCache<MessageId, Instant>,
    ttl: Duration,
}

impl SeenMessageCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    /// Record `id`. Returns `true` if it had not been seen within the TTL.
    pub fn mark(&mut self, id: &MessageId) -> bool {
        let now = Instant::now();
        if let Some(seen_at) = self.entries.get(id)
            && now.duration_since(*seen_at) < self.ttl
        {
            return false;
        }
        self.entries.put(id.clone(), now);
        true
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries
            .peek(id)
            .is_some_and(|seen_at| seen_at.elapsed() < self.ttl)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Propagation
// ============================================================================

struct PendingTask {
    message: StreamMessage,
    source: Option<NodeId>,
    handled: HashSet<NodeId>,
    created: Instant,
}

pub struct Propagation {
    config: PropagationConfig,
    seen: Mutex<SeenMessageCache>,
    pending: Mutex<VecDeque<PendingTask>>,
    scope: AbortScope,
}

impl Propagation {
    pub fn new(config: PropagationConfig, scope: AbortScope) -> Self {
        let seen = SeenMessageCache::new(config.seen_cache_size, config.seen_cache_ttl);
        Self {
            config,
            seen: Mutex::new(seen),
            pending: Mutex::new(VecDeque::new()),
            scope,
        }
    }

    /// Returns `true` if the message is new and should be processed.
    pub fn mark_and_check_new(&self, id: &MessageId) -> bool {
        match self.seen.lock() {
            Ok(mut seen) => seen.mark(id),
            Err(_) => false,
        }
    }

    /// Send an unseen message to every target except `source`.
    ///
    /// Returns the number of sends issued.
    pub fn feed_unseen_message(
        &self,
        message: &StreamMessage,
        targets: Vec<RemoteNodeHandle>,
        source: Option<NodeId>,
    ) -> usize {
        let mut handled = HashSet::new();
        for target in targets {
            let id = target.id();
            if Some(id) == source || !handled.insert(id) {
                continue;
            }
            self.send(target, message.clone());
        }
        let sent = handled.len();
        if sent < self.config.min_propagation_targets {
            self.park(message.clone(), source, handled);
        }
        trace!(sent, "propagated stream message");
        sent
    }

    /// Forward parked messages to a neighbor that just joined.
    pub fn on_neighbor_joined(&self, neighbor: &RemoteNodeHandle) {
        let Ok(mut pending) = self.pending.lock() else {
            return;
        };
        let now = Instant::now();
        let ttl = self.config.buffer_ttl;
        pending.retain(|task| now.duration_since(task.created) < ttl);

        let id = neighbor.id();
        for task in pending.iter_mut() {
            if task.source == Some(id) || task.handled.contains(&id) {
                continue;
            }
            task.handled.insert(id);
            self.send(neighbor.clone(), task.message.clone());
        }
        let min = self.config.min_propagation_targets;
        pending.retain(|task| task.handled.len() < min);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    fn park(&self, message: StreamMessage, source: Option<NodeId>, handled: HashSet<NodeId>) {
        let Ok(mut pending) = self.pending.lock() else {
            return;
        };
        while pending.len() >= self.config.max_pending_tasks {
            pending.pop_front();
        }
        pending.push_back(PendingTask {
            message,
            source,
            handled,
            created: Instant::now(),
        });
    }

    fn send(&self, target: RemoteNodeHandle, message: StreamMessage) {
        self.scope.spawn(async move {
            target.send_stream_message(message).await;
        });
    }
}
