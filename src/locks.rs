//! Reference-counted connection pinning.
//!
//! One transport connection is multiplexed across every stream partition two
//! peers share, so pins are counted per `(peer, purpose)`; the connection may
//! be released only when no purpose holds a pin on it.

use std::collections::HashMap;

use tracing::warn;

use crate::identity::NodeId;

#[derive(Debug, Default)]
pub struct ConnectionLocks {
    counts: HashMap<(NodeId, String), usize>,
}

impl ConnectionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&mut self, peer: NodeId, purpose: &str) {
        *self.counts.entry((peer, purpose.to_string())).or_insert(0) += 1;
    }

    /// Returns `false` if there was no pin to release.
    pub fn unlock(&mut self, peer: NodeId, purpose: &str) -> bool {
        let key = (peer, purpose.to_string());
        match self.counts.get_mut(&key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.counts.remove(&key);
                true
            }
            None => {
                warn!(peer = %peer.short(), purpose, "unlock without matching lock");
                false
            }
        }
    }

    pub fn count(&self, peer: &NodeId, purpose: &str) -> usize {
        self.counts
            .get(&(*peer, purpose.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Whether any purpose still pins the connection to `peer`.
    pub fn is_locked(&self, peer: &NodeId) -> bool {
        self.counts.keys().any(|(id, _)| id == peer)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    /// Pins held for `purpose`, across all peers.
    pub fn count_for_purpose(&self, purpose: &str) -> usize {
        self.counts
            .iter()
            .filter(|((_, p), _)| p == purpose)
            .map(|(_, count)| *count)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NODE_ID_LEN;

    #[test]
    fn pins_are_counted_per_peer_and_purpose() {
        let peer = NodeId::from_bytes([3; NODE_ID_LEN]);
        let mut locks = ConnectionLocks::new();
        locks.lock(peer, "a#0");
        locks.lock(peer, "b#0");
        assert_eq!(locks.count(&peer, "a#0"), 1);
        assert!(locks.is_locked(&peer));

        assert!(locks.unlock(peer, "a#0"));
        assert!(locks.is_locked(&peer));
        assert!(locks.unlock(peer, "b#0"));
        assert!(!locks.is_locked(&peer));
        assert_eq!(locks.total(), 0);
    }

    #[test]
    fn repeated_locks_need_matching_unlocks() {
        let peer = NodeId::from_bytes([4; NODE_ID_LEN]);
        let mut locks = ConnectionLocks::new();
        locks.lock(peer, "s#1");
        locks.lock(peer, "s#1");
        assert_eq!(locks.count_for_purpose("s#1"), 2);
        assert!(locks.unlock(peer, "s#1"));
        assert!(locks.is_locked(&peer));
        assert!(locks.unlock(peer, "s#1"));
        assert!(!locks.unlock(peer, "s#1"));
    }
}
