//! Node events and non-blocking broadcast emitter.

use tokio::sync::broadcast;

use crate::identity::{NodeId, StreamPartId};
use crate::messages::StreamMessage;

/// Events observable on a [`StreamNode`](crate::node::StreamNode).
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A stream message delivered to this node for the first time.
    NewMessage(StreamMessage),
    NeighborAdded {
        stream_part: StreamPartId,
        node_id: NodeId,
    },
    NeighborRemoved {
        stream_part: StreamPartId,
        node_id: NodeId,
    },
    /// A neighbor that had registered itself as an entry point left.
    EntryPointLeaveDetected {
        stream_part: StreamPartId,
    },
    StreamPartJoined(StreamPartId),
    StreamPartLeft(StreamPartId),
}

impl NodeEvent {
    pub fn stream_part(&self) -> StreamPartId {
        match self {
            Self::NewMessage(msg) => msg.stream_part_id(),
            Self::NeighborAdded { stream_part, .. }
            | Self::NeighborRemoved { stream_part, .. }
            | Self::EntryPointLeaveDetected { stream_part } => stream_part.clone(),
            Self::StreamPartJoined(id) | Self::StreamPartLeft(id) => id.clone(),
        }
    }

    pub fn is_neighbor_event(&self) -> bool {
        matches!(self, Self::NeighborAdded { .. } | Self::NeighborRemoved { .. })
    }
}

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Non-blocking broadcast emitter. Slow subscribers drop events independently.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<NodeEvent>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: NodeEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventEmitter {
    pub fn new_message(&self, msg: StreamMessage) {
        self.emit(NodeEvent::NewMessage(msg));
    }

    pub fn neighbor_added(&self, stream_part: StreamPartId, node_id: NodeId) {
        self.emit(NodeEvent::NeighborAdded { stream_part, node_id });
    }

    pub fn neighbor_removed(&self, stream_part: StreamPartId, node_id: NodeId) {
        self.emit(NodeEvent::NeighborRemoved { stream_part, node_id });
    }

    pub fn entry_point_leave_detected(&self, stream_part: StreamPartId) {
        self.emit(NodeEvent::EntryPointLeaveDetected { stream_part });
    }
}
