//! # Streamnet - Trackerless Stream Partition Overlay
//!
//! Streamnet builds and maintains one bounded-degree random gossip graph per
//! stream partition, without a central tracker:
//!
//! - **Discovery**: entry points are rendezvoused through a DHT under a hash of
//!   the stream part id; the first node on a partition registers itself
//! - **Topology**: handshakes with interleaving keep every node near a target
//!   neighbor count while preserving connectivity
//! - **Delivery**: deduplicated best-effort gossip with at-most-once processing
//! - **Proxies**: constrained nodes publish or subscribe through full nodes
//!   without joining the overlay
//!
//! ## Architecture
//!
//! Overlay logic depends only on the traits in `protocols`. A deployment plugs
//! a network transport and a Kademlia-style DHT in behind them; the
//! [`Simulator`] implements both in-process.
//!
//! Each joined partition is a [`DeliveryLayerNode`] owning one cancellation
//! scope. Stopping it aborts every timer and loop it started, releases every
//! connection pin it took and tells its neighbors it is leaving.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | [`StreamNode`] registry of partitions, inbound RPC routing |
//! | `delivery` | per-partition state machine and configuration |
//! | `handshaker` | neighbor handshakes, server-side admission and interleaving |
//! | `neighbor_finder` | polling loop driving a partition to its target degree |
//! | `neighbor_update` | periodic neighbor list exchange |
//! | `neighbors` | shared per-partition neighbor state and its side effects |
//! | `node_list` | bounded ordered peer lists |
//! | `propagation` | gossip fan-out, seen-message cache, pending tasks |
//! | `entry_point` | DHT entry point discovery, registration, split avoidance |
//! | `proxy` | proxy server and client |
//! | `remote` | per-peer RPC wrappers converting failures into negative results |
//! | `protocols` | collaborator traits (`Transport`, `Layer1Node`, ...) |
//! | `messages` | wire message shapes and bounded bincode codec |
//! | `identity` | node ids, peer descriptors, stream part ids |
//! | `events` | typed node events |
//! | `locks` | reference-counted connection pins |
//! | `scope` | abort scopes |
//! | `simulator` | in-process transport and DHT |

mod delivery;
mod entry_point;
mod events;
mod handshaker;
mod identity;
mod locks;
mod messages;
mod neighbor_finder;
mod neighbor_update;
mod neighbors;
mod node;
mod node_list;
mod propagation;
mod protocols;
mod proxy;
mod remote;
mod scope;
mod simulator;

pub use delivery::{DEFAULT_MAX_CONTACT_COUNT, DeliveryConfig, DeliveryLayerNode, DeliveryState};
pub use entry_point::{
    ENTRYPOINT_STORE_LIMIT, EntryPointConfig, EntryPointDiscovery, FindEntryPointsResult, NETWORK_SPLIT_AVOIDANCE_LIMIT,
    exponential_run_off,
};
pub use events::{EventEmitter, NodeEvent};
pub use handshaker::{DEFAULT_NUM_OF_TARGET_NEIGHBORS, PARALLEL_HANDSHAKE_COUNT};
pub use identity::{DataKey, NODE_ID_LEN, NodeId, NodeType, PeerDescriptor, StreamPartId, UserId, sort_by_distance};
pub use locks::ConnectionLocks;
pub use messages::{
    HandshakeRequest, HandshakeResponse, LeaveNotice, MessageId, MessageRef, NeighborUpdate, ProxyConnectionRequest,
    ProxyConnectionResponse, ProxyDirection, RpcEnvelope, RpcNotification, RpcPayload, RpcRequest, RpcResponse,
    StreamMessage,
};
pub use node::{NodeConfig, NodeError, NodeInfo, StreamNode, StreamPartDelivery, StreamPartInfo};
pub use propagation::{DEFAULT_MIN_PROPAGATION_TARGETS, PropagationConfig, SeenMessageCache};
pub use protocols::{ContactEvent, DataEntry, Layer1Factory, Layer1Node, RpcHandler, Transport};
pub use proxy::{ProxyClient, ProxyServer};
pub use remote::{DEFAULT_RPC_TIMEOUT, RpcContext};
pub use scope::AbortScope;
pub use simulator::{DEFAULT_LAYER1_NEIGHBOR_LIMIT, SimLayer1, SimLayer1Factory, SimTransport, Simulator};
