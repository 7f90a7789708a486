//! Protocol trait definitions for the overlay's external collaborators.
//!
//! The overlay logic depends only on these traits. Real deployments plug a
//! network transport and a Kademlia-style DHT in behind them; the in-process
//! [`Simulator`](crate::simulator::Simulator) implements all of them for tests
//! and the demo binary.
//!
//! ## Collaborators
//!
//! | Trait | Role |
//! |-------|------|
//! | [`Transport`] | point-to-point request/response and notifications, connection pinning |
//! | [`RpcHandler`] | inbound side of the transport, implemented by `StreamNode` |
//! | [`Layer1Node`] | DHT view of close peers plus key/value rendezvous storage |
//! | [`Layer1Factory`] | creates one `Layer1Node` per stream partition |

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::identity::{DataKey, PeerDescriptor, StreamPartId};
use crate::messages::{RpcNotification, RpcRequest, RpcResponse};

/// Point-to-point RPC channel between peer identities.
///
/// Connection pinning is reference counted per `(target, purpose)`: every
/// `lock_connection` must be balanced by exactly one `unlock_connection`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn local_descriptor(&self) -> PeerDescriptor;

    async fn request(&self, target: &PeerDescriptor, request: RpcRequest) -> Result<RpcResponse>;

    /// Fire-and-forget delivery. `Ok` only means the message was handed off.
    async fn notify(&self, target: &PeerDescriptor, notification: RpcNotification) -> Result<()>;

    fn lock_connection(&self, target: &PeerDescriptor, purpose: &str);

    fn unlock_connection(&self, target: &PeerDescriptor, purpose: &str);
}

/// Inbound RPC dispatch.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle_request(&self, source: PeerDescriptor, request: RpcRequest) -> RpcResponse;

    async fn handle_notification(&self, source: PeerDescriptor, notification: RpcNotification);
}

/// Change in a Layer1 node's contact view.
#[derive(Clone, Debug)]
pub enum ContactEvent {
    NewContact(PeerDescriptor),
    ContactRemoved(PeerDescriptor),
}

/// One record returned by [`Layer1Node::fetch_data`].
#[derive(Clone, Debug)]
pub struct DataEntry {
    pub data: Vec<u8>,
    pub storer: PeerDescriptor,
    pub deleted: bool,
}

/// DHT node used as a rendezvous directory.
#[async_trait]
pub trait Layer1Node: Send + Sync + 'static {
    async fn start(&self) -> Result<()>;

    async fn stop(&self);

    async fn join_dht(&self, entry_points: &[PeerDescriptor]) -> Result<()>;

    /// Close contacts, ordered by XOR distance to the local id, closest first.
    fn neighbors(&self) -> Vec<PeerDescriptor>;

    fn neighbor_count(&self) -> usize;

    /// Uniform sample of known contacts.
    fn random_contacts(&self, limit: usize) -> Vec<PeerDescriptor>;

    fn subscribe(&self) -> broadcast::Receiver<ContactEvent>;

    /// Store `data` under `key`, returning the peers that accepted it.
    async fn store_data(&self, key: DataKey, data: Vec<u8>, ttl: Duration) -> Result<Vec<PeerDescriptor>>;

    async fn fetch_data(&self, key: DataKey) -> Result<Vec<DataEntry>>;

    /// Mark the local node's record under `key` as deleted.
    async fn delete_data(&self, key: DataKey) -> Result<()>;
}

pub trait Layer1Factory: Send + Sync + 'static {
    fn create(&self, stream_part: &StreamPartId) -> Arc<dyn Layer1Node>;
}
