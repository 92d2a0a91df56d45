//! The `PeerNetwork` trait boundary: everything `StorageController` needs
//! from the overlay's gossip/transport layer, kept deliberately narrow so
//! the protocol state machine in `controller.rs` never touches a socket
//! directly.
//!
//! §1 treats the underlying peer-to-peer gossip/transport as an external
//! collaborator; this module is the seam. `ChannelPeerNetwork` is an
//! in-process implementation (mpsc channels keyed by `PeerAddress`) used by
//! this crate's own tests and by any embedder wiring two controllers
//! together without a real network. Production embedders implement this
//! trait against their own transport, this crate additionally ships
//! `Libp2pPeerNetwork` (see `libp2p_peer_network.rs`, gated behind the
//! `libp2p-transport` feature) as a worked example over a real
//! gossipsub/request-response stack.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::error::{StorageError, StorageResult};
use crate::types::{PeerAddress, StorageHandshake, StorageOrder, StorageProposal};

/// Every message kind the controller exchanges over the wire (§6). `SendFile`
/// carries the ciphertext inline as `Vec<u8>` here, `ChannelPeerNetwork` is
/// an in-process transport with no framing concerns; a real transport would
/// instead stream `ReplicaStream`'s bytes per §4.5's wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    /// Gossiped `INV` carrying a `StorageOrder` announcement.
    Announce(StorageOrder),
    /// A keeper's bid, tag `dfsproposal`.
    Proposal(StorageProposal),
    /// Client to keeper, keys attached. Tag `dfshandshake`.
    Handshake(StorageHandshake),
    /// Keeper's keyless echo. Tag `dfsrr`.
    RequestReplica(StorageHandshake),
    /// Ciphertext push. Tag `dfssendfile`.
    SendFile {
        order_hash: crate::types::OrderHash,
        merkle_root: [u8; 32],
        ciphertext: Vec<u8>,
    },
    /// Liveness probe. Tag `dfsping`.
    Ping,
    /// Liveness probe reply, carrying the sender's observed address. Tag `dfspong`.
    Pong(PeerAddress),
}

/// A reachable connection the controller can push further messages down
/// without re-resolving the peer address. Analogous to the original's `CNode*`.
#[async_trait]
pub trait PeerHandle: Send + Sync {
    async fn send(&self, message: WireMessage) -> StorageResult<()>;
    fn remote_address(&self) -> PeerAddress;
    /// Close the connection. Used by the `proposal` handler's surplus-peer
    /// shedding and by failed-handshake cleanup.
    async fn disconnect(&self);
}

/// The capability `StorageController` needs from the overlay transport.
#[async_trait]
pub trait PeerNetwork: Send + Sync {
    /// Gossip an `announce` to every connected peer via the host's `INV`
    /// mechanism (§6). Fire-and-forget: gossip has no delivery guarantee.
    async fn broadcast_announce(&self, order: &StorageOrder) -> StorageResult<()>;

    /// Dial `address` if not already connected, returning a handle usable
    /// for direct sends. Used by the `announce` handler's proposal send and
    /// by `StartHandshake`'s locate-or-dial loop.
    async fn dial(&self, address: &PeerAddress) -> StorageResult<Arc<dyn PeerHandle>>;

    /// An already-connected handle to `address`, if one exists, without
    /// dialing. Backs the "prefer the direct channel, fall back to the
    /// inbound peer" rule in the `announce` handler.
    async fn connected_peer(&self, address: &PeerAddress) -> Option<Arc<dyn PeerHandle>>;

    /// Number of currently connected peers, for the `proposal` handler's
    /// surplus-socket shedding check.
    async fn connected_peer_count(&self) -> usize;

    /// This node's own listen port, echoed into outbound `StorageHandshake`s.
    fn listen_port(&self) -> u16;

    /// This node's best-known external address, if any has been learned via
    /// a `pong` reply.
    async fn external_address(&self) -> Option<PeerAddress>;

    /// Record a newly learned external address (from a `pong` payload).
    async fn set_external_address(&self, address: PeerAddress);

    /// All currently connected peers, for broadcasting `ping`.
    async fn all_peers(&self) -> Vec<Arc<dyn PeerHandle>>;
}

struct ChannelPeer {
    address: PeerAddress,
    outbox: mpsc::UnboundedSender<WireMessage>,
}

#[async_trait]
impl PeerHandle for ChannelPeer {
    async fn send(&self, message: WireMessage) -> StorageResult<()> {
        self.outbox
            .send(message)
            .map_err(|_| StorageError::PeerUnreachable(format!("{} hung up", self.address)))
    }

    fn remote_address(&self) -> PeerAddress {
        self.address.clone()
    }

    async fn disconnect(&self) {
        // Dropping the sender would require `&mut self`; a channel-backed
        // test double just lets the receiver observe closure once all
        // clones are dropped. Disconnection here is advisory only, real
        // transports tear down the underlying socket.
    }
}

/// In-process `PeerNetwork` backed by per-peer unbounded mpsc channels,
/// registered in a shared table keyed by `PeerAddress`. Two controllers
/// wired to the same `ChannelHub` can run the full protocol without any
/// real networking, which is how this crate's end-to-end tests drive both
/// the client and keeper roles in one process.
pub struct ChannelPeerNetwork {
    hub: Arc<ChannelHub>,
    my_address: PeerAddress,
    listen_port: u16,
    external_address: Mutex<Option<PeerAddress>>,
}

/// Shared registry every `ChannelPeerNetwork` instance in a test topology
/// dials against.
#[derive(Default)]
pub struct ChannelHub {
    peers: Mutex<HashMap<PeerAddress, mpsc::UnboundedSender<WireMessage>>>,
}

impl ChannelHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl ChannelPeerNetwork {
    /// Register a new node at `my_address` on `hub`, returning the network
    /// handle plus the inbound receiver the node's dispatcher should drain.
    pub fn register(
        hub: Arc<ChannelHub>,
        my_address: PeerAddress,
        listen_port: u16,
    ) -> (Self, mpsc::UnboundedReceiver<WireMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        hub.peers
            .try_lock()
            .expect("hub registration is single-threaded at setup")
            .insert(my_address.clone(), tx);
        (
            Self {
                hub,
                my_address,
                listen_port,
                external_address: Mutex::new(None),
            },
            rx,
        )
    }
}

#[async_trait]
impl PeerNetwork for ChannelPeerNetwork {
    async fn broadcast_announce(&self, order: &StorageOrder) -> StorageResult<()> {
        let peers = self.hub.peers.lock().await;
        for (addr, tx) in peers.iter() {
            if *addr == self.my_address {
                continue;
            }
            let _ = tx.send(WireMessage::Announce(order.clone()));
        }
        Ok(())
    }

    async fn dial(&self, address: &PeerAddress) -> StorageResult<Arc<dyn PeerHandle>> {
        let peers = self.hub.peers.lock().await;
        let tx = peers
            .get(address)
            .ok_or_else(|| StorageError::PeerUnreachable(address.0.clone()))?
            .clone();
        Ok(Arc::new(ChannelPeer {
            address: address.clone(),
            outbox: tx,
        }))
    }

    async fn connected_peer(&self, address: &PeerAddress) -> Option<Arc<dyn PeerHandle>> {
        self.dial(address).await.ok()
    }

    async fn connected_peer_count(&self) -> usize {
        self.hub.peers.lock().await.len().saturating_sub(1)
    }

    fn listen_port(&self) -> u16 {
        self.listen_port
    }

    async fn external_address(&self) -> Option<PeerAddress> {
        self.external_address.lock().await.clone()
    }

    async fn set_external_address(&self, address: PeerAddress) {
        *self.external_address.lock().await = Some(address);
    }

    async fn all_peers(&self) -> Vec<Arc<dyn PeerHandle>> {
        let peers = self.hub.peers.lock().await;
        peers
            .iter()
            .filter(|(addr, _)| **addr != self.my_address)
            .map(|(addr, tx)| {
                Arc::new(ChannelPeer {
                    address: addr.clone(),
                    outbox: tx.clone(),
                }) as Arc<dyn PeerHandle>
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FileURI, OrderHash};

    fn order() -> StorageOrder {
        StorageOrder {
            time: 0,
            file_uri: FileURI::zero(),
            filename: "f".into(),
            file_size: 10,
            max_rate: 5,
            max_gap: 1,
            client_address: PeerAddress("client".into()),
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_every_other_registered_peer_but_not_self() {
        let hub = ChannelHub::new();
        let (client_net, _client_rx) = ChannelPeerNetwork::register(hub.clone(), PeerAddress("client".into()), 1000);
        let (_keeper_net, mut keeper_rx) = ChannelPeerNetwork::register(hub.clone(), PeerAddress("keeper".into()), 1001);

        client_net.broadcast_announce(&order()).await.unwrap();

        let msg = keeper_rx.recv().await.unwrap();
        assert!(matches!(msg, WireMessage::Announce(_)));
        assert!(keeper_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dial_to_unregistered_address_fails() {
        let hub = ChannelHub::new();
        let (net, _rx) = ChannelPeerNetwork::register(hub, PeerAddress("client".into()), 1000);
        let result = net.dial(&PeerAddress("nobody".into())).await;
        assert!(matches!(result, Err(StorageError::PeerUnreachable(_))));
    }

    #[tokio::test]
    async fn connected_peer_count_excludes_self() {
        let hub = ChannelHub::new();
        let (a, _ra) = ChannelPeerNetwork::register(hub.clone(), PeerAddress("a".into()), 1000);
        let (_b, _rb) = ChannelPeerNetwork::register(hub.clone(), PeerAddress("b".into()), 1001);
        let (_c, _rc) = ChannelPeerNetwork::register(hub.clone(), PeerAddress("c".into()), 1002);
        assert_eq!(a.connected_peer_count().await, 2);
    }
}
