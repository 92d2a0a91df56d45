//! Worked example of wiring `StorageController` to a real transport: a
//! `PeerNetwork` adapter over a `libp2p` swarm, following the actor pattern
//! an internal `network_actor` module uses to keep the non-`Send` `Swarm` off
//! every caller's thread. Gated behind the `libp2p-transport` feature, the
//! core crate only depends on the `PeerNetwork` trait (`peer_network.rs`),
//! not on this adapter.
//!
//! `announce` broadcasts are published on a `gossipsub` topic (the overlay's
//! `INV` mechanism, §6); every other message kind (`proposal`, `handshake`,
//! `request-replica`, `send-file`, `ping`, `pong`) is a direct
//! `request_response` exchange with the CBOR codec, matching the messages'
//! point-to-point semantics in §4.6.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::gossipsub::{self, IdentTopic};
use libp2p::request_response::{self, cbor, ProtocolSupport};
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{identity, noise, tcp, yamux, Multiaddr, PeerId, StreamProtocol, SwarmBuilder};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::{StorageError, StorageResult};
use crate::peer_network::{PeerHandle, PeerNetwork, WireMessage};
use crate::types::{PeerAddress, StorageOrder};

const ANNOUNCE_TOPIC: &str = "storagecontroller/announce/1";
const PROTOCOL: StreamProtocol = StreamProtocol::new("/storagecontroller/1");

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "StorageBehaviourEvent")]
struct StorageBehaviour {
    gossipsub: gossipsub::Behaviour,
    rr: cbor::Behaviour<WireMessage, ()>,
}

#[derive(Debug)]
enum StorageBehaviourEvent {
    Gossipsub(gossipsub::Event),
    Rr(request_response::Event<WireMessage, ()>),
}

impl From<gossipsub::Event> for StorageBehaviourEvent {
    fn from(e: gossipsub::Event) -> Self {
        StorageBehaviourEvent::Gossipsub(e)
    }
}

impl From<request_response::Event<WireMessage, ()>> for StorageBehaviourEvent {
    fn from(e: request_response::Event<WireMessage, ()>) -> Self {
        StorageBehaviourEvent::Rr(e)
    }
}

/// Commands the `PeerNetwork`/`PeerHandle` impls send to the isolated swarm
/// task, mirroring `network_actor.rs`'s `NetworkMessage` design.
enum ActorCommand {
    Broadcast(WireMessage),
    SendTo(PeerId, WireMessage, oneshot::Sender<StorageResult<()>>),
    Dial(Multiaddr, oneshot::Sender<StorageResult<PeerId>>),
    ConnectedPeers(oneshot::Sender<Vec<PeerId>>),
    Disconnect(PeerId),
}

/// Clone-able front door to the isolated swarm actor. Implements both
/// `PeerNetwork` (the whole-network capability) and, per-peer, `PeerHandle`.
#[derive(Clone)]
pub struct Libp2pPeerNetwork {
    commands: mpsc::UnboundedSender<ActorCommand>,
    listen_port: u16,
    /// Inbound messages the controller's dispatcher should drain and feed to
    /// `StorageController::handle_message`.
    inbound: Arc<Mutex<mpsc::UnboundedReceiver<(PeerId, WireMessage)>>>,
    external_address: Arc<Mutex<Option<PeerAddress>>>,
    peer_addresses: Arc<Mutex<HashMap<PeerId, PeerAddress>>>,
}

impl Libp2pPeerNetwork {
    /// Spawn the swarm actor on a dedicated task, listening on `listen_port`.
    /// Inbound messages are drained via `recv()`, not a returned channel half
    /// (the handle already owns the receiving end internally).
    pub async fn spawn(listen_port: u16) -> StorageResult<Self> {
        let local_key = identity::Keypair::generate_ed25519();

        let mut swarm = SwarmBuilder::with_existing_identity(local_key)
            .with_tokio()
            .with_tcp(tcp::Config::default(), noise::Config::new, yamux::Config::default)
            .map_err(|e| StorageError::Generic(format!("libp2p tcp transport: {}", e)))?
            .with_behaviour(|key| {
                let gossipsub = gossipsub::Behaviour::new(
                    gossipsub::MessageAuthenticity::Signed(key.clone()),
                    gossipsub::Config::default(),
                )
                .expect("valid gossipsub config");
                let rr = cbor::Behaviour::new(
                    [(PROTOCOL, ProtocolSupport::Full)],
                    request_response::Config::default(),
                );
                StorageBehaviour { gossipsub, rr }
            })
            .map_err(|e| StorageError::Generic(format!("libp2p behaviour: {}", e)))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(120)))
            .build();

        swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&IdentTopic::new(ANNOUNCE_TOPIC))
            .map_err(|e| StorageError::Generic(format!("gossipsub subscribe: {}", e)))?;

        swarm
            .listen_on(format!("/ip4/0.0.0.0/tcp/{}", listen_port).parse().unwrap())
            .map_err(|e| StorageError::Generic(format!("listen_on: {}", e)))?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_actor(swarm, command_rx, inbound_tx));

        Ok(Self {
            commands: command_tx,
            listen_port,
            inbound: Arc::new(Mutex::new(inbound_rx)),
            external_address: Arc::new(Mutex::new(None)),
            peer_addresses: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Drain the next inbound message, dispatching it like a transport-owned
    /// handler thread would (§5).
    pub async fn recv(&self) -> Option<(PeerId, WireMessage)> {
        self.inbound.lock().await.recv().await
    }
}

async fn run_actor(
    mut swarm: libp2p::Swarm<StorageBehaviour>,
    mut commands: mpsc::UnboundedReceiver<ActorCommand>,
    inbound: mpsc::UnboundedSender<(PeerId, WireMessage)>,
) {
    let mut pending_sends: HashMap<request_response::OutboundRequestId, oneshot::Sender<StorageResult<()>>> =
        HashMap::new();
    let mut pending_dials: HashMap<PeerId, oneshot::Sender<StorageResult<PeerId>>> = HashMap::new();

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(ActorCommand::Broadcast(msg)) => {
                        if let Ok(bytes) = serde_json::to_vec(&msg) {
                            let _ = swarm.behaviour_mut().gossipsub.publish(IdentTopic::new(ANNOUNCE_TOPIC), bytes);
                        }
                    }
                    Some(ActorCommand::SendTo(peer, msg, reply)) => {
                        let request_id = swarm.behaviour_mut().rr.send_request(&peer, msg);
                        pending_sends.insert(request_id, reply);
                    }
                    Some(ActorCommand::Dial(addr, reply)) => {
                        match swarm.dial(addr.clone()) {
                            Ok(()) => {
                                if let Some(libp2p::multiaddr::Protocol::P2p(peer)) =
                                    addr.iter().find(|p| matches!(p, libp2p::multiaddr::Protocol::P2p(_)))
                                {
                                    pending_dials.insert(peer, reply);
                                } else {
                                    let _ = reply.send(Err(StorageError::PeerUnreachable(
                                        "dial address missing /p2p suffix".to_string(),
                                    )));
                                }
                            }
                            Err(e) => {
                                let _ = reply.send(Err(StorageError::PeerUnreachable(e.to_string())));
                            }
                        }
                    }
                    Some(ActorCommand::ConnectedPeers(reply)) => {
                        let _ = reply.send(swarm.connected_peers().copied().collect());
                    }
                    Some(ActorCommand::Disconnect(peer)) => {
                        let _ = swarm.disconnect_peer_id(peer);
                    }
                    None => return,
                }
            }
            event = swarm.select_next_some() => {
                match event {
                    SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                        if let Some(reply) = pending_dials.remove(&peer_id) {
                            let _ = reply.send(Ok(peer_id));
                        }
                    }
                    SwarmEvent::Behaviour(StorageBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                        message, propagation_source, ..
                    })) => {
                        if let Ok(msg) = serde_json::from_slice::<WireMessage>(&message.data) {
                            let _ = inbound.send((propagation_source, msg));
                        }
                    }
                    SwarmEvent::Behaviour(StorageBehaviourEvent::Rr(request_response::Event::Message {
                        peer,
                        message,
                    })) => match message {
                        request_response::Message::Request { request, channel, .. } => {
                            let _ = swarm.behaviour_mut().rr.send_response(channel, ());
                            let _ = inbound.send((peer, request));
                        }
                        request_response::Message::Response { request_id, .. } => {
                            if let Some(reply) = pending_sends.remove(&request_id) {
                                let _ = reply.send(Ok(()));
                            }
                        }
                    },
                    SwarmEvent::Behaviour(StorageBehaviourEvent::Rr(request_response::Event::OutboundFailure {
                        request_id, error, ..
                    })) => {
                        if let Some(reply) = pending_sends.remove(&request_id) {
                            let _ = reply.send(Err(StorageError::PeerUnreachable(error.to_string())));
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

struct Libp2pPeerHandle {
    peer_id: PeerId,
    address: PeerAddress,
    commands: mpsc::UnboundedSender<ActorCommand>,
}

#[async_trait]
impl PeerHandle for Libp2pPeerHandle {
    async fn send(&self, message: WireMessage) -> StorageResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(ActorCommand::SendTo(self.peer_id, message, reply_tx))
            .map_err(|_| StorageError::PeerUnreachable("actor gone".to_string()))?;
        reply_rx
            .await
            .map_err(|_| StorageError::PeerUnreachable("actor dropped reply channel".to_string()))?
    }

    fn remote_address(&self) -> PeerAddress {
        self.address.clone()
    }

    async fn disconnect(&self) {
        let _ = self.commands.send(ActorCommand::Disconnect(self.peer_id));
    }
}

#[async_trait]
impl PeerNetwork for Libp2pPeerNetwork {
    async fn broadcast_announce(&self, order: &StorageOrder) -> StorageResult<()> {
        self.commands
            .send(ActorCommand::Broadcast(WireMessage::Announce(order.clone())))
            .map_err(|_| StorageError::PeerUnreachable("actor gone".to_string()))
    }

    async fn dial(&self, address: &PeerAddress) -> StorageResult<Arc<dyn PeerHandle>> {
        let multiaddr: Multiaddr = address
            .0
            .parse()
            .map_err(|e| StorageError::PeerUnreachable(format!("invalid multiaddr {}: {}", address, e)))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(ActorCommand::Dial(multiaddr, reply_tx))
            .map_err(|_| StorageError::PeerUnreachable("actor gone".to_string()))?;
        let peer_id = reply_rx
            .await
            .map_err(|_| StorageError::PeerUnreachable("actor dropped reply channel".to_string()))??;
        self.peer_addresses.lock().await.insert(peer_id, address.clone());
        Ok(Arc::new(Libp2pPeerHandle {
            peer_id,
            address: address.clone(),
            commands: self.commands.clone(),
        }))
    }

    async fn connected_peer(&self, address: &PeerAddress) -> Option<Arc<dyn PeerHandle>> {
        let peer_addresses = self.peer_addresses.lock().await;
        let peer_id = peer_addresses.iter().find(|(_, a)| *a == address).map(|(p, _)| *p)?;
        Some(Arc::new(Libp2pPeerHandle {
            peer_id,
            address: address.clone(),
            commands: self.commands.clone(),
        }))
    }

    async fn connected_peer_count(&self) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(ActorCommand::ConnectedPeers(reply_tx)).is_err() {
            return 0;
        }
        reply_rx.await.map(|peers| peers.len()).unwrap_or(0)
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
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(ActorCommand::ConnectedPeers(reply_tx)).is_err() {
            return Vec::new();
        }
        let Ok(peer_ids) = reply_rx.await else {
            return Vec::new();
        };
        let peer_addresses = self.peer_addresses.lock().await;
        peer_ids
            .into_iter()
            .map(|peer_id| {
                let address = peer_addresses
                    .get(&peer_id)
                    .cloned()
                    .unwrap_or_else(|| PeerAddress(peer_id.to_string()));
                Arc::new(Libp2pPeerHandle {
                    peer_id,
                    address,
                    commands: self.commands.clone(),
                }) as Arc<dyn PeerHandle>
            })
            .collect()
    }
}
