//! # storagecontroller
//!
//! Control plane for a decentralized file-storage overlay embedded in a
//! blockchain peer-to-peer node. A storage client advertises a file it
//! wants replicated; storage keepers on other nodes negotiate to host an
//! encrypted replica; the client selects winners, encrypts the payload,
//! streams it to them, and verifies receipt via a Merkle root.
//!
//! ## Module map
//!
//! - [`types`]: the wire/data model, content-addressed hashes, orders,
//!   proposals, handshakes, keys.
//! - [`heap`]: [`StorageHeap`], the disk-backed byte allocator backing both
//!   permanent and temporary storage.
//! - [`codec`]: the RSA+AES hybrid streaming cipher a replica is pushed
//!   through.
//! - [`merkle`]: the Merkle tree builder/verifier over ciphertext blocks.
//! - [`proposals_agent`]: per-order proposal bookkeeping and the listening
//!   set.
//! - [`replica_stream`]: the wire binding between a ciphertext file and the
//!   `send-file` message.
//! - [`peer_network`]: the `PeerNetwork` trait boundary to the overlay
//!   transport, plus an in-process `ChannelPeerNetwork` test double.
//! - [`controller`]: [`StorageController`], the protocol state machine
//!   tying everything above together.
//! - [`config`]: TOML-backed configuration for every tunable in the above.
//! - [`error`]: the crate's single flat error enum.
//! - [`logging`]: structured `tracing` setup and per-subsystem log helpers.
//! - [`resilience`]: retry/timeout/cancelable-poll helpers used by the
//!   protocol's dial and handshake-echo waits.
//! - [`secure_random`]: `OsRng`-backed random byte generation used by the
//!   codec's per-replica AES key generation.

pub mod codec;
pub mod config;
pub mod controller;
pub mod error;
pub mod heap;
pub mod logging;
pub mod merkle;
pub mod peer_network;
pub mod proposals_agent;
pub mod replica_stream;
pub mod resilience;
pub mod secure_random;
pub mod types;

#[cfg(feature = "libp2p-transport")]
pub mod libp2p_peer_network;

pub use config::Config;
pub use controller::StorageController;
pub use error::{StorageError, StorageResult};
pub use peer_network::{ChannelHub, ChannelPeerNetwork, PeerHandle, PeerNetwork, WireMessage};
pub use types::{
    DecryptionKeys, FileURI, OrderHash, PeerAddress, ProposalHash, StorageHandshake, StorageOrder,
    StorageProposal,
};
