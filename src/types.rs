//! Shared data model: content-addressed identifiers, wire structs, and the
//! canonical hashing convention used to derive them.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::StorageResult;

/// Hash a `bincode`-serializable value with BLAKE3, producing a canonical
/// 32-byte digest. Every content-addressed identifier in this crate
/// (`OrderHash`, `ProposalHash`, `FileURI`) is derived this way.
pub fn canonical_hash<T: Serialize>(value: &T) -> StorageResult<[u8; 32]> {
    let bytes = bincode::serialize(value)?;
    Ok(*blake3::hash(&bytes).as_bytes())
}

macro_rules! hash_identifier {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// The all-zero sentinel value.
            pub fn zero() -> Self {
                $name([0u8; 32])
            }

            pub fn is_zero(&self) -> bool {
                self.0 == [0u8; 32]
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parse the hex encoding produced by `to_hex`. Returns `None`
            /// for anything that isn't exactly 32 well-formed hex bytes, so
            /// callers scanning a directory for allocation filenames can
            /// silently skip names that aren't one of these identifiers.
            pub fn from_hex(s: &str) -> Option<Self> {
                let bytes = hex::decode(s).ok()?;
                let array: [u8; 32] = bytes.try_into().ok()?;
                Some($name(array))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }
    };
}

hash_identifier!(OrderHash, "Content address of a `StorageOrder`.");
hash_identifier!(ProposalHash, "Content address of a `StorageProposal`.");
hash_identifier!(
    FileURI,
    "Content address of an allocated file. `FileURI::zero()` is the sentinel \
     reserved for temporary Merkle-scratch allocations."
);

/// A reachable peer's network address, opaque to this crate beyond equality
/// and display, the concrete transport address type is owned by whatever
/// `PeerNetwork` implementation is wired in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress(pub String);

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A client's declared intent to have a file replicated across the overlay.
/// Immutable once constructed; its `OrderHash` is the canonical hash of this
/// struct, so any field change produces a distinct order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageOrder {
    /// Unix timestamp the order was created. Drives `ClearOldAnnouncments`
    /// and the background worker's keeper-selection trigger (60s after
    /// `time`).
    pub time: u64,
    /// Content address the file will be stored under once replicated.
    /// Client-chosen; keepers allocate their replica in permanent storage
    /// under this URI.
    pub file_uri: FileURI,
    /// Human-readable filename, carried for logging/display only.
    pub filename: String,
    /// Plaintext file size in bytes.
    pub file_size: u64,
    /// Maximum rate (price per byte, arbitrary unit) the client will pay.
    pub max_rate: u64,
    /// Maximum acceptable gap between the file's current and last-verified block.
    pub max_gap: u64,
    /// Client's reachable address, used to send proposals and handshake
    /// echoes directly.
    pub client_address: PeerAddress,
}

impl StorageOrder {
    pub fn hash(&self) -> StorageResult<OrderHash> {
        Ok(OrderHash(canonical_hash(self)?))
    }
}

/// A storage provider's bid to keep a replica of an order's file. Immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageProposal {
    pub time: u64,
    pub order_hash: OrderHash,
    /// Proposed rate (price per byte). Accepted only if `< order.max_rate`
    /// (§9 open design note 4 pins the filter to strict `<`, preserving the
    /// original's behavior).
    pub rate: u64,
    /// Proposing peer's reachable address.
    pub peer_address: PeerAddress,
}

impl StorageProposal {
    pub fn hash(&self) -> StorageResult<ProposalHash> {
        Ok(ProposalHash(canonical_hash(self)?))
    }
}

/// The public RSA half plus the AES key used for one replica's cipher
/// pipeline. This is exactly what a keeper needs to decrypt a replica it
/// holds: the replica was RSA-wrapped with the matching *private* exponent
/// (textbook RSA's sign/verify symmetry, wrap with `d`, unwrap with `e`,
/// which lets the keeper recover plaintext from only the public half). The client
/// never transmits its private exponent; see DESIGN.md for why this crate
/// encrypts with the private key and decrypts with the public one.
///
/// Matches spec.md §3's literal `{rsaPublicKey, aesKey}` shape: the
/// plaintext size needed to trim the final block's padding on decrypt is
/// *not* carried here, it comes from the caller's own `StorageOrder.file_size`
/// at the `DecryptReplica` call site, mirroring
/// `examples/original_source/src/lux/storagecontroller.cpp`'s
/// `bytesSize = order->fileSize` at its decrypt call site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionKeys {
    /// Big-endian RSA modulus `n`.
    pub modulus: Vec<u8>,
    /// Big-endian RSA public exponent `e`.
    pub public_exponent: Vec<u8>,
    /// The AES-256 key used for the replica's CTR keystream.
    pub aes_key: [u8; 32],
}

/// Carries encryption keys from client to keeper during the handshake, and
/// its keyless echo (`request-replica`, wire tag `dfsrr`) from keeper back
/// to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageHandshake {
    pub time: u64,
    pub order_hash: OrderHash,
    pub proposal_hash: ProposalHash,
    /// Port the sender listens on for this protocol, echoed so the peer can
    /// dial back if the inbound connection doesn't survive.
    pub port: u16,
    /// Present on the client→keeper leg; `None` on the keeper→client
    /// `request-replica` echo.
    pub keys: Option<DecryptionKeys>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_order() -> StorageOrder {
        StorageOrder {
            time: 1000,
            file_uri: FileURI([7u8; 32]),
            filename: "report.pdf".to_string(),
            file_size: 1024,
            max_rate: 5,
            max_gap: 10,
            client_address: PeerAddress("127.0.0.1:9000".into()),
        }
    }

    #[test]
    fn identical_orders_hash_identically() {
        let order = sample_order();
        let other = order.clone();
        assert_eq!(order.hash().unwrap(), other.hash().unwrap());
    }

    #[test]
    fn differing_orders_hash_differently() {
        let a = sample_order();
        let mut b = a.clone();
        b.file_size = 2048;
        assert_ne!(a.hash().unwrap(), b.hash().unwrap());
    }

    #[test]
    fn file_uri_zero_is_sentinel() {
        assert!(FileURI::zero().is_zero());
        assert!(!OrderHash([1u8; 32]).is_zero());
    }

    #[test]
    fn handshake_echo_carries_no_keys() {
        let order = sample_order();
        let handshake = StorageHandshake {
            time: 1001,
            order_hash: order.hash().unwrap(),
            proposal_hash: ProposalHash::zero(),
            port: 9000,
            keys: None,
        };
        assert!(handshake.keys.is_none());
    }
}
