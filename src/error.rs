// ===================================================================================================
// Error Handling System - Comprehensive Error Types and Management
// ===================================================================================================
//
// This module defines the error handling system for the storage controller, providing
// structured error types that enable proper error categorization and effective debugging.
//
// ## ERROR CATEGORIES
//
// ### Protocol-Level Errors
// - UnknownOrder: a message referenced an order hash we have no Announcement for
// - PeerUnreachable: dialing or sending to a peer failed
// - HandshakeTimeout: the keeper never echoed a `request-replica` in time
// - Canceled: a cooperative cancellation token fired mid-operation
//
// ### Storage Errors
// - NoSpace: no chunk has enough free bytes for the requested allocation
// - UnknownUri: `FreeFile`/`GetFile`/`SetDecryptionKeys` referenced an unallocated URI
// - BadReplicaSize: a received replica's on-disk size didn't match `ciphertextSize(order.fileSize)`
// - MerkleMismatch: a received replica's recomputed Merkle root didn't match the wire root
//
// ### Cryptographic Errors
// - CryptoFailure: key generation or modular exponentiation failed
// - ShortRead: fewer bytes were available than the codec's block framing expected
// - BadCiphertextSize: a ciphertext file's length wasn't a multiple of the block size
//
// ### System-Level Errors
// - Io: file system operation failures
// - Config: configuration load/parse/validation failures
// - Serialization / Deserialization: (de)serializing wire or on-disk structures
// - Generic: catch-all
//
// ===================================================================================================

use std::error::Error as StdError;
use std::fmt;

/// Error type for the storage controller subsystem.
///
/// Each variant wraps a descriptive message rather than structured fields, matching
/// this crate's convention of favoring precise variants with human-readable context
/// over deeply nested error structs.
#[derive(Debug)]
pub enum StorageError {
    // ===== PROTOCOL-LEVEL ERRORS =====
    /// A message referenced an order hash with no matching `Announcement`.
    UnknownOrder(String),
    /// Dialing or sending to a peer failed.
    PeerUnreachable(String),
    /// `AcceptProposal` never observed a `request-replica` echo in time.
    HandshakeTimeout(String),
    /// A cooperative cancellation token fired mid-operation.
    Canceled(String),

    // ===== STORAGE ERRORS =====
    /// No chunk has enough free bytes for the requested allocation.
    NoSpace(String),
    /// `FreeFile`/`GetFile`/`SetDecryptionKeys` referenced an unallocated URI.
    UnknownUri(String),
    /// A received replica's on-disk size didn't match the expected ciphertext size.
    BadReplicaSize(String),
    /// A received replica's recomputed Merkle root didn't match the wire root.
    MerkleMismatch(String),

    // ===== CRYPTOGRAPHIC ERRORS =====
    /// RSA key generation or modular exponentiation failed.
    CryptoFailure(String),
    /// Fewer bytes were available than the codec's block framing expected.
    ShortRead(String),
    /// A ciphertext file's length wasn't a multiple of the block size.
    BadCiphertextSize(String),

    // ===== SYSTEM-LEVEL ERRORS =====
    /// File system I/O operation failures.
    Io(String),
    /// Configuration load/parse/validation failures.
    Config(String),
    /// Data serialization failures.
    Serialization(String),
    /// Data deserialization failures.
    Deserialization(String),
    /// Generic catch-all error type.
    Generic(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::UnknownOrder(e) => write!(f, "unknown order: {}", e),
            StorageError::PeerUnreachable(e) => write!(f, "peer unreachable: {}", e),
            StorageError::HandshakeTimeout(e) => write!(f, "handshake timeout: {}", e),
            StorageError::Canceled(e) => write!(f, "canceled: {}", e),
            StorageError::NoSpace(e) => write!(f, "no space: {}", e),
            StorageError::UnknownUri(e) => write!(f, "unknown uri: {}", e),
            StorageError::BadReplicaSize(e) => write!(f, "bad replica size: {}", e),
            StorageError::MerkleMismatch(e) => write!(f, "merkle mismatch: {}", e),
            StorageError::CryptoFailure(e) => write!(f, "crypto failure: {}", e),
            StorageError::ShortRead(e) => write!(f, "short read: {}", e),
            StorageError::BadCiphertextSize(e) => write!(f, "bad ciphertext size: {}", e),
            StorageError::Io(e) => write!(f, "IO error: {}", e),
            StorageError::Config(e) => write!(f, "configuration error: {}", e),
            StorageError::Serialization(e) => write!(f, "serialization error: {}", e),
            StorageError::Deserialization(e) => write!(f, "deserialization error: {}", e),
            StorageError::Generic(e) => write!(f, "error: {}", e),
        }
    }
}

impl StdError for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(error: std::io::Error) -> Self {
        StorageError::Io(error.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(error: serde_json::Error) -> Self {
        StorageError::Serialization(error.to_string())
    }
}

impl From<bincode::Error> for StorageError {
    fn from(error: bincode::Error) -> Self {
        StorageError::Serialization(error.to_string())
    }
}

impl From<toml::de::Error> for StorageError {
    fn from(error: toml::de::Error) -> Self {
        StorageError::Config(error.to_string())
    }
}

impl From<toml::ser::Error> for StorageError {
    fn from(error: toml::ser::Error) -> Self {
        StorageError::Config(error.to_string())
    }
}

/// Result type alias for storage controller operations.
pub type StorageResult<T> = Result<T, StorageError>;
