//! Wire binding between a ciphertext file on disk and the `send-file`
//! message (§4.5): `{order_hash, merkle_root}` followed by the ciphertext
//! itself, streamed in fixed-size chunks rather than buffered whole.
//!
//! §9's cyclic-reference note flags the original's reliance on a process-
//! wide controller singleton to learn the expected ciphertext length on the
//! receive side. This binding instead takes `ciphertext_len` explicitly at
//! construction, the sender knows it from the order it just encrypted for,
//! and the receiver computes it from its own `Announcements` lookup before
//! ever calling `read_into`.

use std::io::{Read, Write as _};
use std::path::{Path, PathBuf};

use crate::error::StorageResult;
use crate::merkle::MerkleHash;
use crate::types::OrderHash;

/// Default chunk size used when streaming a replica to or from the wire.
pub const BUFFER: usize = 4096;

/// A replica ready to be pushed as one `send-file` message, or the shape the
/// receiver fills in as it reads one off the wire.
pub struct ReplicaStream {
    pub order_hash: OrderHash,
    pub merkle_root: MerkleHash,
    /// The ciphertext file this stream reads from (sender) or writes to
    /// (receiver).
    pub file_path: PathBuf,
    /// Exact ciphertext length. On the sender side this is the file's
    /// actual size; on the receiver side it's computed from the
    /// `Announcement` for `order_hash` (§4.5: "length is not self-delimited
    /// on the wire").
    pub ciphertext_len: u64,
}

impl ReplicaStream {
    pub fn new(order_hash: OrderHash, merkle_root: MerkleHash, file_path: PathBuf, ciphertext_len: u64) -> Self {
        Self {
            order_hash,
            merkle_root,
            file_path,
            ciphertext_len,
        }
    }

    /// Read the bound file's content as one contiguous buffer, for
    /// transports (like `ChannelPeerNetwork`) that carry the whole payload
    /// in a single in-memory message instead of a byte-oriented stream.
    pub fn read_payload(&self) -> StorageResult<Vec<u8>> {
        let mut file = std::fs::File::open(&self.file_path)?;
        let mut buf = Vec::with_capacity(self.ciphertext_len as usize);
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Stream the bound file's content to `writer` in `BUFFER`-sized chunks,
    /// stopping once exactly `ciphertext_len` bytes have been written. This
    /// is the byte-oriented counterpart to `read_payload`, for transports
    /// that frame messages as a header plus a raw byte stream (§4.5).
    pub fn write_to<W: std::io::Write>(&self, writer: &mut W) -> StorageResult<()> {
        let mut file = std::fs::File::open(&self.file_path)?;
        let mut remaining = self.ciphertext_len as usize;
        let mut buf = vec![0u8; BUFFER];

        while remaining > 0 {
            let want = remaining.min(BUFFER);
            let n = file.read(&mut buf[..want])?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n])?;
            remaining -= n;
        }
        Ok(())
    }

    /// Consume exactly `ciphertext_len` bytes from `reader` into a fresh
    /// file at `dest`, returning the populated stream. The receiver MUST
    /// already know `ciphertext_len` from a prior `Announcement` for
    /// `order_hash`, messages for an unknown order are rejected before this
    /// is ever called (enforced by the controller, not this type).
    pub fn read_into<R: Read>(
        order_hash: OrderHash,
        merkle_root: MerkleHash,
        reader: &mut R,
        dest: &Path,
        ciphertext_len: u64,
    ) -> StorageResult<Self> {
        let mut out = std::fs::File::create(dest)?;
        let mut remaining = ciphertext_len as usize;
        let mut buf = vec![0u8; BUFFER];

        while remaining > 0 {
            let want = remaining.min(BUFFER);
            let n = reader.read(&mut buf[..want])?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
            remaining -= n;
        }

        Ok(Self {
            order_hash,
            merkle_root,
            file_path: dest.to_path_buf(),
            ciphertext_len,
        })
    }
}
