//! Merkle tree over fixed-size ciphertext blocks, using BLAKE3 leaf and
//! interior hashing and a duplicate-last policy for odd-width layers: an
//! unpaired final node at layer k is hashed with itself to produce its
//! layer k+1 parent (e.g. three leaves `[L1, L2, L3]` produce layer 1 =
//! `[H(L1‖L2), H(L3‖L3)]`).

use std::fs::File;
use std::io::{Read, Write as _};
use std::path::Path;

use crate::error::{StorageError, StorageResult};

/// A 32-byte BLAKE3 digest, used for every node in the tree.
pub type MerkleHash = [u8; 32];

fn hash_leaf(block: &[u8]) -> MerkleHash {
    *blake3::hash(block).as_bytes()
}

fn hash_pair(left: &MerkleHash, right: &MerkleHash) -> MerkleHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(left);
    hasher.update(right);
    *hasher.finalize().as_bytes()
}

/// Fold one layer of hashes into the next, duplicating the final node when
/// the layer has odd width.
fn fold_layer(layer: &[MerkleHash]) -> Vec<MerkleHash> {
    let mut next = Vec::with_capacity(layer.len().div_ceil(2));
    let mut iter = layer.chunks(2);
    while let Some(pair) = iter.next() {
        if pair.len() == 2 {
            next.push(hash_pair(&pair[0], &pair[1]));
        } else {
            next.push(hash_pair(&pair[0], &pair[0]));
        }
    }
    next
}

fn read_leaves(source: &Path, block_size: usize) -> StorageResult<Vec<MerkleHash>> {
    let mut file = File::open(source)?;
    let mut leaves = Vec::new();
    let mut buf = vec![0u8; block_size];

    loop {
        let mut filled = 0usize;
        while filled < block_size {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        leaves.push(hash_leaf(&buf[..filled]));
        if filled < block_size {
            break;
        }
    }

    if leaves.is_empty() {
        return Err(StorageError::Generic(
            "cannot construct a merkle tree over an empty file".to_string(),
        ));
    }
    Ok(leaves)
}

/// Compute the Merkle root over `source`'s content, read in `block_size`
/// chunks (the last block may be short; it is hashed as-is, unpadded).
/// Returns `StorageError::Generic` if the file is empty.
pub fn merkle_root(source: &Path, block_size: usize) -> StorageResult<MerkleHash> {
    let mut layer = read_leaves(source, block_size)?;
    while layer.len() > 1 {
        layer = fold_layer(&layer);
    }
    Ok(layer[0])
}

/// Construct the Merkle tree over `source`'s content and write every layer,
/// leaves first, to `sidecar` as concatenated 32-byte hashes, one layer after
/// another (layer boundaries are implicit: each layer is exactly half the
/// node count of the one before, rounding up). Returns the single node of
/// the top layer. Mirrors the original's
/// `ConstructMerkleTree(sourcePath, sidecarPath)` signature, which persists
/// the tree alongside the replica purely to bound memory, callers MUST
/// delete the sidecar once they're done comparing roots (§4.3).
pub fn construct_merkle_tree(
    source: &Path,
    sidecar: &Path,
    block_size: usize,
) -> StorageResult<MerkleHash> {
    let mut layer = read_leaves(source, block_size)?;
    let mut out = File::create(sidecar)?;

    loop {
        for node in &layer {
            out.write_all(node)?;
        }
        if layer.len() == 1 {
            break;
        }
        layer = fold_layer(&layer);
    }

    Ok(layer[0])
}
