//! Disk-backed byte allocator used for both the permanent replica store and
//! the scratch area for in-flight replicas and Merkle-tree sidecar files.
//!
//! A `StorageHeap` owns a set of capacity-bounded `StorageChunk`s (plain
//! directories). Allocating a file picks the first chunk with enough free
//! space remaining and reserves a fixed-size file inside it, named after the
//! `FileURI` that addresses it.
//!
//! Chunk selection, usage accounting, and the allocation table all live
//! behind one `Mutex<HeapState>` (§5: "StorageHeap allocations must be
//! serialized per heap; AllocateFile and FreeFile are mutually exclusive"),
//! so a capacity check and its reservation can never interleave with another
//! thread's.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{StorageError, StorageResult};
use crate::logging::log_heap_operation;
use crate::types::{DecryptionKeys, FileURI};

/// A single capacity-bounded storage directory. Usage accounting lives in
/// the heap's `HeapState`, not here, so it moves under the same lock as the
/// allocation table.
#[derive(Debug, Clone)]
pub struct StorageChunk {
    pub path: PathBuf,
    pub capacity: u64,
}

/// A handle to a file allocated inside a `StorageHeap`.
#[derive(Debug, Clone)]
pub struct AllocatedFile {
    pub uri: FileURI,
    pub fullpath: PathBuf,
    pub size: u64,
    pub chunk_index: usize,
}

/// Sentinel-URI allocations (`FileURI::zero()`, used for Merkle scratch files)
/// need a surrogate key since multiple such allocations can be live at once.
fn surrogate_name(uri: &FileURI, surrogate: u64) -> String {
    if uri.is_zero() {
        format!("scratch-{:016x}", surrogate)
    } else {
        uri.to_hex()
    }
}

/// Everything that must change together under one lock: bytes used per
/// chunk and the uri-hex (or scratch surrogate name) -> allocation table.
struct HeapState {
    used: Vec<u64>,
    allocations: HashMap<String, AllocatedFile>,
    next_surrogate: u64,
}

pub struct StorageHeap {
    chunks: Vec<StorageChunk>,
    state: Mutex<HeapState>,
}

impl StorageHeap {
    /// Create a heap rooted at `data_dir` with one chunk of `default_capacity`
    /// bytes, creating the directory if it doesn't exist. Mirrors the
    /// original's `InitStorages` default single-chunk layout. Any allocation
    /// files left over from a prior run are rehydrated into the allocation
    /// table (§6), so lookups like `DecryptReplica` keep working across a
    /// restart.
    pub fn init(data_dir: &Path, default_capacity: u64) -> StorageResult<Self> {
        fs::create_dir_all(data_dir)?;
        let mut heap = Self {
            chunks: vec![StorageChunk {
                path: data_dir.to_path_buf(),
                capacity: default_capacity,
            }],
            state: Mutex::new(HeapState {
                used: vec![0],
                allocations: HashMap::new(),
                next_surrogate: 0,
            }),
        };
        heap.rehydrate_chunk(0)?;
        Ok(heap)
    }

    /// Register an additional chunk rooted at `path`, creating the directory
    /// if it doesn't exist. `InitStorages` uses this (via `init`) for the
    /// heap's first chunk; callers may add more to grow capacity without
    /// disturbing existing allocations. Rehydrates any files already present
    /// at `path`, same as `init` does for the first chunk.
    pub fn add_chunk(&mut self, path: PathBuf, capacity: u64) -> StorageResult<()> {
        fs::create_dir_all(&path)?;
        let index = self.chunks.len();
        self.chunks.push(StorageChunk { path, capacity });
        self.state
            .lock()
            .expect("heap state mutex poisoned")
            .used
            .push(0);
        self.rehydrate_chunk(index)?;
        Ok(())
    }

    /// Scan chunk `index`'s directory and fold any replica files found back
    /// into the allocation table and usage counter. `.keys.json` sidecars
    /// are skipped, they're resolved from the replica's own entry, not
    /// tracked as their own allocation. Leftover `scratch-*` files (a
    /// sentinel-URI allocation interrupted by a crash) aren't addressable by
    /// URI and can't be resumed meaningfully, so they're deleted instead of
    /// rehydrated.
    fn rehydrate_chunk(&mut self, index: usize) -> StorageResult<()> {
        let path = self.chunks[index].path.clone();
        let mut state = self.state.lock().expect("heap state mutex poisoned");

        for entry in fs::read_dir(&path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".keys.json") {
                continue;
            }
            if name.starts_with("scratch-") {
                fs::remove_file(entry.path()).ok();
                continue;
            }
            let Some(uri) = FileURI::from_hex(&name) else {
                log_heap_operation("rehydrate", &name, "skipping unrecognized file name");
                continue;
            };
            let size = entry.metadata()?.len();

            state.used[index] += size;
            state.allocations.insert(
                name,
                AllocatedFile {
                    uri,
                    fullpath: entry.path(),
                    size,
                    chunk_index: index,
                },
            );
        }
        log_heap_operation(
            "rehydrate",
            &path.display().to_string(),
            &format!("{} bytes in use", state.used[index]),
        );
        Ok(())
    }

    fn free_locked(&self, state: &HeapState, chunk_index: usize) -> u64 {
        self.chunks[chunk_index].capacity.saturating_sub(state.used[chunk_index])
    }

    /// The largest allocation this heap could currently satisfy, i.e. the
    /// free space of its roomiest chunk. Used by the `handshake` handler's
    /// admission check (`MaxAllocateSize() > requested`).
    pub fn max_allocate_size(&self) -> u64 {
        let state = self.state.lock().expect("heap state mutex poisoned");
        (0..self.chunks.len())
            .map(|i| self.free_locked(&state, i))
            .max()
            .unwrap_or(0)
    }

    /// Reserve `size` bytes for `uri`, creating a zero-filled backing file in
    /// the first chunk with enough room. The capacity check, the chunk
    /// selection, and the usage reservation all happen under one lock (§5),
    /// so two concurrent calls can never both pass the check against the
    /// same free space before either reserves it.
    pub fn allocate_file(&self, uri: FileURI, size: u64) -> StorageResult<AllocatedFile> {
        let mut state = self.state.lock().expect("heap state mutex poisoned");

        let chunk_index = (0..self.chunks.len())
            .find(|&i| self.free_locked(&state, i) >= size)
            .ok_or_else(|| StorageError::NoSpace(format!("need {} bytes", size)))?;

        let surrogate = state.next_surrogate;
        state.next_surrogate += 1;
        let name = surrogate_name(&uri, surrogate);
        let fullpath = self.chunks[chunk_index].path.join(&name);

        let file = File::create(&fullpath)?;
        file.set_len(size)?;

        state.used[chunk_index] += size;

        let allocated = AllocatedFile {
            uri,
            fullpath,
            size,
            chunk_index,
        };
        state.allocations.insert(name, allocated.clone());

        log_heap_operation("allocate", &uri.to_hex(), &format!("{} bytes", size));
        Ok(allocated)
    }

    /// Release the allocation for `uri` and remove its backing file. No-op
    /// (after logging) if `uri` wasn't allocated under this heap, since
    /// callers may legitimately race a free against an already-cleared entry.
    ///
    /// For the sentinel `FileURI::zero()` this releases an arbitrary
    /// surviving zero-URI allocation, since the URI alone can't disambiguate
    /// between several concurrent scratch files. Callers juggling more than
    /// one scratch allocation at a time (as `StorageController` does for
    /// send-side ciphertext staging and receive-side validation) MUST use
    /// `free_allocated` instead, keyed by the exact handle `allocate_file`
    /// returned.
    pub fn free_file(&self, uri: FileURI) -> StorageResult<()> {
        let key = {
            let state = self.state.lock().expect("heap state mutex poisoned");
            state.allocations.iter().find(|(_, a)| a.uri == uri).map(|(k, _)| k.clone())
        };

        let Some(key) = key else {
            log_heap_operation("free", &uri.to_hex(), "not allocated, skipping");
            return Ok(());
        };

        self.free_by_key(&key)
    }

    /// Release exactly the allocation described by `allocated` (the handle
    /// `allocate_file` returned), disambiguated by its backing path rather
    /// than by URI. This is the only safe way to free a sentinel-URI
    /// (`FileURI::zero()`) scratch allocation when more than one is live at
    /// once (§4.1).
    pub fn free_allocated(&self, allocated: &AllocatedFile) -> StorageResult<()> {
        let key = allocated
            .fullpath
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.free_by_key(&key)
    }

    /// Removes the allocation table entry and decrements its chunk's usage
    /// under one lock acquisition (§5), then deletes the backing file and
    /// sidecar on disk outside the lock.
    fn free_by_key(&self, key: &str) -> StorageResult<()> {
        let allocated = {
            let mut state = self.state.lock().expect("heap state mutex poisoned");
            let Some(allocated) = state.allocations.remove(key) else {
                log_heap_operation("free", key, "not allocated, skipping");
                return Ok(());
            };
            state.used[allocated.chunk_index] = state.used[allocated.chunk_index].saturating_sub(allocated.size);
            allocated
        };

        if allocated.fullpath.exists() {
            fs::remove_file(&allocated.fullpath)?;
        }
        let sidecar = keys_sidecar_path(&allocated.fullpath);
        if sidecar.exists() {
            fs::remove_file(&sidecar)?;
        }

        log_heap_operation("free", &allocated.uri.to_hex(), "released");
        Ok(())
    }

    /// Look up a previously allocated file by its `FileURI`. Fails for
    /// sentinel-URI (scratch) allocations, which aren't addressable by URI.
    pub fn get_file(&self, uri: FileURI) -> StorageResult<AllocatedFile> {
        if uri.is_zero() {
            return Err(StorageError::UnknownUri(
                "zero URI is not individually addressable".to_string(),
            ));
        }
        self.state
            .lock()
            .expect("heap state mutex poisoned")
            .allocations
            .get(&uri.to_hex())
            .cloned()
            .ok_or_else(|| StorageError::UnknownUri(uri.to_hex()))
    }

    /// Persist decryption keys as a JSON sidecar next to the replica file, so
    /// `DecryptReplica` works across process restarts without a database.
    pub fn set_decryption_keys(&self, uri: FileURI, keys: &DecryptionKeys) -> StorageResult<()> {
        let allocated = self.get_file(uri)?;
        let sidecar = keys_sidecar_path(&allocated.fullpath);
        let json = serde_json::to_vec_pretty(keys)?;
        let mut f = OpenOptions::new().create(true).write(true).truncate(true).open(sidecar)?;
        f.write_all(&json)?;
        Ok(())
    }

    /// Load a replica's decryption keys from its JSON sidecar.
    pub fn get_decryption_keys(&self, uri: FileURI) -> StorageResult<DecryptionKeys> {
        let allocated = self.get_file(uri)?;
        let sidecar = keys_sidecar_path(&allocated.fullpath);
        let json = fs::read(sidecar)?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Snapshot of every chunk currently managed by this heap.
    pub fn chunks(&self) -> &[StorageChunk] {
        &self.chunks
    }

    /// Relocate a chunk's backing directory, e.g. onto a larger disk. Usage
    /// accounting is untouched; both the chunk's own path and the `fullpath`
    /// of every live `AllocatedFile` that lived in it are rewritten under
    /// the same lock, so later lookups don't resolve to a file that no
    /// longer exists.
    pub fn move_chunk(&mut self, chunk_index: usize, new_path: PathBuf) -> StorageResult<()> {
        if chunk_index >= self.chunks.len() {
            return Err(StorageError::Generic(format!("no chunk at index {}", chunk_index)));
        }
        fs::create_dir_all(&new_path)?;
        let old_path = self.chunks[chunk_index].path.clone();
        for entry in fs::read_dir(&old_path)? {
            let entry = entry?;
            let dest = new_path.join(entry.file_name());
            fs::rename(entry.path(), dest)?;
        }
        self.chunks[chunk_index].path = new_path.clone();

        let mut state = self.state.lock().expect("heap state mutex poisoned");
        for allocated in state.allocations.values_mut() {
            if allocated.chunk_index == chunk_index {
                if let Some(name) = allocated.fullpath.file_name() {
                    allocated.fullpath = new_path.join(name);
                }
            }
        }
        Ok(())
    }
}

fn keys_sidecar_path(fullpath: &Path) -> PathBuf {
    let mut name = fullpath
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    name.push_str(".keys.json");
    fullpath.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn uri(byte: u8) -> FileURI {
        FileURI([byte; 32])
    }

    #[test]
    fn allocates_and_frees_within_capacity() {
        let dir = TempDir::new().unwrap();
        let heap = StorageHeap::init(dir.path(), 1024).unwrap();

        let file = heap.allocate_file(uri(1), 512).unwrap();
        assert_eq!(file.size, 512);
        assert!(file.fullpath.exists());
        assert_eq!(heap.max_allocate_size(), 512);

        heap.free_file(uri(1)).unwrap();
        assert_eq!(heap.max_allocate_size(), 1024);
        assert!(!file.fullpath.exists());
    }

    #[test]
    fn rejects_allocation_over_capacity() {
        let dir = TempDir::new().unwrap();
        let heap = StorageHeap::init(dir.path(), 100).unwrap();
        let result = heap.allocate_file(uri(2), 200);
        assert!(matches!(result, Err(StorageError::NoSpace(_))));
    }

    #[test]
    fn second_allocation_cannot_overrun_capacity_left_by_first() {
        let dir = TempDir::new().unwrap();
        let heap = StorageHeap::init(dir.path(), 100).unwrap();
        heap.allocate_file(uri(1), 60).unwrap();
        let result = heap.allocate_file(uri(2), 60);
        assert!(matches!(result, Err(StorageError::NoSpace(_))));
        assert_eq!(heap.max_allocate_size(), 40);
    }

    #[test]
    fn zero_uri_allocations_are_disambiguated() {
        let dir = TempDir::new().unwrap();
        let heap = StorageHeap::init(dir.path(), 10_000).unwrap();

        let a = heap.allocate_file(FileURI::zero(), 16).unwrap();
        let b = heap.allocate_file(FileURI::zero(), 16).unwrap();
        assert_ne!(a.fullpath, b.fullpath);
    }

    #[test]
    fn decryption_keys_round_trip_through_sidecar() {
        let dir = TempDir::new().unwrap();
        let heap = StorageHeap::init(dir.path(), 10_000).unwrap();
        heap.allocate_file(uri(3), 64).unwrap();

        let keys = DecryptionKeys {
            modulus: vec![4, 5, 6],
            public_exponent: vec![1, 2, 3],
            aes_key: [0u8; 32],
        };
        heap.set_decryption_keys(uri(3), &keys).unwrap();
        let loaded = heap.get_decryption_keys(uri(3)).unwrap();
        assert_eq!(loaded.modulus, vec![4, 5, 6]);
        assert_eq!(loaded.public_exponent, vec![1, 2, 3]);
    }

    #[test]
    fn unknown_uri_lookup_fails() {
        let dir = TempDir::new().unwrap();
        let heap = StorageHeap::init(dir.path(), 1024).unwrap();
        assert!(matches!(heap.get_file(uri(9)), Err(StorageError::UnknownUri(_))));
    }

    #[test]
    fn restart_rehydrates_allocations_from_disk() {
        let dir = TempDir::new().unwrap();
        let fullpath;
        {
            let heap = StorageHeap::init(dir.path(), 1024).unwrap();
            let file = heap.allocate_file(uri(5), 200).unwrap();
            fullpath = file.fullpath.clone();
            let keys = DecryptionKeys {
                modulus: vec![9, 9, 9],
                public_exponent: vec![3],
                aes_key: [1u8; 32],
            };
            heap.set_decryption_keys(uri(5), &keys).unwrap();
        }
        assert!(fullpath.exists());

        let heap = StorageHeap::init(dir.path(), 1024).unwrap();
        let rehydrated = heap.get_file(uri(5)).unwrap();
        assert_eq!(rehydrated.fullpath, fullpath);
        assert_eq!(rehydrated.size, 200);
        assert_eq!(heap.max_allocate_size(), 1024 - 200);

        let keys = heap.get_decryption_keys(uri(5)).unwrap();
        assert_eq!(keys.modulus, vec![9, 9, 9]);

        let second = heap.allocate_file(uri(6), 500);
        assert!(second.is_ok());
    }

    #[test]
    fn restart_discards_leftover_scratch_files() {
        let dir = TempDir::new().unwrap();
        {
            let heap = StorageHeap::init(dir.path(), 1024).unwrap();
            heap.allocate_file(FileURI::zero(), 64).unwrap();
        }

        let heap = StorageHeap::init(dir.path(), 1024).unwrap();
        assert_eq!(heap.max_allocate_size(), 1024);
        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn move_chunk_updates_allocation_fullpaths() {
        let old_dir = TempDir::new().unwrap();
        let new_dir = TempDir::new().unwrap();
        let mut heap = StorageHeap::init(old_dir.path(), 1024).unwrap();
        heap.allocate_file(uri(7), 100).unwrap();

        let new_path = new_dir.path().join("moved");
        heap.move_chunk(0, new_path.clone()).unwrap();

        let moved = heap.get_file(uri(7)).unwrap();
        assert_eq!(moved.fullpath, new_path.join(uri(7).to_hex()));
        assert!(moved.fullpath.exists());

        heap.free_file(uri(7)).unwrap();
        assert!(!moved.fullpath.exists());
    }
}
