//! `StorageController`: the announce → proposal → handshake → send → verify
//! state machine (§4.6), its background worker, and the shared bookkeeping
//! maps that both the worker and inbound message handlers touch (§5).
//!
//! Message handlers are infallible from the transport's point of view
//! (§7): every branch of `handle_message` logs and drops on error rather
//! than propagating. The client-side accept pipeline (`accept_proposal`,
//! `find_replica_keepers`) is the one place that surfaces success/failure to
//! its caller, as booleans.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::config::Config;
use crate::error::{StorageError, StorageResult};
use crate::heap::StorageHeap;
use crate::logging::{log_error_with_context, log_protocol_event, log_replica_operation};
use crate::merkle;
use crate::peer_network::{PeerNetwork, WireMessage};
use crate::proposals_agent::ProposalsAgent;
use crate::replica_stream::ReplicaStream;
use crate::resilience::{poll_until_cancelable, retry_async, RetryConfig};
use crate::types::{FileURI, OrderHash, PeerAddress, StorageHandshake, StorageOrder, StorageProposal};

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

const ANNOUNCEMENTS_FILE: &str = "announcements.json";

/// Write the full announcement table to `path` as a JSON array, via a
/// temp-file-then-rename so a crash mid-write can't leave a half-written
/// file behind. Called with the `announcements` mutex already held.
fn persist_announcements(path: &Path, announcements: &HashMap<OrderHash, StorageOrder>) -> StorageResult<()> {
    let orders: Vec<&StorageOrder> = announcements.values().collect();
    let json = serde_json::to_vec_pretty(&orders)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Reload the announcement table from `path` if it exists, so `decrypt_replica`
/// and the rest of the order-resolution surface keep working across a
/// process restart (§6's "Keys are persisted alongside... so that
/// `DecryptReplica` works after a restart" extends to resolving the order
/// itself, not just the replica file and its key sidecar).
fn load_announcements(path: &Path) -> StorageResult<HashMap<OrderHash, StorageOrder>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let bytes = std::fs::read(path)?;
    let orders: Vec<StorageOrder> = serde_json::from_slice(&bytes)?;
    orders
        .into_iter()
        .map(|order| order.hash().map(|hash| (hash, order)))
        .collect()
}

/// The control plane described in §4.6, parameterized over whichever
/// `PeerNetwork` the embedder wires in.
pub struct StorageController {
    config: Config,
    network: Arc<dyn PeerNetwork>,
    heap: StorageHeap,
    temp_heap: StorageHeap,
    announcements_path: PathBuf,
    announcements: Mutex<HashMap<OrderHash, StorageOrder>>,
    local_files: Mutex<HashMap<OrderHash, PathBuf>>,
    received_handshakes: Mutex<HashMap<OrderHash, StorageHandshake>>,
    proposals: Mutex<ProposalsAgent>,
    last_address_refresh: Mutex<Option<std::time::Instant>>,
    cancel: CancellationToken,
}

impl StorageController {
    /// `InitStorages(dataDir, tempDataDir)`: creates both directories if
    /// missing and gives each heap one chunk of the configured default
    /// capacity.
    pub fn init_storages(
        config: Config,
        network: Arc<dyn PeerNetwork>,
        data_dir: &Path,
        temp_data_dir: &Path,
    ) -> StorageResult<Self> {
        let capacity = config.storage.default_chunk_capacity;
        let heap = StorageHeap::init(data_dir, capacity)?;
        let temp_heap = StorageHeap::init(temp_data_dir, capacity)?;
        let announcements_path = data_dir.join(ANNOUNCEMENTS_FILE);
        let announcements = load_announcements(&announcements_path)?;

        Ok(Self {
            config,
            network,
            heap,
            temp_heap,
            announcements_path,
            announcements: Mutex::new(announcements),
            local_files: Mutex::new(HashMap::new()),
            received_handshakes: Mutex::new(HashMap::new()),
            proposals: Mutex::new(ProposalsAgent::new()),
            last_address_refresh: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // ===== §6 public API: announcements =====

    /// `AnnounceOrder(order)`: broadcast, without keeping a local plaintext
    /// binding (a keeper announcing on behalf of a re-gossip, or a client
    /// that wants to track an order without offering to source it).
    pub async fn announce_order(&self, order: StorageOrder) -> StorageResult<OrderHash> {
        let hash = order.hash()?;
        {
            let mut announcements = self.announcements.lock().await;
            announcements.insert(hash, order.clone());
            if let Err(e) = persist_announcements(&self.announcements_path, &announcements) {
                log_error_with_context("persist_announcements", &e);
            }
        }
        self.network.broadcast_announce(&order).await?;
        log_protocol_event("announce", &hash.to_hex(), "broadcast (no local source)");
        Ok(hash)
    }

    /// `AnnounceOrder(order, localPath)`: the client-side variant, records
    /// the plaintext source path so this node can later source replicas for
    /// its own order, and starts listening for proposals.
    pub async fn announce_order_with_source(
        &self,
        order: StorageOrder,
        local_path: PathBuf,
    ) -> StorageResult<OrderHash> {
        let hash = order.hash()?;
        {
            let mut announcements = self.announcements.lock().await;
            announcements.insert(hash, order.clone());
            if let Err(e) = persist_announcements(&self.announcements_path, &announcements) {
                log_error_with_context("persist_announcements", &e);
            }
        }
        self.local_files.lock().await.insert(hash, local_path);
        self.proposals.lock().await.listen_proposal(hash);
        self.network.broadcast_announce(&order).await?;
        log_protocol_event("announce", &hash.to_hex(), "broadcast with local source");
        Ok(hash)
    }

    /// `CancelOrder(hash)`: returns `false` if the order was unknown.
    pub async fn cancel_order(&self, hash: OrderHash) -> bool {
        let removed = {
            let mut announcements = self.announcements.lock().await;
            let removed = announcements.remove(&hash).is_some();
            if removed {
                if let Err(e) = persist_announcements(&self.announcements_path, &announcements) {
                    log_error_with_context("persist_announcements", &e);
                }
            }
            removed
        };
        if !removed {
            return false;
        }
        self.local_files.lock().await.remove(&hash);
        self.proposals.lock().await.erase_orders_proposals(hash);
        log_protocol_event("cancel", &hash.to_hex(), "order canceled");
        true
    }

    pub async fn get_announcements(&self) -> Vec<StorageOrder> {
        self.announcements.lock().await.values().cloned().collect()
    }

    pub async fn get_announce(&self, hash: OrderHash) -> Option<StorageOrder> {
        self.announcements.lock().await.get(&hash).cloned()
    }

    pub async fn get_proposals(&self, order_hash: OrderHash) -> Vec<StorageProposal> {
        self.proposals.lock().await.get_proposals(order_hash)
    }

    pub async fn get_proposal(
        &self,
        order_hash: OrderHash,
        proposal_hash: crate::types::ProposalHash,
    ) -> Option<StorageProposal> {
        self.proposals.lock().await.get_proposal(order_hash, proposal_hash)
    }

    /// `ClearOldAnnouncments(threshold)`: removes every announcement with
    /// `time < threshold`, along with its listening/proposal/local-file state.
    pub async fn clear_old_announcements(&self, threshold: u64) {
        let stale: Vec<OrderHash> = {
            let announcements = self.announcements.lock().await;
            announcements
                .iter()
                .filter(|(_, order)| order.time < threshold)
                .map(|(hash, _)| *hash)
                .collect()
        };

        if stale.is_empty() {
            return;
        }

        let mut announcements = self.announcements.lock().await;
        let mut local_files = self.local_files.lock().await;
        let mut proposals = self.proposals.lock().await;
        for hash in stale {
            announcements.remove(&hash);
            local_files.remove(&hash);
            proposals.erase_orders_proposals(hash);
            log_protocol_event("reap", &hash.to_hex(), "announcement expired");
        }
        if let Err(e) = persist_announcements(&self.announcements_path, &announcements) {
            log_error_with_context("persist_announcements", &e);
        }
    }

    // ===== §6 public API: chunks =====

    pub fn chunk_count(&self, temp: bool) -> usize {
        if temp {
            self.temp_heap.chunks().len()
        } else {
            self.heap.chunks().len()
        }
    }

    pub fn move_chunk(&mut self, index: usize, new_path: PathBuf, temp: bool) -> StorageResult<()> {
        if temp {
            self.temp_heap.move_chunk(index, new_path)
        } else {
            self.heap.move_chunk(index, new_path)
        }
    }

    /// `DecryptReplica(orderHash, outputPath)`: read back a stored ciphertext
    /// and write the plaintext out, using the keys persisted alongside the
    /// replica. Logs and returns without writing a partial file on any error
    /// (§7).
    pub async fn decrypt_replica(&self, order_hash: OrderHash, output_path: &Path) -> StorageResult<()> {
        let result = self.decrypt_replica_inner(order_hash, output_path).await;
        if let Err(ref e) = result {
            log_error_with_context("decrypt_replica", e);
        }
        result
    }

    async fn decrypt_replica_inner(&self, order_hash: OrderHash, output_path: &Path) -> StorageResult<()> {
        let order = self
            .get_announce(order_hash)
            .await
            .ok_or_else(|| StorageError::UnknownOrder(order_hash.to_hex()))?;

        let allocated = self.heap.get_file(order.file_uri)?;
        let keys = self.heap.get_decryption_keys(order.file_uri)?;
        let ciphertext = std::fs::read(&allocated.fullpath)?;
        let plaintext = codec::decrypt_stream(&ciphertext, &keys, order.file_size)?;
        std::fs::write(output_path, &plaintext)?;
        Ok(())
    }

    // ===== §4.6 inbound message dispatch =====

    /// Route one inbound wire message. Infallible to the caller: every
    /// failure is logged and the message is dropped (§7).
    pub async fn handle_message(&self, from: Arc<dyn crate::peer_network::PeerHandle>, message: WireMessage) {
        let result = match message {
            WireMessage::Announce(order) => self.handle_announce(from, order).await,
            WireMessage::Proposal(proposal) => self.handle_proposal(from, proposal).await,
            WireMessage::Handshake(handshake) => self.handle_handshake(handshake).await,
            WireMessage::RequestReplica(handshake) => self.handle_request_replica(handshake).await,
            WireMessage::SendFile {
                order_hash,
                merkle_root,
                ciphertext,
            } => self.handle_send_file(order_hash, merkle_root, ciphertext).await,
            WireMessage::Ping => self.handle_ping(from).await,
            WireMessage::Pong(address) => self.handle_pong(address).await,
        };

        if let Err(e) = result {
            log_error_with_context("handle_message", &e);
        }
    }

    /// `announce` handler (§4.6 row 1). Unknown orders are recorded and
    /// re-gossiped; if we have room and the order's terms are acceptable to
    /// us as a keeper, we propose back, direct channel first, falling back
    /// to the inbound peer (§9 supplement).
    async fn handle_announce(
        &self,
        from: Arc<dyn crate::peer_network::PeerHandle>,
        order: StorageOrder,
    ) -> StorageResult<()> {
        let hash = order.hash()?;
        let already_known = {
            let mut announcements = self.announcements.lock().await;
            let already_known = announcements.contains_key(&hash);
            announcements.insert(hash, order.clone());
            if let Err(e) = persist_announcements(&self.announcements_path, &announcements) {
                log_error_with_context("persist_announcements", &e);
            }
            already_known
        };

        if !already_known {
            self.network.broadcast_announce(&order).await?;
        }

        let expected_ciphertext = codec::ciphertext_size(order.file_size, self.config.block_size());
        let have_room = self.heap.max_allocate_size() >= expected_ciphertext
            && self.temp_heap.max_allocate_size() >= expected_ciphertext;

        if !have_room
            || order.max_rate < self.config.protocol.my_rate
            || order.max_gap < self.config.protocol.my_max_blocks_gap
        {
            return Ok(());
        }

        let proposal = StorageProposal {
            time: now_secs(),
            order_hash: hash,
            rate: self.config.protocol.my_rate,
            peer_address: PeerAddress(format!("127.0.0.1:{}", self.network.listen_port())),
        };

        let direct = self.network.connected_peer(&order.client_address).await;
        let handle = match direct {
            Some(peer) => peer,
            None => match self.network.dial(&order.client_address).await {
                Ok(peer) => peer,
                Err(_) => from,
            },
        };
        handle.send(WireMessage::Proposal(proposal)).await?;
        log_protocol_event("announce", &hash.to_hex(), "proposed as keeper");
        Ok(())
    }

    /// `proposal` handler (§4.6 row 2). Accepted only while listening and
    /// strictly under the order's `max_rate` (§9 note 4 pins the filter to
    /// `<`). If the order is known, the surplus-peer disconnect is checked
    /// independently of whether this particular proposal was accepted; an
    /// unknown order skips both checks entirely, matching
    /// `examples/original_source/src/lux/storagecontroller.cpp`'s
    /// `dfsproposal` branch, which nests the whole listening-check-and-
    /// disconnect block inside `if (order != nullptr)`.
    async fn handle_proposal(
        &self,
        from: Arc<dyn crate::peer_network::PeerHandle>,
        proposal: StorageProposal,
    ) -> StorageResult<()> {
        let order_hash = proposal.order_hash;
        let Some(order) = self.get_announce(order_hash).await else {
            return Ok(());
        };

        let is_listening = self.proposals.lock().await.is_listening(order_hash);
        if is_listening && order.max_rate > proposal.rate {
            self.proposals.lock().await.add_proposal(proposal.clone());
            log_protocol_event("proposal", &order_hash.to_hex(), "accepted into proposals agent");
        }

        if self.network.connected_peer_count().await > self.config.protocol.max_peers_before_shedding {
            from.disconnect().await;
        }
        Ok(())
    }

    /// `handshake` handler (§4.6 row 3), keeper side: if the order is known
    /// and both heaps have room, record the handshake and echo back a
    /// keyless `request-replica`.
    async fn handle_handshake(&self, handshake: StorageHandshake) -> StorageResult<()> {
        let order = self
            .get_announce(handshake.order_hash)
            .await
            .ok_or_else(|| StorageError::UnknownOrder(handshake.order_hash.to_hex()))?;

        let expected_ciphertext = codec::ciphertext_size(order.file_size, self.config.block_size());
        if self.heap.max_allocate_size() < expected_ciphertext
            || self.temp_heap.max_allocate_size() < expected_ciphertext
        {
            return Err(StorageError::NoSpace(format!(
                "order {} needs {} bytes",
                handshake.order_hash, expected_ciphertext
            )));
        }

        self.received_handshakes
            .lock()
            .await
            .insert(handshake.order_hash, handshake.clone());

        let echo = StorageHandshake {
            time: now_secs(),
            order_hash: handshake.order_hash,
            proposal_hash: handshake.proposal_hash,
            port: self.network.listen_port(),
            keys: None,
        };
        let peer = self.network.dial(&order.client_address).await?;
        peer.send(WireMessage::RequestReplica(echo)).await?;
        log_protocol_event("handshake", &handshake.order_hash.to_hex(), "recorded, echoed request-replica");
        Ok(())
    }

    /// `request-replica` handler (§4.6 row 4), client side: confirm we still
    /// hold the local plaintext, then record the echo to unblock
    /// `accept_proposal`'s poll.
    async fn handle_request_replica(&self, handshake: StorageHandshake) -> StorageResult<()> {
        if !self.local_files.lock().await.contains_key(&handshake.order_hash) {
            return Err(StorageError::UnknownOrder(format!(
                "no local source for order {}",
                handshake.order_hash
            )));
        }
        self.received_handshakes
            .lock()
            .await
            .insert(handshake.order_hash, handshake);
        Ok(())
    }

    /// `send-file` handler (§4.6 row 5), keeper side. Allocates a temp file,
    /// validates size and Merkle root, then promotes into the permanent
    /// heap with the keys learned from the earlier handshake, or cleans up
    /// and drops the message on any validation failure (§7, S5/S6).
    async fn handle_send_file(
        &self,
        order_hash: OrderHash,
        wire_root: merkle::MerkleHash,
        ciphertext: Vec<u8>,
    ) -> StorageResult<()> {
        let order = self
            .get_announce(order_hash)
            .await
            .ok_or_else(|| StorageError::UnknownOrder(order_hash.to_hex()))?;

        let block_size = self.config.block_size();
        let expected = codec::ciphertext_size(order.file_size, block_size);

        let temp_file = self.temp_heap.allocate_file(FileURI::zero(), ciphertext.len() as u64)?;
        std::fs::write(&temp_file.fullpath, &ciphertext)?;

        let cleanup = |heap: &StorageHeap| {
            if let Err(e) = heap.free_allocated(&temp_file) {
                log_error_with_context("send_file cleanup", &e);
            }
        };

        if ciphertext.len() as u64 != expected {
            cleanup(&self.temp_heap);
            log_replica_operation("rejected", &order_hash.to_hex(), "size mismatch");
            return Err(StorageError::BadReplicaSize(format!(
                "got {} bytes, expected {}",
                ciphertext.len(),
                expected
            )));
        }

        let recomputed = merkle::merkle_root(&temp_file.fullpath, block_size)?;
        if recomputed != wire_root {
            cleanup(&self.temp_heap);
            log_replica_operation("rejected", &order_hash.to_hex(), "merkle mismatch");
            return Err(StorageError::MerkleMismatch(order_hash.to_hex()));
        }

        let handshake = self
            .received_handshakes
            .lock()
            .await
            .get(&order_hash)
            .cloned()
            .ok_or_else(|| StorageError::UnknownOrder(format!("no handshake on file for {}", order_hash)))?;
        let keys = handshake
            .keys
            .ok_or_else(|| StorageError::CryptoFailure("stored handshake carried no keys".to_string()))?;

        let permanent = self.heap.allocate_file(order.file_uri, ciphertext.len() as u64)?;
        std::fs::rename(&temp_file.fullpath, &permanent.fullpath)?;
        self.temp_heap.free_allocated(&temp_file).ok();
        self.heap.set_decryption_keys(order.file_uri, &keys)?;

        log_replica_operation("stored", &order_hash.to_hex(), "validated and promoted to permanent heap");
        Ok(())
    }

    /// `ping`/`pong` handlers (§4.6 rows 6-7).
    async fn handle_ping(&self, from: Arc<dyn crate::peer_network::PeerHandle>) -> StorageResult<()> {
        from.send(WireMessage::Pong(from.remote_address())).await
    }

    async fn handle_pong(&self, mut address: PeerAddress) -> StorageResult<()> {
        // Set the port to our own listen port: the peer only observed our
        // connecting socket's ephemeral port, not the port we listen on.
        address.0 = reset_port(&address.0, self.network.listen_port());
        self.network.set_external_address(address).await;
        *self.last_address_refresh.lock().await = Some(std::time::Instant::now());
        Ok(())
    }

    // ===== §4.6 client-side accept pipeline =====

    /// `FindReplicaKeepers(order, k)`: sort proposals ascending by rate,
    /// accept one by one until `k` succeed. Returns the number accepted,
    /// which is never more than `k` even if every proposal would succeed
    /// (§8 invariant 8).
    pub async fn find_replica_keepers(&self, order_hash: OrderHash, k: usize) -> StorageResult<usize> {
        let order = self
            .get_announce(order_hash)
            .await
            .ok_or_else(|| StorageError::UnknownOrder(order_hash.to_hex()))?;

        let candidates = self.proposals.lock().await.sorted_proposals(order_hash);
        let mut accepted = 0usize;
        for proposal in candidates {
            if accepted >= k {
                break;
            }
            if self.accept_proposal(&order, &proposal).await {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    /// Accept a single proposal end-to-end (§4.6 "Accepting a proposal").
    /// Returns `false` on `HandshakeTimeout`, `PeerUnreachable`, or any
    /// downstream I/O failure, leaving no residue (§7).
    async fn accept_proposal(&self, order: &StorageOrder, proposal: &StorageProposal) -> bool {
        match self.accept_proposal_inner(order, proposal).await {
            Ok(()) => true,
            Err(e) => {
                log_error_with_context("accept_proposal", &e);
                false
            }
        }
    }

    async fn accept_proposal_inner(&self, order: &StorageOrder, proposal: &StorageProposal) -> StorageResult<()> {
        let order_hash = order.hash()?;
        let proposal_hash = proposal.hash()?;

        let keys = codec::generate_keys(self.config.crypto.rsa_bits)?;
        let decryption_keys = keys.decryption_keys();

        let handshake = StorageHandshake {
            time: now_secs(),
            order_hash,
            proposal_hash,
            port: self.network.listen_port(),
            keys: Some(decryption_keys),
        };

        let peer = self.start_handshake(&proposal.peer_address, handshake).await?;

        if let Err(e) = self.wait_for_request_replica(order_hash).await {
            peer.disconnect().await;
            return Err(e);
        }

        let local_path = self
            .local_files
            .lock()
            .await
            .get(&order_hash)
            .cloned()
            .ok_or_else(|| StorageError::UnknownOrder(format!("no local source for {}", order_hash)))?;

        let plaintext = std::fs::read(&local_path)?;
        let ciphertext = codec::encrypt_stream(&plaintext, &keys.aes_key, &keys.rsa_private)?;

        let temp = self.temp_heap.allocate_file(FileURI::zero(), ciphertext.len() as u64)?;
        std::fs::write(&temp.fullpath, &ciphertext)?;
        let sidecar = temp.fullpath.with_extension("merkle-sidecar");
        let root = merkle::construct_merkle_tree(&temp.fullpath, &sidecar, self.config.block_size())?;
        std::fs::remove_file(&sidecar).ok();

        let stream = ReplicaStream::new(order_hash, root, temp.fullpath.clone(), ciphertext.len() as u64);
        let keeper = self.network.dial(&proposal.peer_address).await?;
        keeper
            .send(WireMessage::SendFile {
                order_hash,
                merkle_root: root,
                ciphertext: stream.read_payload()?,
            })
            .await?;

        self.temp_heap.free_allocated(&temp).ok();
        log_replica_operation("sent", &order_hash.to_hex(), &format!("to {}", proposal.peer_address));
        Ok(())
    }

    /// `StartHandshake`: locate (or dial, retrying per `RetryConfig`) the
    /// keeper and send the handshake.
    async fn start_handshake(
        &self,
        peer_address: &PeerAddress,
        handshake: StorageHandshake,
    ) -> StorageResult<Arc<dyn crate::peer_network::PeerHandle>> {
        let retry = RetryConfig {
            max_attempts: self.config.protocol.dial_max_attempts,
            initial_delay: self.config.protocol.dial_retry_delay,
            max_delay: self.config.protocol.dial_retry_delay,
            backoff_multiplier: 1.0,
        };

        let network = &self.network;
        let peer = retry_async(
            || async { network.dial(peer_address).await },
            retry,
            "start_handshake dial",
        )
        .await?;

        peer.send(WireMessage::Handshake(handshake)).await?;
        Ok(peer)
    }

    /// Poll `received_handshakes` for an echo of `order_hash`, honoring the
    /// configured timeout and cooperative cancellation (§5, §9). Peeks the
    /// map with `try_lock` so the blocking-poll helper in `resilience` (a
    /// plain synchronous `FnMut`) can be reused as-is.
    async fn wait_for_request_replica(&self, order_hash: OrderHash) -> StorageResult<StorageHandshake> {
        poll_until_cancelable(
            || {
                self.received_handshakes
                    .try_lock()
                    .ok()
                    .and_then(|map| map.get(&order_hash).cloned())
            },
            self.config.protocol.handshake_echo_poll,
            self.config.protocol.handshake_echo_timeout,
            &self.cancel,
        )
        .await
    }

    // ===== §4.6 background job =====

    /// Runs forever at the configured tick interval until the controller's
    /// `CancellationToken` fires. Refreshes our external address via `ping`
    /// broadcast when it's unknown or stale, and triggers keeper selection
    /// for orders whose listening window has elapsed. No error escapes this
    /// loop (§7): every tick's failures are caught, logged, and the loop
    /// continues.
    pub async fn background_job(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.protocol.background_tick);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.cancel.cancelled() => {
                    log_protocol_event("background", "-", "canceled, stopping worker");
                    return;
                }
            }

            if let Err(e) = self.refresh_external_address_if_stale().await {
                log_error_with_context("background refresh_address", &e);
            }

            if let Err(e) = self.trigger_due_keeper_selection().await {
                log_error_with_context("background keeper_selection", &e);
            }
        }
    }

    async fn refresh_external_address_if_stale(&self) -> StorageResult<()> {
        let stale = match *self.last_address_refresh.lock().await {
            None => true,
            Some(last) => last.elapsed() >= self.config.protocol.address_refresh_interval,
        };
        if !stale && self.network.external_address().await.is_some() {
            return Ok(());
        }

        for peer in self.network.all_peers().await {
            peer.send(WireMessage::Ping).await.ok();
        }
        Ok(())
    }

    async fn trigger_due_keeper_selection(&self) -> StorageResult<()> {
        let due_threshold = now_secs().saturating_sub(self.config.protocol.keeper_selection_delay_secs);
        let listening = self.proposals.lock().await.get_listen_proposals();

        for order_hash in listening {
            let Some(order) = self.get_announce(order_hash).await else {
                continue;
            };
            if order.time > due_threshold {
                continue;
            }
            // §4.6's background job invokes `FindReplicaKeepers(order, 1)`
            // literally; callers wanting more replicas per order call
            // `find_replica_keepers` directly with their own `k`.
            self.find_replica_keepers(order_hash, 1).await.ok();
            self.proposals.lock().await.stop_listen_proposal(order_hash);
        }
        Ok(())
    }
}

fn reset_port(address: &str, port: u16) -> String {
    match address.rsplit_once(':') {
        Some((host, _)) => format!("{}:{}", host, port),
        None => format!("{}:{}", address, port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer_network::{ChannelHub, ChannelPeerNetwork};
    use tempfile::TempDir;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.crypto.rsa_bits = crate::codec::MIN_MODULUS_BITS;
        config.storage.default_chunk_capacity = 10 * 1024 * 1024;
        config.protocol.handshake_echo_timeout = Duration::from_millis(500);
        config.protocol.handshake_echo_poll = Duration::from_millis(10);
        config.protocol.dial_max_attempts = 3;
        config.protocol.dial_retry_delay = Duration::from_millis(10);
        config
    }

    async fn make_controller(
        name: &str,
        hub: Arc<ChannelHub>,
        port: u16,
    ) -> (Arc<StorageController>, tokio::sync::mpsc::UnboundedReceiver<WireMessage>, TempDir) {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("data");
        let temp_dir = dir.path().join("temp");
        let (network, rx) = ChannelPeerNetwork::register(hub, PeerAddress(name.to_string()), port);
        let controller = StorageController::init_storages(test_config(), Arc::new(network), &data_dir, &temp_dir).unwrap();
        (Arc::new(controller), rx, dir)
    }

    fn sample_order(client: &str, size: u64) -> StorageOrder {
        StorageOrder {
            time: now_secs(),
            file_uri: FileURI([9u8; 32]),
            filename: "report.pdf".into(),
            file_size: size,
            max_rate: 10,
            max_gap: 100,
            client_address: PeerAddress(client.to_string()),
        }
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn cancel_emits_a_protocol_event_log_line() {
        let hub = ChannelHub::new();
        let (controller, _rx, _dir) = make_controller("solo", hub, 9000).await;
        let order = sample_order("solo", 10);
        let hash = controller.announce_order(order).await.unwrap();

        controller.cancel_order(hash).await;

        assert!(logs_contain("order canceled"));
    }

    #[tokio::test]
    async fn cancel_unknown_order_returns_false() {
        let hub = ChannelHub::new();
        let (controller, _rx, _dir) = make_controller("solo", hub, 9000).await;
        assert!(!controller.cancel_order(OrderHash::zero()).await);
    }

    #[tokio::test]
    async fn cancel_known_order_clears_announcement_and_proposals() {
        let hub = ChannelHub::new();
        let (controller, _rx, _dir) = make_controller("solo", hub, 9000).await;
        let order = sample_order("solo", 10);
        let hash = controller.announce_order(order).await.unwrap();

        assert!(controller.cancel_order(hash).await);
        assert!(controller.get_announce(hash).await.is_none());
        assert!(controller.get_proposals(hash).await.is_empty());
    }

    #[tokio::test]
    async fn reaper_removes_only_stale_announcements() {
        let hub = ChannelHub::new();
        let (controller, _rx, _dir) = make_controller("solo", hub, 9000).await;
        let mut old = sample_order("solo", 10);
        old.time = 100;
        let old_hash = controller.announce_order(old).await.unwrap();
        let mut fresh = sample_order("solo", 10);
        fresh.time = 10_000;
        fresh.file_uri = FileURI([2u8; 32]);
        let fresh_hash = controller.announce_order(fresh).await.unwrap();

        controller.clear_old_announcements(500).await;

        assert!(controller.get_announce(old_hash).await.is_none());
        assert!(controller.get_announce(fresh_hash).await.is_some());
    }

    #[tokio::test]
    async fn proposal_at_or_above_max_rate_is_never_added() {
        let hub = ChannelHub::new();
        let (client, _client_rx, _dir) = make_controller("client", hub.clone(), 9000).await;
        let (_keeper_net, _keeper_rx) = ChannelPeerNetwork::register(hub, PeerAddress("keeper".into()), 9001);

        let order = sample_order("client", 10);
        let hash = client
            .announce_order_with_source(order.clone(), PathBuf::from("/dev/null"))
            .await
            .unwrap();

        let from = client.network.dial(&PeerAddress("keeper".into())).await.unwrap();

        let too_expensive = StorageProposal {
            time: now_secs(),
            order_hash: hash,
            rate: order.max_rate,
            peer_address: PeerAddress("keeper".into()),
        };
        client.handle_proposal(from.clone(), too_expensive).await.ok();
        assert!(client.get_proposals(hash).await.is_empty());

        let acceptable = StorageProposal {
            time: now_secs(),
            order_hash: hash,
            rate: order.max_rate - 1,
            peer_address: PeerAddress("keeper".into()),
        };
        client.handle_proposal(from, acceptable).await.ok();
        assert_eq!(client.get_proposals(hash).await.len(), 1);
    }
}
