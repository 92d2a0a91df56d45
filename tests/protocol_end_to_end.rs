//! End-to-end protocol scenarios (spec §8, S4-S6, invariant 8), driven with
//! two or more `StorageController`s wired together over a shared
//! `ChannelHub` so the full announce -> proposal -> handshake -> send-file
//! exchange runs over real (if in-process) message dispatch, not direct
//! method calls on one controller.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

use storagecontroller::codec::MIN_MODULUS_BITS;
use storagecontroller::{
    ChannelHub, ChannelPeerNetwork, Config, FileURI, OrderHash, PeerAddress, PeerNetwork,
    StorageController, StorageOrder, StorageProposal, WireMessage,
};

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

fn node_config(my_rate: u64) -> Config {
    let mut config = Config::default();
    config.crypto.rsa_bits = MIN_MODULUS_BITS;
    config.storage.default_chunk_capacity = 10 * 1024 * 1024;
    config.protocol.my_rate = my_rate;
    config.protocol.my_max_blocks_gap = 100;
    config.protocol.dial_max_attempts = 3;
    config.protocol.dial_retry_delay = Duration::from_millis(5);
    config.protocol.handshake_echo_timeout = Duration::from_secs(2);
    config.protocol.handshake_echo_poll = Duration::from_millis(5);
    config
}

/// Stand up a `StorageController` registered on `hub` at `address`/`port`,
/// returning it plus its network handle and raw inbound receiver (not yet
/// dispatched) and the temp dir backing its data/temp heaps.
async fn make_node(
    hub: Arc<ChannelHub>,
    address: &str,
    port: u16,
    my_rate: u64,
) -> (Arc<StorageController>, Arc<ChannelPeerNetwork>, UnboundedReceiver<WireMessage>, TempDir) {
    let dir = TempDir::new().unwrap();
    let (network, rx) = ChannelPeerNetwork::register(hub, PeerAddress(address.to_string()), port);
    let network = Arc::new(network);
    let controller = StorageController::init_storages(
        node_config(my_rate),
        network.clone() as Arc<dyn PeerNetwork>,
        &dir.path().join("data"),
        &dir.path().join("temp"),
    )
    .unwrap();
    (Arc::new(controller), network, rx, dir)
}

/// Drain `rx` forever, treating `counterparty` as the sender of every
/// message (fine for a topology where each dispatcher only ever hears from
/// one logical peer at a time) and feeding it through the controller's
/// normal inbound handler.
fn spawn_dispatcher(
    controller: Arc<StorageController>,
    network: Arc<ChannelPeerNetwork>,
    mut rx: UnboundedReceiver<WireMessage>,
    counterparty: PeerAddress,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(from) = network.dial(&counterparty).await {
                controller.handle_message(from, msg).await;
            }
        }
    })
}

fn sample_order(client_address: &str, file_size: u64, max_rate: u64) -> StorageOrder {
    StorageOrder {
        time: now_secs(),
        file_uri: FileURI([42u8; 32]),
        filename: "dataset.bin".to_string(),
        file_size,
        max_rate,
        max_gap: 100,
        client_address: PeerAddress(client_address.to_string()),
    }
}

/// Poll an async condition until it's true or `timeout` elapses, yielding
/// control back to the runtime between polls so spawned dispatcher tasks
/// actually get to run (this must never block the executor thread).
async fn wait_until<F, Fut>(mut condition: F, timeout: Duration)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    loop {
        if condition().await {
            return;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// S4: two controllers run the full protocol; the keeper ends up holding a
/// replica it can decrypt back to the client's original plaintext.
#[tokio::test]
async fn full_protocol_round_trip_stores_and_decrypts_replica() {
    let hub = ChannelHub::new();
    // Client advertises a rate so high that it never proposes to itself when
    // its own re-gossiped announce echoes back.
    let (client, client_net, client_rx, client_dir) =
        make_node(hub.clone(), "127.0.0.1:9000", 9000, 1_000_000).await;
    let (keeper, keeper_net, keeper_rx, _keeper_dir) = make_node(hub.clone(), "127.0.0.1:9001", 9001, 1).await;

    spawn_dispatcher(client.clone(), client_net, client_rx, PeerAddress("127.0.0.1:9001".into()));
    spawn_dispatcher(keeper.clone(), keeper_net, keeper_rx, PeerAddress("127.0.0.1:9000".into()));

    let plaintext: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
    let local_path = client_dir.path().join("source.bin");
    std::fs::write(&local_path, &plaintext).unwrap();

    let order = sample_order("127.0.0.1:9000", plaintext.len() as u64, 10);
    let hash = client
        .announce_order_with_source(order.clone(), local_path)
        .await
        .unwrap();

    wait_until(
        || async { client.get_proposals(hash).await.len() == 1 },
        Duration::from_secs(2),
    )
    .await;

    let accepted = client.find_replica_keepers(hash, 1).await.unwrap();
    assert_eq!(accepted, 1);

    let output_path = client_dir.path().join("decrypted.bin");
    wait_until(
        || async { keeper.decrypt_replica(hash, &output_path).await.is_ok() },
        Duration::from_secs(2),
    )
    .await;

    let recovered = std::fs::read(&output_path).unwrap();
    assert_eq!(recovered, plaintext);
}

/// S5: a replica truncated on the wire (wrong on-disk size) is rejected; no
/// permanent entry appears, and the error never reaches the transport
/// (`handle_message` just logs and returns).
#[tokio::test]
async fn truncated_replica_is_rejected_without_storing_anything() {
    let hub = ChannelHub::new();
    let (keeper, keeper_net, _keeper_rx, keeper_dir) = make_node(hub.clone(), "127.0.0.1:9101", 9101, 1).await;

    let order = sample_order("127.0.0.1:9100", 4096, 10);
    let hash: OrderHash = order.hash().unwrap();
    keeper.announce_order(order.clone()).await.unwrap();

    let from = keeper_net.dial(&PeerAddress("127.0.0.1:9100".into())).await.unwrap();
    let truncated = vec![0u8; 64]; // far short of ciphertextSize(4096)
    keeper
        .handle_message(
            from,
            WireMessage::SendFile {
                order_hash: hash,
                merkle_root: [0u8; 32],
                ciphertext: truncated,
            },
        )
        .await;

    let output_path = keeper_dir.path().join("out.bin");
    assert!(keeper.decrypt_replica(hash, &output_path).await.is_err());
    assert!(!output_path.exists());
}

/// S6: correctly-sized ciphertext whose Merkle root doesn't match the one
/// carried on the wire is rejected the same way.
#[tokio::test]
async fn merkle_mismatch_is_rejected_without_storing_anything() {
    let hub = ChannelHub::new();
    let (keeper, keeper_net, _keeper_rx, keeper_dir) = make_node(hub.clone(), "127.0.0.1:9201", 9201, 1).await;

    let block_size = node_config(1).block_size();
    let order = sample_order("127.0.0.1:9200", (block_size - 2) as u64, 10);
    let hash: OrderHash = order.hash().unwrap();
    keeper.announce_order(order.clone()).await.unwrap();

    let correctly_sized = vec![7u8; block_size]; // right length, wrong content vs. any real root
    let from = keeper_net.dial(&PeerAddress("127.0.0.1:9200".into())).await.unwrap();
    keeper
        .handle_message(
            from,
            WireMessage::SendFile {
                order_hash: hash,
                merkle_root: [9u8; 32],
                ciphertext: correctly_sized,
            },
        )
        .await;

    let output_path = keeper_dir.path().join("out.bin");
    assert!(keeper.decrypt_replica(hash, &output_path).await.is_err());
    assert!(!output_path.exists());
}

/// Invariant 8: `FindReplicaKeepers` never accepts more than `k`, and a
/// proposal from an unreachable peer (sorted first since it bids lowest)
/// is skipped in favor of the next candidate rather than blocking forever.
#[tokio::test]
async fn find_replica_keepers_stops_at_k_and_skips_unreachable_bidders() {
    let hub = ChannelHub::new();
    let (client, client_net, client_rx, client_dir) =
        make_node(hub.clone(), "127.0.0.1:9300", 9300, 1_000_000).await;
    let (keeper_a, keeper_a_net, keeper_a_rx, dir_a) = make_node(hub.clone(), "127.0.0.1:9301", 9301, 1).await;
    let (keeper_b, keeper_b_net, keeper_b_rx, dir_b) = make_node(hub.clone(), "127.0.0.1:9302", 9302, 1).await;

    spawn_dispatcher(client.clone(), client_net.clone(), client_rx, PeerAddress("127.0.0.1:9301".into()));
    spawn_dispatcher(keeper_a.clone(), keeper_a_net, keeper_a_rx, PeerAddress("127.0.0.1:9300".into()));
    spawn_dispatcher(keeper_b.clone(), keeper_b_net, keeper_b_rx, PeerAddress("127.0.0.1:9300".into()));

    let plaintext = vec![5u8; 512];
    let local_path = client_dir.path().join("source.bin");
    std::fs::write(&local_path, &plaintext).unwrap();

    let order = sample_order("127.0.0.1:9300", plaintext.len() as u64, 100);
    let hash = client
        .announce_order_with_source(order.clone(), local_path)
        .await
        .unwrap();

    // Inject a bogus, cheaper proposal from a peer that was never registered
    // on the hub, so dialing it always fails.
    let bogus = StorageProposal {
        time: now_secs(),
        order_hash: hash,
        rate: 0,
        peer_address: PeerAddress("127.0.0.1:9999".into()),
    };
    let from = client_net.dial(&PeerAddress("127.0.0.1:9301".into())).await.unwrap();
    client.handle_message(from, WireMessage::Proposal(bogus)).await;

    wait_until(
        || async { client.get_proposals(hash).await.len() == 3 },
        Duration::from_secs(2),
    )
    .await;

    let accepted = client.find_replica_keepers(hash, 1).await.unwrap();
    assert_eq!(accepted, 1, "must accept exactly the requested k, never more");

    let a_ok = keeper_a.decrypt_replica(hash, &dir_a.path().join("out.bin")).await.is_ok();
    let b_ok = keeper_b.decrypt_replica(hash, &dir_b.path().join("out.bin")).await.is_ok();
    assert!(a_ok ^ b_ok, "exactly one real keeper should have received the replica");
}
