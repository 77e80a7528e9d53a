use crate::*;

use bytes::Bytes;

use shard_core::wire::{self, KIND_CHUNK, KIND_FILE_ANNOUNCE};
use shard_core::{Chunk, ChunkAvailability, MAX_CHUNK_SIZE};
use shard_services::{
    ConnectionState, FileLibrary, PeerTransport, ReceiveListener, TransportConfig, TransportError,
};

fn numbered(recipient: u32, n: u32) -> Envelope {
    Envelope::new(1, recipient, 42, n.to_le_bytes().to_vec())
}

fn number_of(env: &Envelope) -> u32 {
    u32::from_le_bytes(env.payload[..4].try_into().unwrap())
}

#[tokio::test]
async fn envelopes_arrive_in_submission_order() {
    let mut sink = Sink::any_port().await.unwrap();
    let transport = PeerTransport::new(quick_config(), vec![sink.record(2)]);
    transport.start().await.unwrap();

    for n in 0..200 {
        transport.submit(numbered(2, n)).unwrap();
    }
    for n in 0..200 {
        let env = sink.next().await.expect("envelope should arrive");
        assert_eq!(env.recipient, 2);
        assert_eq!(number_of(&env), n);
    }
    assert_eq!(sink.accepted.load(Ordering::SeqCst), 1);

    assert!(wait_until(|| transport.peer_status(2).unwrap().sent == 200).await);
    assert_eq!(transport.peer_status(2).unwrap().state, ConnectionState::Connected);
    assert_eq!(transport.stats().routed, 200);

    transport.shutdown().await;
}

#[tokio::test]
async fn each_peer_gets_only_its_own_envelopes() {
    let mut a = Sink::any_port().await.unwrap();
    let mut b = Sink::any_port().await.unwrap();
    let transport = PeerTransport::new(quick_config(), vec![a.record(10), b.record(20)]);
    transport.start().await.unwrap();
    assert_eq!(transport.peer_ids(), vec![10, 20]);

    for n in 0..10 {
        transport.submit(numbered(10, n)).unwrap();
        transport.submit(numbered(20, n + 100)).unwrap();
    }
    for n in 0..10 {
        assert_eq!(number_of(&a.next().await.unwrap()), n);
        assert_eq!(number_of(&b.next().await.unwrap()), n + 100);
    }
    assert!(a.quiet_for(Duration::from_millis(100)).await);

    transport.shutdown().await;
}

#[tokio::test]
async fn unknown_recipient_is_dropped_without_harm() {
    let mut sink = Sink::any_port().await.unwrap();
    let transport = PeerTransport::new(quick_config(), vec![sink.record(2)]);
    transport.start().await.unwrap();

    transport.submit(numbered(99, 0)).unwrap();
    transport.submit(numbered(2, 1)).unwrap();

    assert_eq!(number_of(&sink.next().await.unwrap()), 1);
    assert_eq!(transport.stats().dropped_unknown, 1);
    assert_eq!(transport.stats().submitted, 2);

    transport.shutdown().await;
}

#[tokio::test]
async fn absent_connection_gets_exactly_one_connect_attempt() {
    let port = free_port();
    let transport = PeerTransport::new(quick_config(), vec![PeerRecord::new(3, "127.0.0.1", port)]);
    transport.start().await.unwrap();

    let status = transport.peer_status(3).unwrap();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.connect_attempts, 1);

    let mut sink = Sink::bind(port).await.unwrap();
    transport.submit(numbered(3, 7)).unwrap();
    assert_eq!(number_of(&sink.next().await.unwrap()), 7);

    let status = transport.peer_status(3).unwrap();
    assert_eq!(status.connect_attempts, 2);
    assert_eq!(status.reconnects, 1);
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(sink.accepted.load(Ordering::SeqCst), 1);

    transport.shutdown().await;
}

#[tokio::test]
async fn worker_reconnects_after_peer_drops_connection() {
    let mut sink = Sink::any_port().await.unwrap();
    let transport = PeerTransport::new(quick_config(), vec![sink.record(2)]);
    transport.start().await.unwrap();

    transport.submit(numbered(2, 1)).unwrap();
    assert_eq!(number_of(&sink.next().await.unwrap()), 1);

    sink.kick();
    tokio::time::sleep(Duration::from_millis(200)).await;

    transport.submit(numbered(2, 2)).unwrap();
    assert_eq!(number_of(&sink.next().await.unwrap()), 2);
    assert_eq!(sink.accepted.load(Ordering::SeqCst), 2);
    assert_eq!(transport.peer_status(2).unwrap().reconnects, 1);

    transport.shutdown().await;
}

#[tokio::test]
async fn failed_connects_open_a_backoff_window() {
    let port = free_port();
    let config = TransportConfig {
        backoff_base: Duration::from_secs(2),
        backoff_max: Duration::from_secs(2),
        ..quick_config()
    };
    let transport = PeerTransport::new(config, vec![PeerRecord::new(4, "127.0.0.1", port)]);
    transport.start().await.unwrap();

    for n in 0..3 {
        transport.submit(numbered(4, n)).unwrap();
    }
    assert!(
        wait_until(|| {
            let s = transport.peer_status(4).unwrap();
            s.failed + s.dropped_backoff == 3
        })
        .await
    );
    let status = transport.peer_status(4).unwrap();
    // one attempt when added, one for the first envelope
    assert_eq!(status.connect_attempts, 2);
    assert_eq!(status.failed, 1);
    assert_eq!(status.dropped_backoff, 2);

    transport.shutdown().await;
}

#[tokio::test]
async fn removing_a_peer_closes_its_connection() {
    let mut sink = Sink::any_port().await.unwrap();
    let transport = PeerTransport::new(quick_config(), vec![sink.record(2)]);
    transport.start().await.unwrap();

    transport.submit(numbered(2, 1)).unwrap();
    assert_eq!(number_of(&sink.next().await.unwrap()), 1);

    assert!(transport.remove_peer(2));
    assert!(wait_until(|| sink.closed_by_peer.load(Ordering::SeqCst) == 1).await);

    transport.submit(numbered(2, 2)).unwrap();
    assert!(wait_until(|| transport.stats().dropped_unknown == 1).await);
    assert!(sink.quiet_for(Duration::from_millis(100)).await);

    transport.shutdown().await;
}

#[tokio::test]
async fn re_adding_a_peer_replaces_its_worker() {
    let mut old = Sink::any_port().await.unwrap();
    let mut new = Sink::any_port().await.unwrap();
    let transport = PeerTransport::new(quick_config(), vec![old.record(2)]);
    transport.start().await.unwrap();

    transport.add_peer(new.record(2)).await.unwrap();
    assert!(wait_until(|| old.closed_by_peer.load(Ordering::SeqCst) == 1).await);

    transport.submit(numbered(2, 5)).unwrap();
    assert_eq!(number_of(&new.next().await.unwrap()), 5);
    assert!(old.quiet_for(Duration::from_millis(100)).await);
    assert_eq!(transport.peer_ids(), vec![2]);

    transport.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_connections_and_rejects_submit() {
    let mut sink = Sink::any_port().await.unwrap();
    let transport = PeerTransport::new(quick_config(), vec![sink.record(2)]);
    transport.start().await.unwrap();
    transport.submit(numbered(2, 1)).unwrap();
    assert_eq!(number_of(&sink.next().await.unwrap()), 1);

    transport.shutdown().await;
    assert!(wait_until(|| sink.closed_by_peer.load(Ordering::SeqCst) == 1).await);
    assert_eq!(transport.submit(numbered(2, 2)), Err(TransportError::Closed));
    assert!(transport.peer_ids().is_empty());
    assert_eq!(
        transport.add_peer(sink.record(2)).await,
        Err(TransportError::Closed)
    );
}

/// Node A announces and streams a file to node B, chunks out of order.
#[tokio::test]
async fn file_replicates_between_nodes() {
    let dir = temp_dir("replicate");
    let library = FileLibrary::new(&dir).unwrap();
    let (shutdown_tx, _) = broadcast::channel(1);
    let listener = ReceiveListener::bind("127.0.0.1:0", library.clone(), shutdown_tx.subscribe())
        .await
        .unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(listener.run());

    let transport = PeerTransport::new(quick_config(), vec![PeerRecord::new(2, "127.0.0.1", port)]);
    transport.start().await.unwrap();

    let data: Vec<u8> = (0..150_000u32).map(|i| (i % 256) as u8).collect();
    let meta = ChunkAvailability::missing("payload.bin", data.len() as u64);
    transport
        .submit(Envelope::new(1, 2, KIND_FILE_ANNOUNCE, wire::encode_announce(&meta)))
        .unwrap();
    for id in [2u32, 0, 1] {
        let start = id as usize * MAX_CHUNK_SIZE;
        let end = (start + MAX_CHUNK_SIZE).min(data.len());
        let chunk = Chunk::new("payload.bin", id, Bytes::copy_from_slice(&data[start..end])).unwrap();
        let payload = wire::encode_chunk(&chunk, data.len() as u64).unwrap();
        transport.submit(Envelope::new(1, 2, KIND_CHUNK, payload)).unwrap();
    }

    let mut done = false;
    for _ in 0..500 {
        if library.progress().await.iter().any(|p| p.complete) {
            done = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(done, "file never completed");
    assert_eq!(std::fs::read(dir.join("payload.bin")).unwrap(), data);

    transport.shutdown().await;
    let _ = shutdown_tx.send(());
    let _ = std::fs::remove_dir_all(dir);
}
