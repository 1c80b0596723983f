//! End-to-end replica synchronization over in-process transports.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

use evolu_core::{Change, Config, EvoluError, ManualClock, OwnerId, RowId, Timestamp, Value};
use evolu_protocol::ReconcileConfig;
use evolu_sync::{
    serve_peer, spawn_sync, ChannelTransport, Connector, QuerySubscribers, Replica, SyncOptions,
    SyncState, Transport,
};

const PHRASE: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

fn config() -> Config {
    Config {
        mnemonic: Some(PHRASE.to_string()),
        ..Config::default()
    }
}

fn replica(seed: u64, clock: Arc<ManualClock>) -> Arc<Replica> {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    Replica::open_in_memory(config(), clock, &mut rng).unwrap()
}

fn row(byte: u8) -> RowId {
    RowId::from_bytes([byte; 21])
}

/// Connector whose every dial is answered by a peer replica serving the
/// responder role over its own storage.
struct PeerConnector {
    peer: Arc<Replica>,
}

#[async_trait]
impl Connector for PeerConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, EvoluError> {
        let (client, server) = ChannelTransport::pair(16);
        let peer = self.peer.clone();
        tokio::spawn(async move {
            let _ = serve_peer(peer, Box::new(server), ReconcileConfig::default()).await;
        });
        Ok(Box::new(client))
    }
}

async fn wait_for_state(
    status: &mut tokio::sync::watch::Receiver<evolu_sync::SyncStatus>,
    wanted: SyncState,
) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if status.borrow().state == wanted {
                return;
            }
            status.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never reached {wanted:?}"));
}

#[tokio::test]
async fn mutations_flow_to_the_peer_replica() {
    let clock = Arc::new(ManualClock::starting_at(1_000));
    let local = replica(1, clock.clone());
    let peer = replica(2, clock.clone());
    assert_eq!(local.owner_id(), peer.owner_id());

    local
        .mutate(vec![Change::set(
            "todo",
            row(1),
            "title",
            Value::Text("buy milk".into()),
        )])
        .await
        .unwrap();

    let connector = Arc::new(PeerConnector { peer: peer.clone() });
    let handle = spawn_sync(local.clone(), connector, SyncOptions::default());
    let mut status = handle.status();
    wait_for_state(&mut status, SyncState::Synced).await;

    assert_eq!(
        peer.current_value("todo", row(1), "title").await.unwrap(),
        Some(Value::Text("buy milk".into()))
    );
    // Settled sessions clear the upload queue.
    assert!(local.pending_messages().await.unwrap().is_empty());
    assert!(status.borrow().last_synced_at.is_some());

    handle.dispose().await;
}

#[tokio::test]
async fn concurrent_writes_resolve_last_writer_wins() {
    let clock = Arc::new(ManualClock::starting_at(1_000));
    let local = replica(3, clock.clone());
    let peer = replica(4, clock.clone());

    // Two devices write the same register; the peer writes later.
    local
        .mutate(vec![Change::set(
            "todo",
            row(2),
            "title",
            Value::Text("first".into()),
        )])
        .await
        .unwrap();
    clock.advance(10);
    peer.mutate(vec![Change::set(
        "todo",
        row(2),
        "title",
        Value::Text("second".into()),
    )])
    .await
    .unwrap();

    let connector = Arc::new(PeerConnector { peer: peer.clone() });
    let handle = spawn_sync(local.clone(), connector, SyncOptions::default());
    let mut status = handle.status();
    wait_for_state(&mut status, SyncState::Synced).await;

    for replica in [&local, &peer] {
        assert_eq!(
            replica
                .current_value("todo", row(2), "title")
                .await
                .unwrap(),
            Some(Value::Text("second".into()))
        );
        let history = replica
            .register_history("todo", row(2), "title")
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].1, Value::Text("second".into()));
        assert_eq!(history[1].1, Value::Text("first".into()));
        assert!(history[0].0 > history[1].0);
    }

    handle.dispose().await;
}

#[tokio::test]
async fn clock_ahead_then_corrected_rejects_sends() {
    let clock = Arc::new(ManualClock::starting_at(1_000_000));
    let local = replica(5, clock.clone());

    local
        .mutate(vec![Change::set("todo", row(3), "done", Value::Int(1))])
        .await
        .unwrap();
    let queued_before = local.pending_messages().await.unwrap().len();

    // The wall clock is corrected ten minutes backwards; the clock state is
    // now far ahead of it.
    clock.set(400_000);
    let err = local
        .mutate(vec![Change::set("todo", row(3), "done", Value::Int(0))])
        .await
        .unwrap_err();
    assert_eq!(err, EvoluError::ClockDrift { drift_ms: 600_000 });

    // Nothing was enqueued by the failed mutation.
    assert_eq!(local.pending_messages().await.unwrap().len(), queued_before);
}

#[tokio::test]
async fn subscribers_observe_applied_timestamps_in_order() {
    struct Recorder {
        count: AtomicUsize,
        owner: OwnerId,
    }
    impl QuerySubscribers for Recorder {
        fn applied(&self, owner: &OwnerId, timestamps: &[Timestamp]) {
            assert_eq!(*owner, self.owner);
            assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
            self.count.fetch_add(timestamps.len(), Ordering::SeqCst);
        }
    }

    let clock = Arc::new(ManualClock::starting_at(1_000));
    let local = replica(6, clock.clone());
    let peer = replica(7, clock.clone());

    let recorder = Arc::new(Recorder {
        count: AtomicUsize::new(0),
        owner: local.owner_id(),
    });
    local.subscribe(recorder.clone());

    peer.mutate(vec![
        Change::set("todo", row(4), "a", Value::Int(1)),
        Change::set("todo", row(4), "b", Value::Int(2)),
        Change::set("todo", row(4), "c", Value::Int(3)),
    ])
    .await
    .unwrap();

    let connector = Arc::new(PeerConnector { peer: peer.clone() });
    let handle = spawn_sync(local.clone(), connector, SyncOptions::default());
    let mut status = handle.status();
    wait_for_state(&mut status, SyncState::Synced).await;

    assert_eq!(recorder.count.load(Ordering::SeqCst), 3);
    handle.dispose().await;
}

#[tokio::test]
async fn unreachable_relay_surfaces_transient_errors_and_retries() {
    struct DeadConnector;

    #[async_trait]
    impl Connector for DeadConnector {
        async fn connect(&self) -> Result<Box<dyn Transport>, EvoluError> {
            Err(EvoluError::transport("connection refused"))
        }
    }

    let clock = Arc::new(ManualClock::starting_at(1_000));
    let local = replica(8, clock);

    let handle = spawn_sync(local, Arc::new(DeadConnector), SyncOptions::default());
    let mut status = handle.status();
    wait_for_state(&mut status, SyncState::Error).await;
    assert_matches!(status.borrow().error, Some(EvoluError::Transport { .. }));

    handle.dispose().await;
}

#[tokio::test]
async fn empty_replicas_settle_with_no_changes() {
    let clock = Arc::new(ManualClock::starting_at(1_000));
    let local = replica(9, clock.clone());
    let peer = replica(10, clock);

    let connector = Arc::new(PeerConnector { peer: peer.clone() });
    let handle = spawn_sync(local.clone(), connector, SyncOptions::default());
    let mut status = handle.status();
    wait_for_state(&mut status, SyncState::Synced).await;

    assert!(local.pending_messages().await.unwrap().is_empty());
    assert!(peer.pending_messages().await.unwrap().is_empty());
    handle.dispose().await;
}
