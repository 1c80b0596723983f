//! The sync orchestrator.
//!
//! One background task per owner drives reconciliation sessions against a
//! relay: connect, run rounds until settled, publish status, retry
//! transient failures with jittered exponential backoff, and stop on
//! shutdown. Local writes and remote applies serialize through the
//! replica's owner lock, and a shared semaphore bounds how many sessions
//! dial out at once.

use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use rand_chacha::ChaCha20Rng;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use evolu_core::{EvoluError, Timestamp};
use evolu_protocol::{
    open_frame, respond, seal_frame, InitiatorSession, ProtocolMessage, ReconcileConfig,
};

use crate::replica::Replica;
use crate::transport::{Connector, Transport};

/// Default per-round receive timeout.
pub const ROUND_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on concurrent outbound sessions.
pub const DEFAULT_SESSION_PERMITS: usize = 2;

/// Backoff starts here and doubles.
pub const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Backoff never exceeds this.
pub const BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Where a replica's sync stands, as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No session yet.
    Idle,
    /// A session is running.
    Syncing,
    /// The last session settled.
    Synced,
    /// The last session failed.
    Error,
}

/// Observable sync status. The store never appears half-synced: the state
/// only moves to [`SyncState::Synced`] after a session settles completely.
#[derive(Debug, Clone)]
pub struct SyncStatus {
    /// Current state.
    pub state: SyncState,
    /// Most recent failure, including non-fatal ones (a decrypt failure
    /// leaves the state synced but is still surfaced here).
    pub error: Option<EvoluError>,
    /// Wall-clock milliseconds of the last settled session.
    pub last_synced_at: Option<u64>,
}

impl SyncStatus {
    fn idle() -> Self {
        Self {
            state: SyncState::Idle,
            error: None,
            last_synced_at: None,
        }
    }
}

/// Orchestrator tunables.
#[derive(Clone)]
pub struct SyncOptions {
    /// Reconciliation tunables, from the engine config.
    pub reconcile: ReconcileConfig,
    /// Per-round receive timeout.
    pub round_timeout: Duration,
    /// Shared bound on concurrent outbound sessions.
    pub permits: Arc<Semaphore>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            reconcile: ReconcileConfig::default(),
            round_timeout: ROUND_TIMEOUT,
            permits: Arc::new(Semaphore::new(DEFAULT_SESSION_PERMITS)),
        }
    }
}

impl SyncOptions {
    /// Options honoring the engine config's reconciliation tunables.
    pub fn from_config(config: &evolu_core::Config) -> Self {
        Self {
            reconcile: ReconcileConfig {
                list_threshold: config.list_threshold,
                max_items: config.max_items_per_range,
            },
            ..Self::default()
        }
    }
}

/// Jittered exponential backoff: `base * 2^(attempt-1)`, capped, ±10%.
pub fn backoff_delay(
    attempt: u32,
    base: Duration,
    cap: Duration,
    rng: &mut impl RngCore,
) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let raw = base.saturating_mul(1u32 << exponent);
    let capped = raw.min(cap).as_millis() as u64;
    let jitter_span = capped / 10;
    if jitter_span == 0 {
        return Duration::from_millis(capped);
    }
    let offset = (rng.next_u64() % (2 * jitter_span + 1)) as i64 - jitter_span as i64;
    Duration::from_millis(capped.saturating_add_signed(offset))
}

/// Disposable handle to a running sync loop.
///
/// Dropping the handle without [`SyncHandle::dispose`] aborts the task on
/// the spot; disposal shuts it down cooperatively and releases its permits.
pub struct SyncHandle {
    kick: mpsc::Sender<()>,
    shutdown: watch::Sender<bool>,
    status: watch::Receiver<SyncStatus>,
    task: Option<JoinHandle<()>>,
}

impl SyncHandle {
    /// Watch the sync status observable.
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Ask the loop to run a session now (after local mutations, on
    /// reconnect, and so on). Collapses with any kick already queued.
    pub fn sync_now(&self) {
        let _ = self.kick.try_send(());
    }

    /// Cooperative shutdown: aborts the active session at its next await
    /// point and waits for the task to finish.
    pub async fn dispose(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Spawn the sync loop for a replica. One session at a time per owner;
/// an initial session is kicked off immediately.
pub fn spawn_sync(
    replica: Arc<Replica>,
    connector: Arc<dyn Connector>,
    options: SyncOptions,
) -> SyncHandle {
    let (kick_tx, kick_rx) = mpsc::channel(1);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (status_tx, status_rx) = watch::channel(SyncStatus::idle());

    let _ = kick_tx.try_send(());
    let task = tokio::spawn(run_loop(
        replica,
        connector,
        options,
        kick_rx,
        shutdown_rx,
        status_tx,
    ));

    SyncHandle {
        kick: kick_tx,
        shutdown: shutdown_tx,
        status: status_rx,
        task: Some(task),
    }
}

async fn run_loop(
    replica: Arc<Replica>,
    connector: Arc<dyn Connector>,
    options: SyncOptions,
    mut kick: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
    status: watch::Sender<SyncStatus>,
) {
    let mut rng = replica.fork_rng();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            kicked = kick.recv() => {
                if kicked.is_none() {
                    break;
                }
            }
        }

        let mut attempt = 0u32;
        loop {
            publish(&status, SyncState::Syncing, None, None);
            let result = {
                let session = sync_once(&replica, connector.as_ref(), &options, &mut rng);
                tokio::select! {
                    _ = shutdown.changed() => return,
                    result = session => result,
                }
            };
            match result {
                Ok(decrypt_failures) => {
                    let error = (decrypt_failures > 0).then_some(EvoluError::Decrypt);
                    publish(&status, SyncState::Synced, error, Some(replica.now_ms()));
                    break;
                }
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    let delay = backoff_delay(attempt, BACKOFF_BASE, BACKOFF_CAP, &mut rng);
                    warn!(error = %err, attempt, delay_ms = delay.as_millis() as u64, "transient sync failure, backing off");
                    publish(&status, SyncState::Error, Some(err), None);
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    // Escalate to the application and wait for the next
                    // explicit kick; retrying a bad write key or a clock
                    // problem would just loop.
                    warn!(error = %err, "sync failed, waiting for next trigger");
                    publish(&status, SyncState::Error, Some(err), None);
                    break;
                }
            }
        }
    }
    debug!("sync loop stopped");
}

fn publish(
    status: &watch::Sender<SyncStatus>,
    state: SyncState,
    error: Option<EvoluError>,
    synced_at: Option<u64>,
) {
    status.send_modify(|current| {
        current.state = state;
        current.error = error;
        if synced_at.is_some() {
            current.last_synced_at = synced_at;
        }
    });
}

/// Run one complete session. Returns the number of decrypt failures (the
/// session still settles around them).
async fn sync_once(
    replica: &Arc<Replica>,
    connector: &dyn Connector,
    options: &SyncOptions,
    rng: &mut ChaCha20Rng,
) -> Result<usize, EvoluError> {
    let _permit = options
        .permits
        .acquire()
        .await
        .map_err(|_| EvoluError::Cancelled)?;
    let _owner_guard = replica.owner_lock.lock().await;

    let mut transport = connector.connect().await?;
    let result = drive_session(replica, transport.as_mut(), options, rng).await;
    transport.close().await;
    result
}

async fn drive_session(
    replica: &Arc<Replica>,
    transport: &mut dyn Transport,
    options: &SyncOptions,
    rng: &mut ChaCha20Rng,
) -> Result<usize, EvoluError> {
    let storage = replica.storage();
    let reconcile = options.reconcile;

    let pending = replica.pending_messages().await?;
    let sent_pending: Vec<Timestamp> = pending.iter().map(|m| m.timestamp).collect();

    let mut session = InitiatorSession::new(replica.owner_id(), replica.write_key(), reconcile);
    let (returned, opening) = storage
        .call(move |store| {
            let mut session = session;
            let frame = session.begin(store, &pending)?;
            Ok((session, frame))
        })
        .await?;
    session = returned;

    transport.send(seal_frame(&opening, rng)?).await?;

    let mut decrypt_failures = 0usize;
    loop {
        let bytes = tokio::time::timeout(options.round_timeout, transport.recv())
            .await
            .map_err(|_| EvoluError::transport("round timed out"))??;
        let message = open_frame(&bytes).map_err(EvoluError::from)?;

        let mut guard = replica.drift_guard();
        let (returned, step) = storage
            .call(move |store| {
                let mut session = session;
                let step = session.handle(store, message, Some(&mut guard));
                Ok((session, step))
            })
            .await?;
        session = returned;
        let step = match step {
            Ok(step) => step,
            Err(err) => {
                // Tell the responder why the session died before hanging up.
                let notice = ProtocolMessage::Error {
                    code: evolu_protocol::ErrorCode::from_error(&err),
                    detail: err.to_string(),
                };
                if let Ok(frame) = seal_frame(&notice, rng) {
                    let _ = transport.send(frame).await;
                }
                return Err(err);
            }
        };

        decrypt_failures += replica.integrate(&step.applied).await?;

        match step.reply {
            Some(reply) => transport.send(seal_frame(&reply, rng)?).await?,
            None => {
                debug_assert!(step.done);
                break;
            }
        }
    }

    replica.clear_pending(sent_pending).await?;
    info!(owner = %replica.owner_id(), rounds = session.rounds(), "sync session settled");
    Ok(decrypt_failures)
}

/// Serve the responder role over a transport, backed by this replica's own
/// storage: peer-to-peer sync without a relay in the middle.
///
/// Returns when the peer hangs up.
pub async fn serve_peer(
    replica: Arc<Replica>,
    mut transport: Box<dyn Transport>,
    reconcile: ReconcileConfig,
) -> Result<(), EvoluError> {
    let storage = replica.storage();
    let mut rng = replica.fork_rng();
    loop {
        let bytes = match transport.recv().await {
            Ok(bytes) => bytes,
            Err(_) => return Ok(()),
        };
        let reply = match open_frame(&bytes) {
            Ok(message) => {
                let step = storage
                    .call(move |store| Ok(respond(store, message, reconcile)))
                    .await?;
                match step {
                    Some(step) => {
                        // Whatever this frame really persisted is now local;
                        // decrypt and project it like any other applied batch.
                        replica.integrate(&step.applied).await?;
                        Some(step.reply)
                    }
                    None => None,
                }
            }
            Err(err) => Some(ProtocolMessage::Error {
                code: evolu_protocol::ErrorCode::from_error(&EvoluError::from(err)),
                detail: "malformed frame".to_string(),
            }),
        };
        match reply {
            Some(reply) => transport.send(seal_frame(&reply, &mut rng)?).await?,
            None => return Ok(()),
        }
    }
}
