//! A local replica: storage, secrets, and the clock, glued together.
//!
//! The replica owns the local mutation path (timestamp, seal, append,
//! project, queue) and the remote integration path (decrypt, project,
//! advance clock). Both serialize through the per-owner lock the
//! orchestrator also takes, so storage observes one linear history.

use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::{debug, error};

use evolu_core::{
    Change, Clock, Config, EncryptedMessage, EvoluError, Hlc, NodeId, OwnerId, RowId, Timestamp,
    Value,
};
use evolu_crypto::{Owner, WriteKey};
use evolu_store::{SqliteStore, StorageHandle};

/// Higher layers register here to refresh derived views after new
/// timestamps land.
pub trait QuerySubscribers: Send + Sync {
    /// Called after an atomic apply, timestamps ascending per owner.
    fn applied(&self, owner: &OwnerId, timestamps: &[Timestamp]);
}

/// One device's view of one owner.
pub struct Replica {
    storage: StorageHandle,
    secrets: Owner,
    hlc: Mutex<Hlc>,
    clock: Arc<dyn Clock>,
    rng: Mutex<ChaCha20Rng>,
    pub(crate) owner_lock: tokio::sync::Mutex<()>,
    subscribers: RwLock<Vec<Arc<dyn QuerySubscribers>>>,
    config: Config,
}

impl Replica {
    /// Open (or create) the replica database in `dir` and assemble the
    /// replica. The mnemonic comes from the config or is generated; the
    /// node id is generated once and persisted.
    pub fn open(
        dir: &Path,
        config: Config,
        clock: Arc<dyn Clock>,
        seed_rng: &mut (impl RngCore + rand::CryptoRng),
    ) -> Result<Arc<Self>, EvoluError> {
        let path = dir.join(format!("{}.db", config.name));
        let store = SqliteStore::open(&path, &config)?;
        Self::assemble(store, config, clock, seed_rng)
    }

    /// In-memory replica, used by tests and throwaway sessions.
    pub fn open_in_memory(
        config: Config,
        clock: Arc<dyn Clock>,
        seed_rng: &mut (impl RngCore + rand::CryptoRng),
    ) -> Result<Arc<Self>, EvoluError> {
        let store = SqliteStore::open_in_memory(&config)?;
        Self::assemble(store, config, clock, seed_rng)
    }

    fn assemble(
        store: SqliteStore,
        config: Config,
        clock: Arc<dyn Clock>,
        seed_rng: &mut (impl RngCore + rand::CryptoRng),
    ) -> Result<Arc<Self>, EvoluError> {
        let mut rng = ChaCha20Rng::from_rng(seed_rng)
            .map_err(|e| EvoluError::serialization(e.to_string()))?;

        let secrets = match &config.mnemonic {
            Some(phrase) => Owner::from_mnemonic_phrase(phrase)?,
            None => Owner::generate(&mut rng)?,
        };

        let node = match store.node_id()? {
            Some(node) => node,
            None => {
                let node = NodeId::random(&mut rng);
                store.set_node_id(node)?;
                node
            }
        };
        let hlc = match store.clock()? {
            Some(last) => Hlc::resume(last, config.max_drift_ms),
            None => Hlc::with_max_drift(node, config.max_drift_ms),
        };
        debug!(owner = %secrets.id, node = %node, "replica ready");

        Ok(Arc::new(Self {
            storage: StorageHandle::spawn(store),
            secrets,
            hlc: Mutex::new(hlc),
            clock,
            rng: Mutex::new(rng),
            owner_lock: tokio::sync::Mutex::new(()),
            subscribers: RwLock::new(Vec::new()),
            config,
        }))
    }

    /// Public replica-group id.
    pub fn owner_id(&self) -> OwnerId {
        self.secrets.id
    }

    /// Write authorization presented to relays.
    pub fn write_key(&self) -> WriteKey {
        self.secrets.write_key.clone()
    }

    /// Mnemonic phrase for backup and device linking.
    pub fn mnemonic_phrase(&self) -> String {
        self.secrets.mnemonic.to_string()
    }

    /// Engine configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn storage(&self) -> StorageHandle {
        self.storage.clone()
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Derive an independent deterministic RNG stream (frame padding,
    /// backoff jitter).
    pub(crate) fn fork_rng(&self) -> ChaCha20Rng {
        let mut seed = [0u8; 32];
        self.rng.lock().fill_bytes(&mut seed);
        ChaCha20Rng::from_seed(seed)
    }

    /// Register a subscriber for applied-timestamp notifications.
    pub fn subscribe(&self, subscriber: Arc<dyn QuerySubscribers>) {
        self.subscribers.write().push(subscriber);
    }

    fn notify(&self, timestamps: &[Timestamp]) {
        if timestamps.is_empty() {
            return;
        }
        let owner = self.owner_id();
        for subscriber in self.subscribers.read().iter() {
            subscriber.applied(&owner, timestamps);
        }
    }

    /// Apply local mutations: one timestamp per change, sealed, appended,
    /// projected into history, and queued for upload.
    ///
    /// A clock-drift failure aborts before anything is written or queued.
    pub async fn mutate(&self, changes: Vec<Change>) -> Result<Vec<Timestamp>, EvoluError> {
        let _guard = self.owner_lock.lock().await;
        self.mutate_locked(changes).await
    }

    pub(crate) async fn mutate_locked(
        &self,
        changes: Vec<Change>,
    ) -> Result<Vec<Timestamp>, EvoluError> {
        if changes.is_empty() {
            return Ok(Vec::new());
        }
        let owner = self.owner_id();
        let mut batch = Vec::with_capacity(changes.len());
        {
            let now = self.now_ms();
            let mut hlc = self.hlc.lock();
            let mut rng = self.rng.lock();
            for change in changes {
                let ts = hlc.send(now)?;
                let plaintext = change.to_bytes()?;
                let sealed = evolu_crypto::seal(
                    &self.secrets.encryption_key,
                    &owner,
                    &ts,
                    &plaintext,
                    &mut *rng,
                )?;
                batch.push((ts, change, sealed));
            }
        }
        let last = self.hlc.lock().last();

        let applied = self
            .storage
            .call(move |store| {
                use evolu_protocol::MessageStore;
                let messages: Vec<EncryptedMessage> = batch
                    .iter()
                    .map(|(ts, _, sealed)| EncryptedMessage::new(*ts, sealed.clone()))
                    .collect();
                let applied = store.write_messages(&owner, &messages)?;
                for (ts, change, _) in &batch {
                    store.apply_history(change, ts)?;
                    store.enqueue_pending(&owner, ts)?;
                }
                store.set_clock(&last)?;
                Ok(applied)
            })
            .await?;

        self.notify(&applied);
        Ok(applied)
    }

    /// Integrate messages a session just persisted: decrypt, project into
    /// history, advance the clock, notify. Returns the number of messages
    /// dropped because they failed to decrypt (tampering or key mismatch);
    /// the session itself continues.
    pub(crate) async fn integrate(&self, applied: &[Timestamp]) -> Result<usize, EvoluError> {
        if applied.is_empty() {
            return Ok(0);
        }
        let owner = self.owner_id();
        let key = self.secrets.encryption_key.clone();
        let applied_vec = applied.to_vec();

        let (integrated, failures) = self
            .storage
            .call(move |store| {
                use evolu_protocol::MessageStore;
                let mut integrated = Vec::new();
                let mut failures = 0usize;
                for ts in &applied_vec {
                    let Some(ciphertext) = store.read_change(&owner, ts)? else {
                        continue;
                    };
                    let change = evolu_crypto::open(&key, &owner, ts, &ciphertext)
                        .and_then(|plaintext| Change::from_bytes(&plaintext));
                    match change {
                        Ok(change) => {
                            store.apply_history(&change, ts)?;
                            integrated.push(*ts);
                        }
                        Err(_) => {
                            error!(owner = %owner, ts = ?ts, "dropping undecryptable message");
                            failures += 1;
                        }
                    }
                }
                Ok((integrated, failures))
            })
            .await?;

        {
            let now = self.now_ms();
            let mut hlc = self.hlc.lock();
            for ts in &integrated {
                hlc.receive(*ts, now)?;
            }
        }
        let last = self.hlc.lock().last();
        self.storage.call(move |store| store.set_clock(&last)).await?;

        self.notify(&integrated);
        Ok(failures)
    }

    /// Messages queued for upload, ascending.
    pub async fn pending_messages(&self) -> Result<Vec<EncryptedMessage>, EvoluError> {
        let owner = self.owner_id();
        self.storage
            .call(move |store| store.pending_messages(&owner))
            .await
    }

    /// Drop acknowledged uploads.
    pub(crate) async fn clear_pending(&self, acked: Vec<Timestamp>) -> Result<(), EvoluError> {
        let owner = self.owner_id();
        self.storage
            .call(move |store| store.clear_pending(&owner, &acked))
            .await
    }

    /// Last-writer-wins current value of a register.
    pub async fn current_value(
        &self,
        table: impl Into<String>,
        row: RowId,
        column: impl Into<String>,
    ) -> Result<Option<Value>, EvoluError> {
        let (table, column) = (table.into(), column.into());
        self.storage
            .call(move |store| store.current_value(&table, &row, &column))
            .await
    }

    /// Register history, newest first: time travel over preserved deletes.
    pub async fn register_history(
        &self,
        table: impl Into<String>,
        row: RowId,
        column: impl Into<String>,
    ) -> Result<Vec<(Timestamp, Value)>, EvoluError> {
        let (table, column) = (table.into(), column.into());
        self.storage
            .call(move |store| store.register_history(&table, &row, &column))
            .await
    }

    /// Whether a row is logically deleted.
    pub async fn is_row_deleted(
        &self,
        table: impl Into<String>,
        row: RowId,
    ) -> Result<bool, EvoluError> {
        let table = table.into();
        self.storage
            .call(move |store| store.is_row_deleted(&table, &row))
            .await
    }

    /// Drift guard for incoming timestamps: rejects messages stamped
    /// further in the future than the configured window before anything
    /// is persisted.
    pub(crate) fn drift_guard(&self) -> impl FnMut(&Timestamp) -> Result<(), EvoluError> {
        let now = self.now_ms();
        let max_drift = self.config.max_drift_ms;
        move |ts: &Timestamp| {
            let drift_ms = ts.millis.saturating_sub(now);
            if drift_ms > max_drift {
                return Err(EvoluError::ClockDrift { drift_ms });
            }
            Ok(())
        }
    }
}
