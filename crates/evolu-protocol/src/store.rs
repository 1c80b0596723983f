//! The narrow storage capability the protocol layer consumes.
//!
//! The reconciliation engine never sees a database handle; it talks to this
//! trait. The SQL-backed implementation lives in `evolu-store`; the
//! [`MemoryStore`] here backs tests and in-process peer-to-peer sync.

use std::collections::BTreeMap;

use evolu_core::{EncryptedMessage, EvoluError, OwnerId, Timestamp, TimestampRange};
use evolu_crypto::{Fingerprint, FingerprintHasher, WriteKey};

/// Message-log operations keyed by owner and timestamp.
///
/// Methods take `&mut self` because the SQL implementation runs writes in
/// transactions; the storage worker serializes all access anyway.
pub trait MessageStore {
    /// Check (and lazily register) a writer's authorization.
    ///
    /// An unknown owner is registered with the presented key and accepted.
    /// A known owner's key is compared in constant time.
    fn validate_write_key(
        &mut self,
        owner: &OwnerId,
        write_key: &WriteKey,
    ) -> Result<bool, EvoluError>;

    /// Replace an owner's write key, authorized by the current one.
    fn rotate_write_key(
        &mut self,
        owner: &OwnerId,
        current: &WriteKey,
        next: &WriteKey,
    ) -> Result<bool, EvoluError>;

    /// Append a batch atomically. Duplicate `(owner, timestamp)` rows are
    /// skipped; any other failure rolls the whole batch back. Returns the
    /// newly inserted timestamps in ascending order.
    fn write_messages(
        &mut self,
        owner: &OwnerId,
        messages: &[EncryptedMessage],
    ) -> Result<Vec<Timestamp>, EvoluError>;

    /// Ciphertext at a log position, if present.
    fn read_change(
        &mut self,
        owner: &OwnerId,
        timestamp: &Timestamp,
    ) -> Result<Option<Vec<u8>>, EvoluError>;

    /// Number of timestamps inside the range.
    fn size(&mut self, owner: &OwnerId, range: &TimestampRange) -> Result<u64, EvoluError>;

    /// Order-insensitive digest of the timestamps inside the range.
    fn fingerprint(
        &mut self,
        owner: &OwnerId,
        range: &TimestampRange,
    ) -> Result<Fingerprint, EvoluError>;

    /// Sorted timestamps inside the range, optionally truncated.
    fn timestamps(
        &mut self,
        owner: &OwnerId,
        range: &TimestampRange,
        limit: Option<usize>,
    ) -> Result<Vec<Timestamp>, EvoluError>;

    /// The `rank`-th smallest timestamp inside the range (zero-based);
    /// drives median splits without full scans.
    fn timestamp_at_rank(
        &mut self,
        owner: &OwnerId,
        range: &TimestampRange,
        rank: u64,
    ) -> Result<Option<Timestamp>, EvoluError>;
}

/// Heap-backed [`MessageStore`].
///
/// Reference implementation for tests and for syncing two replicas inside
/// one process without a relay.
#[derive(Debug, Default)]
pub struct MemoryStore {
    logs: BTreeMap<OwnerId, BTreeMap<Timestamp, Vec<u8>>>,
    write_keys: BTreeMap<OwnerId, WriteKey>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self, owner: &OwnerId) -> Option<&BTreeMap<Timestamp, Vec<u8>>> {
        self.logs.get(owner)
    }

    fn in_range<'a>(
        log: &'a BTreeMap<Timestamp, Vec<u8>>,
        range: &TimestampRange,
    ) -> impl Iterator<Item = (&'a Timestamp, &'a Vec<u8>)> + 'a {
        let range = *range;
        log.range(range.lo..=range.hi)
            .filter(move |(ts, _)| range.contains(ts))
    }
}

impl MessageStore for MemoryStore {
    fn validate_write_key(
        &mut self,
        owner: &OwnerId,
        write_key: &WriteKey,
    ) -> Result<bool, EvoluError> {
        match self.write_keys.get(owner) {
            Some(registered) => Ok(registered == write_key),
            None => {
                self.write_keys.insert(*owner, write_key.clone());
                Ok(true)
            }
        }
    }

    fn rotate_write_key(
        &mut self,
        owner: &OwnerId,
        current: &WriteKey,
        next: &WriteKey,
    ) -> Result<bool, EvoluError> {
        match self.write_keys.get(owner) {
            Some(registered) if registered == current => {
                self.write_keys.insert(*owner, next.clone());
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    fn write_messages(
        &mut self,
        owner: &OwnerId,
        messages: &[EncryptedMessage],
    ) -> Result<Vec<Timestamp>, EvoluError> {
        let log = self.logs.entry(*owner).or_default();
        let mut inserted = Vec::new();
        for message in messages {
            if !log.contains_key(&message.timestamp) {
                log.insert(message.timestamp, message.ciphertext.clone());
                inserted.push(message.timestamp);
            }
        }
        inserted.sort_unstable();
        Ok(inserted)
    }

    fn read_change(
        &mut self,
        owner: &OwnerId,
        timestamp: &Timestamp,
    ) -> Result<Option<Vec<u8>>, EvoluError> {
        Ok(self.log(owner).and_then(|log| log.get(timestamp).cloned()))
    }

    fn size(&mut self, owner: &OwnerId, range: &TimestampRange) -> Result<u64, EvoluError> {
        Ok(self
            .log(owner)
            .map(|log| Self::in_range(log, range).count() as u64)
            .unwrap_or(0))
    }

    fn fingerprint(
        &mut self,
        owner: &OwnerId,
        range: &TimestampRange,
    ) -> Result<Fingerprint, EvoluError> {
        let hasher = FingerprintHasher::for_owner(owner);
        Ok(self
            .log(owner)
            .map(|log| hasher.digest(Self::in_range(log, range).map(|(ts, _)| ts)))
            .unwrap_or(Fingerprint::EMPTY))
    }

    fn timestamps(
        &mut self,
        owner: &OwnerId,
        range: &TimestampRange,
        limit: Option<usize>,
    ) -> Result<Vec<Timestamp>, EvoluError> {
        let limit = limit.unwrap_or(usize::MAX);
        Ok(self
            .log(owner)
            .map(|log| {
                Self::in_range(log, range)
                    .take(limit)
                    .map(|(ts, _)| *ts)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn timestamp_at_rank(
        &mut self,
        owner: &OwnerId,
        range: &TimestampRange,
        rank: u64,
    ) -> Result<Option<Timestamp>, EvoluError> {
        Ok(self.log(owner).and_then(|log| {
            Self::in_range(log, range)
                .nth(rank as usize)
                .map(|(ts, _)| *ts)
        }))
    }
}
