//! SQLite-backed storage engine.
//!
//! One database file per replica. The same engine serves both roles: a
//! client uses the message log plus the history projection and upload
//! queue; a relay uses the log and the write-key table only.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use evolu_core::{
    Change, Config, EncryptedMessage, EvoluError, NodeId, OwnerId, RowId, Timestamp,
    TimestampRange, Value,
};
use evolu_crypto::{Fingerprint, FingerprintHasher, WriteKey};
use evolu_protocol::MessageStore;

use crate::error::{db_error, StoreResult};
use crate::schema;

/// The storage engine. Owned exclusively by the storage worker thread.
pub struct SqliteStore {
    conn: Connection,
}

fn ts_blob(ts: &Timestamp) -> Vec<u8> {
    ts.encode().to_vec()
}

/// Exclusive upper bound as bytes. [`Timestamp::MAX`] is an inclusive
/// sentinel; all-ones sorts above every valid encoding (their top two bytes
/// are zero), so one `ts < hi` query shape serves both cases.
fn upper_blob(range: &TimestampRange) -> Vec<u8> {
    if range.hi == Timestamp::MAX {
        vec![0xff; evolu_core::TIMESTAMP_LEN]
    } else {
        ts_blob(&range.hi)
    }
}

fn decode_ts(blob: &[u8]) -> StoreResult<Timestamp> {
    Timestamp::decode(blob).map_err(|_| EvoluError::storage("corrupt timestamp in index"))
}

fn decode_value(blob: &[u8]) -> StoreResult<Value> {
    serde_cbor::from_slice(blob).map_err(|_| EvoluError::storage("corrupt value in history"))
}

impl SqliteStore {
    /// Open (creating if needed) the database file for a replica.
    pub fn open(path: &Path, config: &Config) -> StoreResult<Self> {
        let conn = Connection::open(path).map_err(db_error)?;
        Self::setup(conn, config)
    }

    /// Open a throwaway in-memory database.
    pub fn open_in_memory(config: &Config) -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_error)?;
        Self::setup(conn, config)
    }

    fn setup(conn: Connection, config: &Config) -> StoreResult<Self> {
        // journal_mode returns a row, so this goes through the exec path.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_error)?;
        schema::init(&conn, &config.indexes)?;
        Ok(Self { conn })
    }

    fn meta(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.conn
            .query_row("SELECT value FROM meta WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(db_error)
    }

    fn set_meta(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.conn
            .execute(
                "INSERT INTO meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(db_error)?;
        Ok(())
    }

    /// The persisted device node id, if one was stored.
    pub fn node_id(&self) -> StoreResult<Option<NodeId>> {
        match self.meta(schema::NODE_ID_KEY)? {
            Some(blob) if blob.len() == 6 => {
                let mut bytes = [0u8; 6];
                bytes.copy_from_slice(&blob);
                Ok(Some(NodeId::from_bytes(bytes)))
            }
            Some(_) => Err(EvoluError::storage("corrupt node id")),
            None => Ok(None),
        }
    }

    /// Persist the device node id; done once at replica creation.
    pub fn set_node_id(&self, node: NodeId) -> StoreResult<()> {
        self.set_meta(schema::NODE_ID_KEY, &node.to_bytes())
    }

    /// The persisted clock state, for resuming the HLC across restarts.
    pub fn clock(&self) -> StoreResult<Option<Timestamp>> {
        match self.meta(schema::CLOCK_KEY)? {
            Some(blob) => Ok(Some(decode_ts(&blob)?)),
            None => Ok(None),
        }
    }

    /// Persist the clock state.
    pub fn set_clock(&self, last: &Timestamp) -> StoreResult<()> {
        self.set_meta(schema::CLOCK_KEY, &last.encode())
    }

    /// Record a plaintext change in the history projection. Idempotent per
    /// `(register, timestamp)`.
    pub fn apply_history(&mut self, change: &Change, ts: &Timestamp) -> StoreResult<()> {
        let value =
            serde_cbor::to_vec(&change.value).map_err(|e| EvoluError::serialization(e.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO history (tbl, row, col, value, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    change.table,
                    change.row.as_bytes().as_slice(),
                    change.column,
                    value,
                    ts_blob(ts)
                ],
            )
            .map_err(db_error)?;
        Ok(())
    }

    /// Last-writer-wins current value of a register.
    pub fn current_value(
        &self,
        table: &str,
        row: &RowId,
        column: &str,
    ) -> StoreResult<Option<Value>> {
        let blob: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT value FROM history
                 WHERE tbl = ?1 AND row = ?2 AND col = ?3
                 ORDER BY ts DESC LIMIT 1",
                params![table, row.as_bytes().as_slice(), column],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_error)?;
        blob.map(|b| decode_value(&b)).transpose()
    }

    /// Full history of a register, newest first.
    pub fn register_history(
        &self,
        table: &str,
        row: &RowId,
        column: &str,
    ) -> StoreResult<Vec<(Timestamp, Value)>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT ts, value FROM history
                 WHERE tbl = ?1 AND row = ?2 AND col = ?3
                 ORDER BY ts DESC",
            )
            .map_err(db_error)?;
        let rows = stmt
            .query_map(params![table, row.as_bytes().as_slice(), column], |r| {
                Ok((r.get::<_, Vec<u8>>(0)?, r.get::<_, Vec<u8>>(1)?))
            })
            .map_err(db_error)?;
        let mut out = Vec::new();
        for row in rows {
            let (ts, value) = row.map_err(db_error)?;
            out.push((decode_ts(&ts)?, decode_value(&value)?));
        }
        Ok(out)
    }

    /// A row is deleted when its `isDeleted` register is truthy at the
    /// latest timestamp. History stays queryable either way.
    pub fn is_row_deleted(&self, table: &str, row: &RowId) -> StoreResult<bool> {
        Ok(self
            .current_value(table, row, evolu_core::change::IS_DELETED_COLUMN)?
            .map(|v| v.is_truthy())
            .unwrap_or(false))
    }

    /// Queue a locally produced message for upload.
    pub fn enqueue_pending(&mut self, owner: &OwnerId, ts: &Timestamp) -> StoreResult<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO pending (owner, ts) VALUES (?1, ?2)",
                params![owner.as_bytes().as_slice(), ts_blob(ts)],
            )
            .map_err(db_error)?;
        Ok(())
    }

    /// Queued messages with their ciphertexts, ascending.
    pub fn pending_messages(&self, owner: &OwnerId) -> StoreResult<Vec<EncryptedMessage>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT p.ts, m.change FROM pending p
                 JOIN message m ON m.owner = p.owner AND m.ts = p.ts
                 WHERE p.owner = ?1 ORDER BY p.ts ASC",
            )
            .map_err(db_error)?;
        let rows = stmt
            .query_map(params![owner.as_bytes().as_slice()], |r| {
                Ok((r.get::<_, Vec<u8>>(0)?, r.get::<_, Vec<u8>>(1)?))
            })
            .map_err(db_error)?;
        let mut out = Vec::new();
        for row in rows {
            let (ts, ciphertext) = row.map_err(db_error)?;
            out.push(EncryptedMessage::new(decode_ts(&ts)?, ciphertext));
        }
        Ok(out)
    }

    /// Drop acknowledged uploads from the queue.
    pub fn clear_pending(&mut self, owner: &OwnerId, acked: &[Timestamp]) -> StoreResult<()> {
        let tx = self.conn.transaction().map_err(db_error)?;
        {
            let mut stmt = tx
                .prepare_cached("DELETE FROM pending WHERE owner = ?1 AND ts = ?2")
                .map_err(db_error)?;
            for ts in acked {
                stmt.execute(params![owner.as_bytes().as_slice(), ts_blob(ts)])
                    .map_err(db_error)?;
            }
        }
        tx.commit().map_err(db_error)
    }
}

impl MessageStore for SqliteStore {
    fn validate_write_key(
        &mut self,
        owner: &OwnerId,
        write_key: &WriteKey,
    ) -> Result<bool, EvoluError> {
        let registered: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT key FROM write_key WHERE owner = ?1",
                params![owner.as_bytes().as_slice()],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_error)?;
        match registered {
            Some(blob) => {
                let registered = WriteKey::from_slice(&blob)
                    .ok_or_else(|| EvoluError::storage("corrupt write key"))?;
                Ok(registered == *write_key)
            }
            None => {
                debug!(owner = %owner, "registering new owner");
                self.conn
                    .execute(
                        "INSERT INTO write_key (owner, key) VALUES (?1, ?2)",
                        params![owner.as_bytes().as_slice(), write_key.as_bytes().as_slice()],
                    )
                    .map_err(db_error)?;
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
        let tx = self.conn.transaction().map_err(db_error)?;
        let registered: Option<Vec<u8>> = tx
            .query_row(
                "SELECT key FROM write_key WHERE owner = ?1",
                params![owner.as_bytes().as_slice()],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_error)?;
        let authorized = match registered {
            Some(blob) => {
                WriteKey::from_slice(&blob).map(|k| k == *current).unwrap_or(false)
            }
            None => false,
        };
        if !authorized {
            return Ok(false);
        }
        tx.execute(
            "UPDATE write_key SET key = ?2 WHERE owner = ?1",
            params![owner.as_bytes().as_slice(), next.as_bytes().as_slice()],
        )
        .map_err(db_error)?;
        tx.commit().map_err(db_error)?;
        Ok(true)
    }

    fn write_messages(
        &mut self,
        owner: &OwnerId,
        messages: &[EncryptedMessage],
    ) -> Result<Vec<Timestamp>, EvoluError> {
        let tx = self.conn.transaction().map_err(db_error)?;
        let mut applied = Vec::new();
        {
            let mut insert_message = tx
                .prepare_cached(
                    "INSERT OR IGNORE INTO message (owner, ts, change) VALUES (?1, ?2, ?3)",
                )
                .map_err(db_error)?;
            let mut insert_index = tx
                .prepare_cached("INSERT INTO timestamp (owner, ts) VALUES (?1, ?2)")
                .map_err(db_error)?;
            for message in messages {
                let inserted = insert_message
                    .execute(params![
                        owner.as_bytes().as_slice(),
                        ts_blob(&message.timestamp),
                        message.ciphertext
                    ])
                    .map_err(db_error)?;
                if inserted == 1 {
                    // The index insert is deliberately strict: a failure
                    // here aborts the whole batch.
                    insert_index
                        .execute(params![
                            owner.as_bytes().as_slice(),
                            ts_blob(&message.timestamp)
                        ])
                        .map_err(db_error)?;
                    applied.push(message.timestamp);
                }
            }
        }
        tx.commit().map_err(db_error)?;
        applied.sort_unstable();
        Ok(applied)
    }

    fn read_change(
        &mut self,
        owner: &OwnerId,
        timestamp: &Timestamp,
    ) -> Result<Option<Vec<u8>>, EvoluError> {
        self.conn
            .query_row(
                "SELECT change FROM message WHERE owner = ?1 AND ts = ?2",
                params![owner.as_bytes().as_slice(), ts_blob(timestamp)],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_error)
    }

    fn size(&mut self, owner: &OwnerId, range: &TimestampRange) -> Result<u64, EvoluError> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT count(*) FROM timestamp
                 WHERE owner = ?1 AND ts >= ?2 AND ts < ?3",
                params![
                    owner.as_bytes().as_slice(),
                    ts_blob(&range.lo),
                    upper_blob(range)
                ],
                |r| r.get(0),
            )
            .map_err(db_error)?;
        Ok(count as u64)
    }

    fn fingerprint(
        &mut self,
        owner: &OwnerId,
        range: &TimestampRange,
    ) -> Result<Fingerprint, EvoluError> {
        let hasher = FingerprintHasher::for_owner(owner);
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT ts FROM timestamp
                 WHERE owner = ?1 AND ts >= ?2 AND ts < ?3",
            )
            .map_err(db_error)?;
        let rows = stmt
            .query_map(
                params![
                    owner.as_bytes().as_slice(),
                    ts_blob(&range.lo),
                    upper_blob(range)
                ],
                |r| r.get::<_, Vec<u8>>(0),
            )
            .map_err(db_error)?;
        let mut fp = Fingerprint::EMPTY;
        for row in rows {
            let ts = decode_ts(&row.map_err(db_error)?)?;
            fp.xor_assign(&hasher.hash(&ts));
        }
        Ok(fp)
    }

    fn timestamps(
        &mut self,
        owner: &OwnerId,
        range: &TimestampRange,
        limit: Option<usize>,
    ) -> Result<Vec<Timestamp>, EvoluError> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT ts FROM timestamp
                 WHERE owner = ?1 AND ts >= ?2 AND ts < ?3
                 ORDER BY ts ASC LIMIT ?4",
            )
            .map_err(db_error)?;
        let rows = stmt
            .query_map(
                params![
                    owner.as_bytes().as_slice(),
                    ts_blob(&range.lo),
                    upper_blob(range),
                    limit
                ],
                |r| r.get::<_, Vec<u8>>(0),
            )
            .map_err(db_error)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(decode_ts(&row.map_err(db_error)?)?);
        }
        Ok(out)
    }

    fn timestamp_at_rank(
        &mut self,
        owner: &OwnerId,
        range: &TimestampRange,
        rank: u64,
    ) -> Result<Option<Timestamp>, EvoluError> {
        let blob: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT ts FROM timestamp
                 WHERE owner = ?1 AND ts >= ?2 AND ts < ?3
                 ORDER BY ts ASC LIMIT 1 OFFSET ?4",
                params![
                    owner.as_bytes().as_slice(),
                    ts_blob(&range.lo),
                    upper_blob(range),
                    rank as i64
                ],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_error)?;
        blob.map(|b| decode_ts(&b)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use evolu_core::NodeId;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory(&Config::default()).unwrap()
    }

    fn owner() -> OwnerId {
        OwnerId::from_bytes([1u8; 21])
    }

    fn ts(millis: u64) -> Timestamp {
        Timestamp::new(millis, 0, NodeId::new(1).unwrap()).unwrap()
    }

    fn message(millis: u64) -> EncryptedMessage {
        EncryptedMessage::new(ts(millis), vec![millis as u8; 4])
    }

    /// A failed index insert rolls back the whole batch: messages written
    /// earlier in the batch disappear and fingerprints are unchanged.
    #[test]
    fn failed_batch_leaves_no_trace() {
        let mut store = store();
        store
            .write_messages(&owner(), &[message(1), message(2)])
            .unwrap();
        let fp_before = store.fingerprint(&owner(), &TimestampRange::full()).unwrap();

        // Poison the index: a timestamp row without its message row makes
        // the strict index insert collide mid-batch.
        store
            .conn
            .execute(
                "INSERT INTO timestamp (owner, ts) VALUES (?1, ?2)",
                params![owner().as_bytes().as_slice(), ts_blob(&ts(8))],
            )
            .unwrap();

        let err = store
            .write_messages(&owner(), &[message(5), message(8), message(9)])
            .unwrap_err();
        assert_matches!(err, EvoluError::Storage { .. });

        // Nothing from the batch survived, including the message accepted
        // before the failure.
        assert!(store.read_change(&owner(), &ts(5)).unwrap().is_none());
        assert!(store.read_change(&owner(), &ts(9)).unwrap().is_none());
        assert_eq!(
            store.fingerprint(&owner(), &TimestampRange::full()).unwrap(),
            fp_before
        );
    }

    #[test]
    fn duplicate_rows_inside_a_batch_are_skipped() {
        let mut store = store();
        store.write_messages(&owner(), &[message(3)]).unwrap();
        let applied = store
            .write_messages(&owner(), &[message(3), message(4)])
            .unwrap();
        assert_eq!(applied, vec![ts(4)]);
        assert_eq!(store.size(&owner(), &TimestampRange::full()).unwrap(), 2);
    }
}
