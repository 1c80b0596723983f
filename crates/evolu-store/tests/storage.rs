//! Storage engine behavior over real SQLite databases.

use evolu_core::{
    Change, Config, EncryptedMessage, NodeId, OwnerId, RowId, Timestamp, TimestampRange, Value,
};
use evolu_protocol::{MemoryStore, MessageStore};
use evolu_store::SqliteStore;
use proptest::prelude::*;

fn store() -> SqliteStore {
    SqliteStore::open_in_memory(&Config::default()).unwrap()
}

fn owner() -> OwnerId {
    OwnerId::from_bytes([3u8; 21])
}

fn node(n: u64) -> NodeId {
    NodeId::new(n).unwrap()
}

fn ts(millis: u64) -> Timestamp {
    Timestamp::new(millis, 0, node(1)).unwrap()
}

fn message(millis: u64) -> EncryptedMessage {
    EncryptedMessage::new(ts(millis), millis.to_be_bytes().to_vec())
}

#[test]
fn last_writer_wins_at_column_granularity() {
    let mut store = store();
    let row = RowId::from_bytes([9u8; 21]);

    let earlier = Timestamp::new(100, 0, node(1)).unwrap();
    let later = Timestamp::new(100, 1, node(2)).unwrap();
    let first = Change::set("todo", row, "title", Value::Text("draft".into()));
    let second = Change::set("todo", row, "title", Value::Text("final".into()));

    // Application order does not matter, only timestamps do.
    store.apply_history(&second, &later).unwrap();
    store.apply_history(&first, &earlier).unwrap();

    assert_eq!(
        store.current_value("todo", &row, "title").unwrap(),
        Some(Value::Text("final".into()))
    );

    let history = store.register_history("todo", &row, "title").unwrap();
    assert_eq!(
        history,
        vec![
            (later, Value::Text("final".into())),
            (earlier, Value::Text("draft".into())),
        ]
    );
}

#[test]
fn delete_marker_hides_the_row_but_keeps_history() {
    let mut store = store();
    let row = RowId::from_bytes([7u8; 21]);

    let create = Change::set("todo", row, "title", Value::Text("buy milk".into()));
    store.apply_history(&create, &ts(1)).unwrap();
    assert!(!store.is_row_deleted("todo", &row).unwrap());

    let delete = Change::delete("todo", row);
    store.apply_history(&delete, &ts(2)).unwrap();
    assert!(store.is_row_deleted("todo", &row).unwrap());

    // No tombstone: the title register still answers queries.
    assert_eq!(
        store.current_value("todo", &row, "title").unwrap(),
        Some(Value::Text("buy milk".into()))
    );
}

#[test]
fn history_application_is_idempotent() {
    let mut store = store();
    let row = RowId::from_bytes([1u8; 21]);
    let change = Change::set("todo", row, "done", Value::Int(1));

    store.apply_history(&change, &ts(5)).unwrap();
    store.apply_history(&change, &ts(5)).unwrap();

    assert_eq!(store.register_history("todo", &row, "done").unwrap().len(), 1);
}

#[test]
fn pending_queue_round_trips_through_acknowledgement() {
    let mut store = store();
    store
        .write_messages(&owner(), &[message(1), message(2), message(3)])
        .unwrap();
    store.enqueue_pending(&owner(), &ts(1)).unwrap();
    store.enqueue_pending(&owner(), &ts(3)).unwrap();

    let pending = store.pending_messages(&owner()).unwrap();
    assert_eq!(
        pending.iter().map(|m| m.timestamp).collect::<Vec<_>>(),
        vec![ts(1), ts(3)]
    );
    assert_eq!(pending[0].ciphertext, 1u64.to_be_bytes().to_vec());

    store.clear_pending(&owner(), &[ts(1), ts(3)]).unwrap();
    assert!(store.pending_messages(&owner()).unwrap().is_empty());
}

#[test]
fn node_id_and_clock_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replica.db");
    let config = Config::default();

    let last = Timestamp::new(42, 7, node(99)).unwrap();
    {
        let store = SqliteStore::open(&path, &config).unwrap();
        assert!(store.node_id().unwrap().is_none());
        store.set_node_id(node(99)).unwrap();
        store.set_clock(&last).unwrap();
    }

    let store = SqliteStore::open(&path, &config).unwrap();
    assert_eq!(store.node_id().unwrap(), Some(node(99)));
    assert_eq!(store.clock().unwrap(), Some(last));
}

#[test]
fn messages_survive_reopen_byte_for_byte() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replica.db");
    let config = Config::default();

    {
        let mut store = SqliteStore::open(&path, &config).unwrap();
        store
            .write_messages(&owner(), &[message(10), message(20)])
            .unwrap();
    }

    let mut store = SqliteStore::open(&path, &config).unwrap();
    assert_eq!(
        store.read_change(&owner(), &ts(10)).unwrap(),
        Some(10u64.to_be_bytes().to_vec())
    );
    assert_eq!(store.size(&owner(), &TimestampRange::full()).unwrap(), 2);
}

#[test]
fn owners_are_isolated() {
    let mut store = store();
    let other = OwnerId::from_bytes([4u8; 21]);
    store.write_messages(&owner(), &[message(1)]).unwrap();

    assert_eq!(store.size(&other, &TimestampRange::full()).unwrap(), 0);
    assert!(store.read_change(&other, &ts(1)).unwrap().is_none());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// The SQL engine answers every range query exactly like the in-memory
    /// reference implementation.
    #[test]
    fn sql_matches_the_reference_store(
        millis in proptest::collection::btree_set(0u64..5_000, 0..80),
        lo in 0u64..5_000,
        span in 0u64..5_000,
        rank in 0u64..100,
    ) {
        let mut sql = store();
        let mut reference = MemoryStore::new();
        let batch: Vec<EncryptedMessage> = millis.iter().map(|m| message(*m)).collect();
        sql.write_messages(&owner(), &batch).unwrap();
        reference.write_messages(&owner(), &batch).unwrap();

        let hi = lo.saturating_add(span);
        let range = TimestampRange::new(ts(lo), ts(hi));
        for range in [range, TimestampRange::full()] {
            prop_assert_eq!(
                sql.size(&owner(), &range).unwrap(),
                reference.size(&owner(), &range).unwrap()
            );
            prop_assert_eq!(
                sql.timestamps(&owner(), &range, None).unwrap(),
                reference.timestamps(&owner(), &range, None).unwrap()
            );
            prop_assert_eq!(
                sql.fingerprint(&owner(), &range).unwrap(),
                reference.fingerprint(&owner(), &range).unwrap()
            );
            prop_assert_eq!(
                sql.timestamp_at_rank(&owner(), &range, rank).unwrap(),
                reference.timestamp_at_rank(&owner(), &range, rank).unwrap()
            );
        }
    }

    /// Fingerprints over adjacent ranges XOR to the whole.
    #[test]
    fn fingerprints_are_linear(
        millis in proptest::collection::btree_set(0u64..5_000, 0..60),
        split in 0u64..5_000,
    ) {
        let mut sql = store();
        let batch: Vec<EncryptedMessage> = millis.iter().map(|m| message(*m)).collect();
        sql.write_messages(&owner(), &batch).unwrap();

        let left = TimestampRange::new(Timestamp::MIN, ts(split));
        let right = TimestampRange::new(ts(split), Timestamp::MAX);
        let mut combined = sql.fingerprint(&owner(), &left).unwrap();
        combined.xor_assign(&sql.fingerprint(&owner(), &right).unwrap());
        prop_assert_eq!(
            combined,
            sql.fingerprint(&owner(), &TimestampRange::full()).unwrap()
        );
    }
}
