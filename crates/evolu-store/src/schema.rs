//! Database schema and append-only migrations.
//!
//! Tables:
//!
//! - `message`: the encrypted log, primary key `(owner, ts)`; append-only.
//! - `timestamp`: same key set without payloads; the index behind range
//!   counts, fingerprints, and rank queries.
//! - `write_key`: one row per owner on a relay.
//! - `history`: client-side plaintext projection `(tbl, row, col, value,
//!   ts)`; the source for current-value and time-travel queries.
//! - `pending`: timestamps queued for upload, cleared when a session
//!   settles.
//! - `meta`: key/value cell for `schema_version`, the device `node_id`,
//!   and the persisted clock state.
//!
//! Upgrades only ever add tables or columns. Opening a database written by
//! a newer schema version fails rather than guessing.

use rusqlite::Connection;
use tracing::debug;

use crate::error::{db_error, StoreResult};
use evolu_core::Index;

pub(crate) const VERSION: i64 = 1;

pub(crate) const SCHEMA_VERSION_KEY: &str = "schema_version";
pub(crate) const NODE_ID_KEY: &str = "node_id";
pub(crate) const CLOCK_KEY: &str = "clock";

const CREATE_SQL: &str = "
    CREATE TABLE IF NOT EXISTS message (
        owner  BLOB NOT NULL,
        ts     BLOB NOT NULL,
        change BLOB NOT NULL,
        PRIMARY KEY (owner, ts)
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS timestamp (
        owner BLOB NOT NULL,
        ts    BLOB NOT NULL,
        PRIMARY KEY (owner, ts)
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS write_key (
        owner BLOB NOT NULL PRIMARY KEY,
        key   BLOB NOT NULL
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS history (
        tbl   TEXT NOT NULL,
        row   BLOB NOT NULL,
        col   TEXT NOT NULL,
        value BLOB NOT NULL,
        ts    BLOB NOT NULL,
        PRIMARY KEY (tbl, row, col, ts)
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS pending (
        owner BLOB NOT NULL,
        ts    BLOB NOT NULL,
        PRIMARY KEY (owner, ts)
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS meta (
        key   TEXT NOT NULL PRIMARY KEY,
        value BLOB NOT NULL
    );
";

pub(crate) fn init(conn: &Connection, indexes: &[Index]) -> StoreResult<()> {
    let version = read_version(conn)?;
    if version == 0 {
        create(conn)?;
    } else if version < VERSION {
        upgrade(conn, version)?;
    } else if version > VERSION {
        return Err(evolu_core::EvoluError::storage(format!(
            "database schema version {version} is newer than supported {VERSION}"
        )));
    }
    create_user_indexes(conn, indexes)?;
    Ok(())
}

fn read_version(conn: &Connection) -> StoreResult<i64> {
    let exists: i64 = conn
        .query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'meta'",
            [],
            |row| row.get(0),
        )
        .map_err(db_error)?;
    if exists == 0 {
        return Ok(0);
    }
    conn.query_row(
        "SELECT CAST(value AS INTEGER) FROM meta WHERE key = ?1",
        [SCHEMA_VERSION_KEY],
        |row| row.get(0),
    )
    .map_err(db_error)
}

fn create(conn: &Connection) -> StoreResult<()> {
    debug!("creating schema");
    conn.execute_batch(CREATE_SQL).map_err(db_error)?;
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)",
        rusqlite::params![SCHEMA_VERSION_KEY, VERSION.to_string().into_bytes()],
    )
    .map_err(db_error)?;
    Ok(())
}

fn upgrade(conn: &Connection, from: i64) -> StoreResult<()> {
    debug!(from, to = VERSION, "upgrading schema");
    for version in from..VERSION {
        upgrade_from(conn, version)?;
    }
    conn.execute(
        "UPDATE meta SET value = ?2 WHERE key = ?1",
        rusqlite::params![SCHEMA_VERSION_KEY, VERSION.to_string().into_bytes()],
    )
    .map_err(db_error)?;
    Ok(())
}

fn upgrade_from(conn: &Connection, from: i64) -> StoreResult<()> {
    let _ = conn;
    // Next migration lands here.
    Err(evolu_core::EvoluError::storage(format!(
        "no upgrade path from schema version {from}"
    )))
}

fn safe_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Secondary indexes over the history projection for configured
/// `(table, columns)` pairs.
fn create_user_indexes(conn: &Connection, indexes: &[Index]) -> StoreResult<()> {
    for index in indexes {
        if !safe_identifier(&index.table) || !index.columns.iter().all(|c| safe_identifier(c)) {
            debug!(table = %index.table, "skipping index with non-identifier name");
            continue;
        }
        let name = format!("idx_{}_{}", index.table, index.columns.join("_"));
        // History is keyed by register, so an app-level column index becomes
        // a filtered index on the projection.
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS {name} ON history (col, row, ts) WHERE tbl = '{}'",
            index.table
        );
        conn.execute_batch(&sql).map_err(db_error)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn fresh_database_gets_current_version() {
        let conn = open();
        init(&conn, &[]).unwrap();
        assert_eq!(read_version(&conn).unwrap(), VERSION);
        // Idempotent.
        init(&conn, &[]).unwrap();
    }

    #[test]
    fn future_schema_versions_are_rejected() {
        let conn = open();
        init(&conn, &[]).unwrap();
        conn.execute(
            "UPDATE meta SET value = ?2 WHERE key = ?1",
            rusqlite::params![SCHEMA_VERSION_KEY, b"99".to_vec()],
        )
        .unwrap();
        assert!(init(&conn, &[]).is_err());
    }

    #[test]
    fn user_indexes_are_created_for_safe_names() {
        let conn = open();
        let indexes = vec![
            Index {
                table: "todo".to_string(),
                columns: vec!["title".to_string()],
            },
            Index {
                table: "bad name; drop".to_string(),
                columns: vec!["x".to_string()],
            },
        ];
        init(&conn, &indexes).unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'index' AND name = 'idx_todo_title'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
        let bad: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'index' AND name LIKE 'idx_bad%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(bad, 0);
    }
}
