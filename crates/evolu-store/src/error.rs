//! SQLite error mapping.
//!
//! SQL detail is logged at debug level only; the error surfaced across the
//! component boundary carries a generic message so production error paths
//! never leak statement text.

use evolu_core::EvoluError;
use tracing::debug;

pub(crate) type StoreResult<T> = Result<T, EvoluError>;

pub(crate) fn db_error(err: rusqlite::Error) -> EvoluError {
    debug!(error = %err, "sqlite operation failed");
    EvoluError::storage("database operation failed")
}
