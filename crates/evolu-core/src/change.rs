//! Row-column mutations, the plaintext of every replicated message.
//!
//! A [`Change`] targets one register `(table, row, column)` and carries the
//! new [`Value`]. Serialization is self-describing CBOR so the format stays
//! schema-agnostic: a replica can store and forward changes for tables it
//! has never heard of.

use crate::error::EvoluError;
use crate::identifiers::RowId;
use serde::{Deserialize, Serialize};

/// Column name of the logical-delete register.
///
/// No tombstone is ever written: deleting a row sets this register to a
/// truthy value and history stays intact.
pub const IS_DELETED_COLUMN: &str = "isDeleted";

/// A typed scalar cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// UTF-8 text.
    Text(String),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Real(f64),
    /// Opaque binary blob.
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
}

impl Value {
    /// SQL-NULL check, used by the delete-marker convention.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Truthiness of the `isDeleted` register.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Int(v) => *v != 0,
            Value::Real(v) => *v != 0.0,
            Value::Text(v) => !v.is_empty(),
            Value::Bytes(v) => !v.is_empty(),
        }
    }
}

/// One row-column mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Application table name.
    pub table: String,
    /// Target row.
    pub row: RowId,
    /// Target column; `(row, column)` identifies the register.
    pub column: String,
    /// New value, last-writer-wins by timestamp.
    pub value: Value,
}

impl Change {
    /// Build a mutation.
    pub fn set(
        table: impl Into<String>,
        row: RowId,
        column: impl Into<String>,
        value: Value,
    ) -> Self {
        Self {
            table: table.into(),
            row,
            column: column.into(),
            value,
        }
    }

    /// Build the logical-delete mutation for a row.
    pub fn delete(table: impl Into<String>, row: RowId) -> Self {
        Self::set(table, row, IS_DELETED_COLUMN, Value::Int(1))
    }

    /// Serialize to the CBOR plaintext fed into the crypto envelope.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EvoluError> {
        serde_cbor::to_vec(self).map_err(|e| EvoluError::serialization(e.to_string()))
    }

    /// Deserialize a decrypted plaintext.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EvoluError> {
        serde_cbor::from_slice(bytes).map_err(|e| EvoluError::serialization(e.to_string()))
    }
}
