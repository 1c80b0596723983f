//! # Evolu Core
//!
//! Foundation types for the Evolu synchronization engine:
//!
//! - Identifier newtypes ([`OwnerId`], [`NodeId`], [`RowId`])
//! - Hybrid logical clock timestamps with a 16-byte order-preserving codec
//! - The row-column [`Change`] model serialized as self-describing CBOR
//! - The unified [`EvoluError`] surface
//! - Capability seams for wall-clock time ([`Clock`]) and entropy
//! - Engine [`Config`]

pub mod change;
pub mod config;
pub mod effects;
pub mod error;
pub mod identifiers;
pub mod message;
pub mod timestamp;

pub use change::{Change, Value};
pub use config::{Config, Index};
pub use effects::{Clock, ManualClock, SystemClock};
pub use error::EvoluError;
pub use identifiers::{NodeId, OwnerId, RowId};
pub use message::{EncryptedMessage, Message};
pub use timestamp::{
    Hlc, Timestamp, TimestampError, TimestampRange, DEFAULT_MAX_DRIFT_MS, TIMESTAMP_LEN,
};
