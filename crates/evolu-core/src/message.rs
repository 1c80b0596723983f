//! The unit of replication.

use crate::identifiers::OwnerId;
use crate::timestamp::Timestamp;

/// An encrypted change at its log position, without the owner (the
/// surrounding API names the owner once for a whole batch).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedMessage {
    /// Globally unique position within the owner's log.
    pub timestamp: Timestamp,
    /// Sealed change body; opaque to relays.
    pub ciphertext: Vec<u8>,
}

impl EncryptedMessage {
    /// Pair a timestamp with its sealed change.
    pub fn new(timestamp: Timestamp, ciphertext: Vec<u8>) -> Self {
        Self {
            timestamp,
            ciphertext,
        }
    }
}

/// A fully addressed message, identity `(owner, timestamp)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Replica group the message belongs to.
    pub owner: OwnerId,
    /// Globally unique position within the owner's log.
    pub timestamp: Timestamp,
    /// Sealed change body.
    pub ciphertext: Vec<u8>,
}
