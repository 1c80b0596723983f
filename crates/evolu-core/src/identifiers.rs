//! Core identifier types used across the engine.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length in bytes of an [`OwnerId`].
pub const OWNER_ID_LEN: usize = 21;

/// Length in bytes of a [`RowId`].
pub const ROW_ID_LEN: usize = 21;

/// Node ids fit in 48 bits so they pack into the timestamp codec.
pub const NODE_ID_MAX: u64 = (1 << 48) - 1;

/// Replica-group identifier.
///
/// Public: the relay indexes messages by it, and anyone holding the id may
/// fetch the (encrypted) log. The encryption key and write key derived from
/// the same mnemonic stay secret.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId(pub [u8; OWNER_ID_LEN]);

impl OwnerId {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; OWNER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Create from a byte slice, failing on length mismatch.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; OWNER_ID_LEN]>::try_from(bytes).ok().map(Self)
    }

    /// Generate a random owner id.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; OWNER_ID_LEN];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; OWNER_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerId({self})")
    }
}

/// Per-device clock identity.
///
/// A random 48-bit value making timestamps from distinct devices unequal
/// even at identical wall time and counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    /// Smallest node id.
    pub const MIN: NodeId = NodeId(0);

    /// Largest node id.
    pub const MAX: NodeId = NodeId(NODE_ID_MAX);

    /// Create from a raw value, failing when it exceeds 48 bits.
    pub fn new(value: u64) -> Option<Self> {
        (value <= NODE_ID_MAX).then_some(Self(value))
    }

    /// Generate a random node id.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(rng.next_u64() & NODE_ID_MAX)
    }

    /// Inner value, guaranteed to fit 48 bits.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Big-endian 6-byte encoding, the tail of the timestamp codec.
    pub fn to_bytes(self) -> [u8; 6] {
        let be = self.0.to_be_bytes();
        [be[2], be[3], be[4], be[5], be[6], be[7]]
    }

    /// Decode from the 6-byte big-endian form.
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        let mut be = [0u8; 8];
        be[2..].copy_from_slice(&bytes);
        Self(u64::from_be_bytes(be))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:012x}", self.0)
    }
}

/// Row identifier within a table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId(pub [u8; ROW_ID_LEN]);

impl RowId {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; ROW_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a random row id.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; ROW_ID_LEN];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; ROW_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowId({self})")
    }
}
