//! Protocol frames and their binary codec.
//!
//! A frame starts with the protocol version byte and a 1-byte kind, then
//! the body. All integers are big-endian; timestamps use their 16-byte
//! order-preserving encoding; byte strings are `u32`-length-prefixed.
//!
//! Range entries carry an exclusive upper bound; entry *i* covers
//! `[upper_{i-1}, upper_i)` with an implicit initial lower bound of
//! [`Timestamp::MIN`]. Timestamps inside a payload must be strictly
//! ascending; violations are rejected at decode time.

use evolu_core::{EncryptedMessage, EvoluError, OwnerId, Timestamp};
use evolu_crypto::{Fingerprint, WriteKey, FINGERPRINT_LEN, WRITE_KEY_LEN};
use evolu_wire::{Reader, WireError, Writer};

/// The protocol version this build speaks.
pub const PROTOCOL_VERSION: u8 = 1;

const KIND_INITIATOR: u8 = 1;
const KIND_NON_INITIATOR: u8 = 2;
const KIND_ERROR: u8 = 3;

const PAYLOAD_SKIP: u8 = 0;
const PAYLOAD_FINGERPRINT: u8 = 1;
const PAYLOAD_TIMESTAMPS: u8 = 2;
const PAYLOAD_TIMESTAMPS_WITH_CHANGES: u8 = 3;

/// Machine-readable error cause carried by an error frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Presented write key does not match the registered one.
    WriteKeyInvalid,
    /// Peer protocol version is not supported.
    VersionUnsupported,
    /// Incoming timestamps are too far from the receiver's wall clock.
    ClockDrift,
    /// Receiver-side persistence failed.
    Storage,
    /// Malformed or out-of-order frame.
    Protocol,
}

impl ErrorCode {
    fn to_byte(self) -> u8 {
        match self {
            ErrorCode::WriteKeyInvalid => 1,
            ErrorCode::VersionUnsupported => 2,
            ErrorCode::ClockDrift => 3,
            ErrorCode::Storage => 4,
            ErrorCode::Protocol => 5,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, WireError> {
        match byte {
            1 => Ok(ErrorCode::WriteKeyInvalid),
            2 => Ok(ErrorCode::VersionUnsupported),
            3 => Ok(ErrorCode::ClockDrift),
            4 => Ok(ErrorCode::Storage),
            5 => Ok(ErrorCode::Protocol),
            tag => Err(WireError::InvalidTag { tag }),
        }
    }

    /// The engine error an incoming error frame surfaces as.
    pub fn to_error(self, detail: &str) -> EvoluError {
        match self {
            ErrorCode::WriteKeyInvalid => EvoluError::WriteKeyInvalid,
            ErrorCode::VersionUnsupported => EvoluError::VersionUnsupported {
                peer: 0,
                ours: PROTOCOL_VERSION,
            },
            ErrorCode::ClockDrift => EvoluError::ClockDrift { drift_ms: 0 },
            ErrorCode::Storage => EvoluError::storage(detail.to_string()),
            ErrorCode::Protocol => EvoluError::protocol(detail.to_string()),
        }
    }

    /// Classify an engine error for the wire.
    pub fn from_error(err: &EvoluError) -> Self {
        match err {
            EvoluError::WriteKeyInvalid => ErrorCode::WriteKeyInvalid,
            EvoluError::VersionUnsupported { .. } => ErrorCode::VersionUnsupported,
            EvoluError::ClockDrift { .. } | EvoluError::CounterOverflow => ErrorCode::ClockDrift,
            EvoluError::Storage { .. } => ErrorCode::Storage,
            _ => ErrorCode::Protocol,
        }
    }
}

/// One reconciliation payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangePayload {
    /// Nothing more needed in this range from the sender's side.
    Skip,
    /// Digest of the sender's timestamps in the range.
    Fingerprint(Fingerprint),
    /// The sender's explicit timestamp inventory. An empty list advertises
    /// an empty range. `has_more` marks a truncated list: it covers only
    /// timestamps up to and including its last element.
    Timestamps {
        /// Strictly ascending inventory.
        timestamps: Vec<Timestamp>,
        /// True when the list was cut short of the range's end.
        has_more: bool,
    },
    /// Data transfer: `requests` are timestamps the sender lacks and asks
    /// for; `items` are messages the sender pushes because the peer
    /// provably lacks them.
    TimestampsWithChanges {
        /// Strictly ascending timestamps the sender wants.
        requests: Vec<Timestamp>,
        /// Strictly ascending (by timestamp) pushed messages.
        items: Vec<EncryptedMessage>,
        /// True when the item list was cut short of the range's end.
        has_more: bool,
    },
}

impl RangePayload {
    /// True for the terminal placeholder.
    pub fn is_skip(&self) -> bool {
        matches!(self, RangePayload::Skip)
    }
}

/// A payload covering the key interval up to `upper`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeEntry {
    /// Exclusive upper bound ([`Timestamp::MAX`] is inclusive as the
    /// key-space sentinel).
    pub upper: Timestamp,
    /// What the sender says about the interval.
    pub payload: RangePayload,
}

impl RangeEntry {
    /// Convenience constructor.
    pub fn new(upper: Timestamp, payload: RangePayload) -> Self {
        Self { upper, payload }
    }
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMessage {
    /// Client-to-relay reconciliation step. Carries authorization on every
    /// frame so the responder can stay stateless.
    Initiator {
        /// Replica group being synced.
        owner: OwnerId,
        /// Write authorization for any attached messages.
        write_key: WriteKey,
        /// Optional write-key rotation, installed atomically when the
        /// presented `write_key` is valid.
        next_write_key: Option<WriteKey>,
        /// Reconciliation step.
        ranges: Vec<RangeEntry>,
    },
    /// Relay-to-client reconciliation step.
    NonInitiator {
        /// Replica group being synced.
        owner: OwnerId,
        /// Reconciliation step; pushed changes ride in range payloads.
        ranges: Vec<RangeEntry>,
    },
    /// Terminal failure notice.
    Error {
        /// Machine-readable cause.
        code: ErrorCode,
        /// Human-readable detail, safe to show in logs.
        detail: String,
    },
}

/// Frame decoding failures, split so version mismatches surface before
/// any attempt to parse an unknown layout.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// First byte is a version this build does not speak.
    #[error("unsupported protocol version {peer}")]
    Version {
        /// Version byte the peer presented.
        peer: u8,
    },
    /// Structurally invalid frame.
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl From<DecodeError> for EvoluError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::Version { peer } => EvoluError::VersionUnsupported {
                peer,
                ours: PROTOCOL_VERSION,
            },
            DecodeError::Wire(wire) => EvoluError::protocol(wire.to_string()),
        }
    }
}

fn put_timestamps(w: &mut Writer, timestamps: &[Timestamp]) -> Result<(), WireError> {
    w.put_count(timestamps.len())?;
    for ts in timestamps {
        w.put_bytes(&ts.encode());
    }
    Ok(())
}

fn read_timestamp(r: &mut Reader<'_>) -> Result<Timestamp, WireError> {
    let bytes = r.bytes(evolu_core::TIMESTAMP_LEN)?;
    Timestamp::decode(bytes).map_err(|_| WireError::Malformed { what: "timestamp" })
}

fn read_timestamps(r: &mut Reader<'_>) -> Result<Vec<Timestamp>, WireError> {
    let count = r.count()?;
    let mut out = Vec::with_capacity(count.min(4096));
    let mut prev: Option<Timestamp> = None;
    for _ in 0..count {
        let ts = read_timestamp(r)?;
        if let Some(p) = prev {
            // Duplicates or disorder within one payload are an error.
            if ts <= p {
                return Err(WireError::Malformed { what: "timestamp order" });
            }
        }
        prev = Some(ts);
        out.push(ts);
    }
    Ok(out)
}

fn put_payload(w: &mut Writer, payload: &RangePayload) -> Result<(), WireError> {
    match payload {
        RangePayload::Skip => w.put_u8(PAYLOAD_SKIP),
        RangePayload::Fingerprint(fp) => {
            w.put_u8(PAYLOAD_FINGERPRINT);
            w.put_bytes(fp.as_bytes());
        }
        RangePayload::Timestamps {
            timestamps,
            has_more,
        } => {
            w.put_u8(PAYLOAD_TIMESTAMPS);
            w.put_u8(u8::from(*has_more));
            put_timestamps(w, timestamps)?;
        }
        RangePayload::TimestampsWithChanges {
            requests,
            items,
            has_more,
        } => {
            w.put_u8(PAYLOAD_TIMESTAMPS_WITH_CHANGES);
            w.put_u8(u8::from(*has_more));
            put_timestamps(w, requests)?;
            w.put_count(items.len())?;
            for item in items {
                w.put_bytes(&item.timestamp.encode());
                w.put_varbytes(&item.ciphertext)?;
            }
        }
    }
    Ok(())
}

fn read_payload(r: &mut Reader<'_>) -> Result<RangePayload, WireError> {
    match r.u8()? {
        PAYLOAD_SKIP => Ok(RangePayload::Skip),
        PAYLOAD_FINGERPRINT => {
            let bytes = r.bytes(FINGERPRINT_LEN)?;
            // Length was just checked.
            let fp = Fingerprint::from_slice(bytes).ok_or(WireError::Malformed { what: "fingerprint" })?;
            Ok(RangePayload::Fingerprint(fp))
        }
        PAYLOAD_TIMESTAMPS => {
            let has_more = r.u8()? != 0;
            let timestamps = read_timestamps(r)?;
            Ok(RangePayload::Timestamps {
                timestamps,
                has_more,
            })
        }
        PAYLOAD_TIMESTAMPS_WITH_CHANGES => {
            let has_more = r.u8()? != 0;
            let requests = read_timestamps(r)?;
            let count = r.count()?;
            let mut items = Vec::with_capacity(count.min(4096));
            let mut prev: Option<Timestamp> = None;
            for _ in 0..count {
                let ts = read_timestamp(r)?;
                if let Some(p) = prev {
                    if ts <= p {
                        return Err(WireError::Malformed { what: "item order" });
                    }
                }
                prev = Some(ts);
                items.push(EncryptedMessage::new(ts, r.varbytes()?.to_vec()));
            }
            Ok(RangePayload::TimestampsWithChanges {
                requests,
                items,
                has_more,
            })
        }
        tag => Err(WireError::InvalidTag { tag }),
    }
}

fn put_ranges(w: &mut Writer, ranges: &[RangeEntry]) -> Result<(), WireError> {
    w.put_count(ranges.len())?;
    for entry in ranges {
        w.put_bytes(&entry.upper.encode());
        put_payload(w, &entry.payload)?;
    }
    Ok(())
}

fn read_ranges(r: &mut Reader<'_>) -> Result<Vec<RangeEntry>, WireError> {
    let count = r.count()?;
    let mut out = Vec::with_capacity(count.min(4096));
    let mut prev: Option<Timestamp> = None;
    for _ in 0..count {
        let upper = read_timestamp(r)?;
        if let Some(p) = prev {
            // Entries must march strictly up the key space.
            if upper <= p {
                return Err(WireError::Malformed { what: "range bounds" });
            }
        }
        prev = Some(upper);
        out.push(RangeEntry::new(upper, read_payload(r)?));
    }
    Ok(out)
}

fn read_owner(r: &mut Reader<'_>) -> Result<OwnerId, WireError> {
    let bytes = r.bytes(evolu_core::identifiers::OWNER_ID_LEN)?;
    OwnerId::from_slice(bytes).ok_or(WireError::Malformed { what: "owner id" })
}

impl ProtocolMessage {
    /// Encode to the (unpadded) frame bytes.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut w = Writer::with_capacity(64);
        w.put_u8(PROTOCOL_VERSION);
        match self {
            ProtocolMessage::Initiator {
                owner,
                write_key,
                next_write_key,
                ranges,
            } => {
                w.put_u8(KIND_INITIATOR);
                w.put_bytes(owner.as_bytes());
                w.put_bytes(write_key.as_bytes());
                match next_write_key {
                    Some(next) => {
                        w.put_u8(1);
                        w.put_bytes(next.as_bytes());
                    }
                    None => w.put_u8(0),
                }
                put_ranges(&mut w, ranges)?;
            }
            ProtocolMessage::NonInitiator { owner, ranges } => {
                w.put_u8(KIND_NON_INITIATOR);
                w.put_bytes(owner.as_bytes());
                put_ranges(&mut w, ranges)?;
            }
            ProtocolMessage::Error { code, detail } => {
                w.put_u8(KIND_ERROR);
                w.put_u8(code.to_byte());
                w.put_varbytes(detail.as_bytes())?;
            }
        }
        Ok(w.into_bytes())
    }

    /// Decode a frame, checking the version byte first.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(bytes);
        let version = r.u8().map_err(WireError::from)?;
        if version != PROTOCOL_VERSION {
            return Err(DecodeError::Version { peer: version });
        }
        let message = match r.u8().map_err(WireError::from)? {
            KIND_INITIATOR => {
                let owner = read_owner(&mut r)?;
                let key_bytes = r.bytes(WRITE_KEY_LEN)?;
                let write_key = WriteKey::from_slice(key_bytes)
                    .ok_or(WireError::Malformed { what: "write key" })?;
                let next_write_key = match r.u8()? {
                    0 => None,
                    1 => {
                        let next = r.bytes(WRITE_KEY_LEN)?;
                        Some(WriteKey::from_slice(next).ok_or(WireError::Malformed { what: "write key" })?)
                    }
                    tag => return Err(WireError::InvalidTag { tag }.into()),
                };
                ProtocolMessage::Initiator {
                    owner,
                    write_key,
                    next_write_key,
                    ranges: read_ranges(&mut r)?,
                }
            }
            KIND_NON_INITIATOR => ProtocolMessage::NonInitiator {
                owner: read_owner(&mut r)?,
                ranges: read_ranges(&mut r)?,
            },
            KIND_ERROR => {
                let code = ErrorCode::from_byte(r.u8()?)?;
                let detail = String::from_utf8_lossy(r.varbytes()?).into_owned();
                ProtocolMessage::Error { code, detail }
            }
            tag => return Err(WireError::InvalidTag { tag }.into()),
        };
        r.expect_end().map_err(WireError::from)?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evolu_core::NodeId;

    fn ts(millis: u64) -> Timestamp {
        Timestamp::new(millis, 0, NodeId::new(1).unwrap()).unwrap()
    }

    fn owner() -> OwnerId {
        OwnerId::from_bytes([8u8; 21])
    }

    fn write_key() -> WriteKey {
        WriteKey::from_bytes([5u8; WRITE_KEY_LEN])
    }

    fn sample_initiator() -> ProtocolMessage {
        ProtocolMessage::Initiator {
            owner: owner(),
            write_key: write_key(),
            next_write_key: None,
            ranges: vec![
                RangeEntry::new(ts(100), RangePayload::Fingerprint(Fingerprint::from_bytes([1; 12]))),
                RangeEntry::new(
                    ts(200),
                    RangePayload::Timestamps {
                        timestamps: vec![ts(120), ts(150)],
                        has_more: false,
                    },
                ),
                RangeEntry::new(
                    Timestamp::MAX,
                    RangePayload::TimestampsWithChanges {
                        requests: vec![ts(300)],
                        items: vec![EncryptedMessage::new(ts(400), vec![1, 2, 3])],
                        has_more: false,
                    },
                ),
            ],
        }
    }

    #[test]
    fn initiator_round_trips() {
        let msg = sample_initiator();
        let bytes = msg.encode().unwrap();
        assert_eq!(ProtocolMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn non_initiator_round_trips() {
        let msg = ProtocolMessage::NonInitiator {
            owner: owner(),
            ranges: vec![RangeEntry::new(Timestamp::MAX, RangePayload::Skip)],
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(ProtocolMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn error_round_trips() {
        let msg = ProtocolMessage::Error {
            code: ErrorCode::WriteKeyInvalid,
            detail: "unknown writer".to_string(),
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(ProtocolMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn rotation_key_round_trips() {
        let msg = ProtocolMessage::Initiator {
            owner: owner(),
            write_key: write_key(),
            next_write_key: Some(WriteKey::from_bytes([6u8; WRITE_KEY_LEN])),
            ranges: vec![],
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(ProtocolMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn wrong_version_is_rejected_before_parsing() {
        let mut bytes = sample_initiator().encode().unwrap();
        bytes[0] = 2;
        assert_eq!(
            ProtocolMessage::decode(&bytes).unwrap_err(),
            DecodeError::Version { peer: 2 }
        );
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let bytes = vec![PROTOCOL_VERSION, 9];
        assert!(matches!(
            ProtocolMessage::decode(&bytes).unwrap_err(),
            DecodeError::Wire(WireError::InvalidTag { tag: 9 })
        ));
    }

    #[test]
    fn descending_range_bounds_are_rejected() {
        let msg = ProtocolMessage::NonInitiator {
            owner: owner(),
            ranges: vec![
                RangeEntry::new(ts(200), RangePayload::Skip),
                RangeEntry::new(ts(100), RangePayload::Skip),
            ],
        };
        let bytes = msg.encode().unwrap();
        assert!(matches!(
            ProtocolMessage::decode(&bytes).unwrap_err(),
            DecodeError::Wire(_)
        ));
    }

    #[test]
    fn duplicate_timestamps_in_a_list_are_rejected() {
        let msg = ProtocolMessage::NonInitiator {
            owner: owner(),
            ranges: vec![RangeEntry::new(
                Timestamp::MAX,
                RangePayload::Timestamps {
                    timestamps: vec![ts(100), ts(100)],
                    has_more: false,
                },
            )],
        };
        let bytes = msg.encode().unwrap();
        assert!(ProtocolMessage::decode(&bytes).is_err());
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let mut bytes = sample_initiator().encode().unwrap();
        bytes.push(0);
        assert!(matches!(
            ProtocolMessage::decode(&bytes).unwrap_err(),
            DecodeError::Wire(WireError::TrailingBytes { .. })
        ));
    }
}
