//! Hybrid logical clock timestamps.
//!
//! A [`Timestamp`] combines 48 bits of wall-clock milliseconds, a 16-bit
//! counter for events within one millisecond, and a 48-bit per-device
//! [`NodeId`]. The triple is totally ordered and the 16-byte big-endian
//! encoding preserves that order under `memcmp`, so storage can index and
//! range-scan timestamps as plain byte strings.
//!
//! [`Hlc`] is the clock state machine: `send` produces a strictly increasing
//! timestamp for local mutations, `receive` merges a remote timestamp so that
//! later local sends dominate it.
//!
//! Kulkarni, Demirbas, et al. "Logical Physical Clocks and Consistent
//! Snapshots in Globally Distributed Databases" (2014).

use crate::identifiers::NodeId;
use serde::{Deserialize, Serialize};

/// Size of the binary timestamp encoding.
pub const TIMESTAMP_LEN: usize = 16;

/// Milliseconds are carried in 48 bits.
pub const MILLIS_MAX: u64 = (1 << 48) - 1;

/// Default clock-drift rejection window: five minutes.
pub const DEFAULT_MAX_DRIFT_MS: u64 = 5 * 60 * 1000;

/// Errors raised by timestamp generation and decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimestampError {
    /// The local clock is outside the acceptable window.
    #[error("clock drift of {drift_ms} ms exceeds the allowed window")]
    ClockDrift {
        /// Distance between the clock value in use and the wall clock.
        drift_ms: u64,
    },

    /// More than 65535 events inside one millisecond.
    #[error("counter overflow within a single millisecond")]
    CounterOverflow,

    /// Wall-clock milliseconds no longer fit 48 bits.
    #[error("physical time overflows 48 bits")]
    MillisOverflow,

    /// Binary input was not exactly [`TIMESTAMP_LEN`] bytes.
    #[error("timestamp must be {TIMESTAMP_LEN} bytes, got {len}")]
    InvalidLength {
        /// Length of the rejected input.
        len: usize,
    },
}

/// A hybrid logical clock timestamp.
///
/// Ordering is lexicographic over `(millis, counter, node)`, which the
/// derived `Ord` provides because the fields are declared in that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Wall-clock milliseconds since the Unix epoch, at most 48 bits.
    pub millis: u64,
    /// Events within the same millisecond.
    pub counter: u16,
    /// Device that produced the timestamp.
    pub node: NodeId,
}

impl Timestamp {
    /// Smallest possible timestamp; lower bound of every range.
    pub const MIN: Timestamp = Timestamp {
        millis: 0,
        counter: 0,
        node: NodeId::MIN,
    };

    /// Largest possible timestamp; upper bound of the full key space.
    pub const MAX: Timestamp = Timestamp {
        millis: MILLIS_MAX,
        counter: u16::MAX,
        node: NodeId::MAX,
    };

    /// Build a timestamp, rejecting millis above 48 bits.
    pub fn new(millis: u64, counter: u16, node: NodeId) -> Result<Self, TimestampError> {
        if millis > MILLIS_MAX {
            return Err(TimestampError::MillisOverflow);
        }
        Ok(Self {
            millis,
            counter,
            node,
        })
    }

    /// 16-byte big-endian encoding: 8 bytes millis (top two always zero),
    /// 2 bytes counter, 6 bytes node.
    pub fn encode(&self) -> [u8; TIMESTAMP_LEN] {
        let mut out = [0u8; TIMESTAMP_LEN];
        out[..8].copy_from_slice(&self.millis.to_be_bytes());
        out[8..10].copy_from_slice(&self.counter.to_be_bytes());
        out[10..].copy_from_slice(&self.node.to_bytes());
        out
    }

    /// The immediately following timestamp in key order, `None` at the top
    /// of the key space. Range splitting uses this to build half-open
    /// boundaries out of concrete timestamps.
    pub fn successor(&self) -> Option<Timestamp> {
        if let Some(node) = NodeId::new(self.node.value() + 1) {
            return Some(Timestamp {
                node,
                ..*self
            });
        }
        if let Some(counter) = self.counter.checked_add(1) {
            return Some(Timestamp {
                millis: self.millis,
                counter,
                node: NodeId::MIN,
            });
        }
        if self.millis < MILLIS_MAX {
            return Some(Timestamp {
                millis: self.millis + 1,
                counter: 0,
                node: NodeId::MIN,
            });
        }
        None
    }

    /// Decode the 16-byte form.
    pub fn decode(bytes: &[u8]) -> Result<Self, TimestampError> {
        let bytes: &[u8; TIMESTAMP_LEN] = bytes
            .try_into()
            .map_err(|_| TimestampError::InvalidLength { len: bytes.len() })?;
        let mut millis_be = [0u8; 8];
        millis_be.copy_from_slice(&bytes[..8]);
        let millis = u64::from_be_bytes(millis_be);
        if millis > MILLIS_MAX {
            return Err(TimestampError::MillisOverflow);
        }
        let counter = u16::from_be_bytes([bytes[8], bytes[9]]);
        let mut node_be = [0u8; 6];
        node_be.copy_from_slice(&bytes[10..]);
        Ok(Self {
            millis,
            counter,
            node: NodeId::from_bytes(node_be),
        })
    }
}

/// A half-open timestamp interval `[lo, hi)`.
///
/// The full key space is `[Timestamp::MIN, Timestamp::MAX]`; a range whose
/// `hi` equals [`Timestamp::MAX`] is treated as inclusive of it so the
/// sentinel upper bound needs no successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimestampRange {
    /// Inclusive lower bound.
    pub lo: Timestamp,
    /// Exclusive upper bound, inclusive when it is [`Timestamp::MAX`].
    pub hi: Timestamp,
}

impl TimestampRange {
    /// The whole key space.
    pub fn full() -> Self {
        Self {
            lo: Timestamp::MIN,
            hi: Timestamp::MAX,
        }
    }

    /// Build `[lo, hi)`.
    pub fn new(lo: Timestamp, hi: Timestamp) -> Self {
        Self { lo, hi }
    }

    /// Membership test.
    pub fn contains(&self, ts: &Timestamp) -> bool {
        if *ts < self.lo {
            return false;
        }
        *ts < self.hi || (self.hi == Timestamp::MAX && *ts == Timestamp::MAX)
    }
}

/// Hybrid logical clock state machine for one device.
///
/// Not internally synchronized: the replica serializes access (local writes
/// and remote applies go through the per-owner mutex).
#[derive(Debug, Clone)]
pub struct Hlc {
    last: Timestamp,
    max_drift_ms: u64,
}

impl Hlc {
    /// Fresh clock for a device, with the default drift window.
    pub fn new(node: NodeId) -> Self {
        Self::with_max_drift(node, DEFAULT_MAX_DRIFT_MS)
    }

    /// Fresh clock with an explicit drift window.
    pub fn with_max_drift(node: NodeId, max_drift_ms: u64) -> Self {
        Self {
            last: Timestamp {
                millis: 0,
                counter: 0,
                node,
            },
            max_drift_ms,
        }
    }

    /// Resume a clock from the last persisted timestamp.
    pub fn resume(last: Timestamp, max_drift_ms: u64) -> Self {
        Self { last, max_drift_ms }
    }

    /// The most recent timestamp this clock produced or absorbed.
    pub fn last(&self) -> Timestamp {
        self.last
    }

    /// Produce a timestamp strictly greater than any previous output.
    ///
    /// `wall_ms` is the current wall clock; regressions are accepted but
    /// only advance the counter.
    pub fn send(&mut self, wall_ms: u64) -> Result<Timestamp, TimestampError> {
        let millis = self.last.millis.max(wall_ms);
        self.check_drift(millis, wall_ms)?;
        if millis > MILLIS_MAX {
            return Err(TimestampError::MillisOverflow);
        }
        let counter = if millis == self.last.millis {
            self.last
                .counter
                .checked_add(1)
                .ok_or(TimestampError::CounterOverflow)?
        } else {
            0
        };
        let ts = Timestamp {
            millis,
            counter,
            node: self.last.node,
        };
        self.last = ts;
        Ok(ts)
    }

    /// Merge a remote timestamp observed at wall clock `wall_ms`.
    ///
    /// Advances local state to `max(local, remote, wall)`; the returned
    /// timestamp is the new local state, strictly greater than both the
    /// previous local state and the remote input.
    pub fn receive(&mut self, remote: Timestamp, wall_ms: u64) -> Result<Timestamp, TimestampError> {
        let millis = self.last.millis.max(remote.millis).max(wall_ms);
        self.check_drift(millis, wall_ms)?;
        if millis > MILLIS_MAX {
            return Err(TimestampError::MillisOverflow);
        }
        let counter = if millis == self.last.millis && millis == remote.millis {
            self.last
                .counter
                .max(remote.counter)
                .checked_add(1)
                .ok_or(TimestampError::CounterOverflow)?
        } else if millis == self.last.millis {
            self.last
                .counter
                .checked_add(1)
                .ok_or(TimestampError::CounterOverflow)?
        } else if millis == remote.millis {
            remote
                .counter
                .checked_add(1)
                .ok_or(TimestampError::CounterOverflow)?
        } else {
            0
        };
        let ts = Timestamp {
            millis,
            counter,
            node: self.last.node,
        };
        self.last = ts;
        Ok(ts)
    }

    fn check_drift(&self, millis: u64, wall_ms: u64) -> Result<(), TimestampError> {
        let drift_ms = millis.abs_diff(wall_ms);
        if drift_ms > self.max_drift_ms {
            return Err(TimestampError::ClockDrift { drift_ms });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn node(value: u64) -> NodeId {
        NodeId::new(value).unwrap()
    }

    fn ts(millis: u64, counter: u16, n: u64) -> Timestamp {
        Timestamp::new(millis, counter, node(n)).unwrap()
    }

    #[test]
    fn send_is_strictly_increasing_within_one_millisecond() {
        let mut hlc = Hlc::new(node(1));
        let a = hlc.send(100).unwrap();
        let b = hlc.send(100).unwrap();
        let c = hlc.send(100).unwrap();
        assert!(a < b && b < c);
        assert_eq!(b.counter, a.counter + 1);
    }

    #[test]
    fn send_resets_counter_when_physical_advances() {
        let mut hlc = Hlc::new(node(1));
        hlc.send(100).unwrap();
        hlc.send(100).unwrap();
        let later = hlc.send(101).unwrap();
        assert_eq!(later.counter, 0);
        assert_eq!(later.millis, 101);
    }

    #[test]
    fn wall_clock_regression_advances_counter_only() {
        let mut hlc = Hlc::new(node(1));
        let a = hlc.send(200).unwrap();
        let b = hlc.send(150).unwrap();
        assert_eq!(b.millis, a.millis);
        assert_eq!(b.counter, a.counter + 1);
    }

    #[test]
    fn send_rejects_drift_beyond_window() {
        let mut hlc = Hlc::with_max_drift(node(1), 300_000);
        hlc.send(1_000_000).unwrap();
        // Wall clock fell 10 minutes behind the clock state.
        let err = hlc.send(400_000).unwrap_err();
        assert_eq!(err, TimestampError::ClockDrift { drift_ms: 600_000 });
    }

    #[test]
    fn receive_rejects_remote_drift() {
        let mut hlc = Hlc::with_max_drift(node(1), 300_000);
        let remote = ts(1_000_000, 0, 2);
        let err = hlc.receive(remote, 400_000).unwrap_err();
        assert_eq!(err, TimestampError::ClockDrift { drift_ms: 600_000 });
    }

    #[test]
    fn counter_overflow_is_a_hard_error() {
        let mut hlc = Hlc::resume(ts(100, u16::MAX, 1), DEFAULT_MAX_DRIFT_MS);
        assert_eq!(hlc.send(100).unwrap_err(), TimestampError::CounterOverflow);
    }

    #[test]
    fn receive_dominates_remote() {
        let mut local = Hlc::new(node(1));
        let remote = ts(500, 3, 2);
        let merged = local.receive(remote, 500).unwrap();
        assert!(merged > remote);
        assert_eq!(merged.counter, 4);
        // A subsequent send stays above the remote timestamp.
        let next = local.send(500).unwrap();
        assert!(next > remote);
    }

    #[test]
    fn decode_rejects_wrong_length() {
        assert_eq!(
            Timestamp::decode(&[0u8; 15]).unwrap_err(),
            TimestampError::InvalidLength { len: 15 }
        );
    }

    #[test]
    fn decode_rejects_millis_above_48_bits() {
        let mut bytes = [0u8; TIMESTAMP_LEN];
        bytes[0] = 1;
        assert_eq!(
            Timestamp::decode(&bytes).unwrap_err(),
            TimestampError::MillisOverflow
        );
    }

    #[test]
    fn successor_is_the_next_key() {
        let t = ts(5, 1, 3);
        assert_eq!(t.successor().unwrap(), ts(5, 1, 4));

        let node_edge = ts(5, 1, crate::identifiers::NODE_ID_MAX);
        assert_eq!(node_edge.successor().unwrap(), ts(5, 2, 0));

        let counter_edge = ts(5, u16::MAX, crate::identifiers::NODE_ID_MAX);
        assert_eq!(counter_edge.successor().unwrap(), ts(6, 0, 0));

        assert_eq!(Timestamp::MAX.successor(), None);
    }

    #[test]
    fn range_contains_honors_the_max_sentinel() {
        let full = TimestampRange::full();
        assert!(full.contains(&Timestamp::MIN));
        assert!(full.contains(&Timestamp::MAX));

        let bounded = TimestampRange::new(ts(10, 0, 0), ts(20, 0, 0));
        assert!(bounded.contains(&ts(10, 0, 0)));
        assert!(bounded.contains(&ts(19, u16::MAX, 0)));
        assert!(!bounded.contains(&ts(20, 0, 0)));
        assert!(!bounded.contains(&ts(9, 0, 0)));
    }

    #[test]
    fn min_and_max_bound_the_key_space() {
        let mid = ts(123, 45, 6);
        assert!(Timestamp::MIN < mid && mid < Timestamp::MAX);
        assert_eq!(Timestamp::decode(&Timestamp::MAX.encode()).unwrap(), Timestamp::MAX);
    }

    prop_compose! {
        fn arb_timestamp()(millis in 0..=MILLIS_MAX, counter in any::<u16>(), n in 0..=crate::identifiers::NODE_ID_MAX) -> Timestamp {
            ts(millis, counter, n)
        }
    }

    proptest! {
        #[test]
        fn codec_round_trips(t in arb_timestamp()) {
            prop_assert_eq!(Timestamp::decode(&t.encode()).unwrap(), t);
        }

        #[test]
        fn encoding_preserves_order(a in arb_timestamp(), b in arb_timestamp()) {
            prop_assert_eq!(a.cmp(&b), a.encode().cmp(&b.encode()));
        }

        #[test]
        fn send_sequences_are_strictly_increasing(walls in proptest::collection::vec(0u64..1 << 40, 1..64)) {
            let mut hlc = Hlc::with_max_drift(node(9), u64::MAX);
            let mut prev: Option<Timestamp> = None;
            for wall in walls {
                let t = hlc.send(wall).unwrap();
                if let Some(p) = prev {
                    prop_assert!(t > p);
                    prop_assert!(t.encode() > p.encode());
                }
                prev = Some(t);
            }
        }

        #[test]
        fn receive_then_send_exceeds_remote(remote in arb_timestamp(), wall in 0..=MILLIS_MAX) {
            let mut hlc = Hlc::with_max_drift(node(1), u64::MAX);
            if hlc.receive(remote, wall).is_ok() {
                // A send can still hit counter exhaustion at the edge; any
                // success must dominate the merged remote timestamp.
                if let Ok(next) = hlc.send(wall) {
                    prop_assert!(next > remote);
                }
            }
        }
    }
}
