//! Order-insensitive range digests.
//!
//! A [`Fingerprint`] is the XOR of 96-bit truncated keyed BLAKE3 hashes of
//! every timestamp in a range. XOR makes the digest linear:
//! `fp(A ∪ B) = fp(A) ⊕ fp(B)` for disjoint sets, so
//! `fp([lo,hi)) = fp([lo,mid)) ⊕ fp([mid,hi))` and storage can recompute
//! incrementally. The hash key is derived from the public owner id, so both
//! sides of a sync agree on it while unrelated owners' digests stay
//! uncorrelated.

use evolu_core::{OwnerId, Timestamp};

/// Digest size: 96 bits.
pub const FINGERPRINT_LEN: usize = 12;

const DERIVE_CONTEXT: &str = "evolu 2025 range fingerprint";

/// An order-insensitive digest of a set of timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Fingerprint(pub [u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// Digest of the empty set; the XOR identity.
    pub const EMPTY: Fingerprint = Fingerprint([0u8; FINGERPRINT_LEN]);

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    /// Create from a byte slice, failing on length mismatch.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; FINGERPRINT_LEN]>::try_from(bytes).ok().map(Self)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// Fold another digest in (also removes: XOR is its own inverse).
    pub fn xor_assign(&mut self, other: &Fingerprint) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a ^= b;
        }
    }
}

/// Keyed hasher mapping timestamps into fingerprint space for one owner.
#[derive(Debug, Clone)]
pub struct FingerprintHasher {
    key: [u8; 32],
}

impl FingerprintHasher {
    /// Derive the hash key for an owner.
    pub fn for_owner(owner: &OwnerId) -> Self {
        Self {
            key: blake3::derive_key(DERIVE_CONTEXT, owner.as_bytes()),
        }
    }

    /// Hash a single timestamp.
    pub fn hash(&self, timestamp: &Timestamp) -> Fingerprint {
        let digest = blake3::keyed_hash(&self.key, &timestamp.encode());
        let mut out = [0u8; FINGERPRINT_LEN];
        out.copy_from_slice(&digest.as_bytes()[..FINGERPRINT_LEN]);
        Fingerprint(out)
    }

    /// Digest a set of timestamps.
    pub fn digest<'a, I: IntoIterator<Item = &'a Timestamp>>(&self, timestamps: I) -> Fingerprint {
        let mut fp = Fingerprint::EMPTY;
        for ts in timestamps {
            fp.xor_assign(&self.hash(ts));
        }
        fp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evolu_core::NodeId;
    use proptest::prelude::*;

    fn ts(millis: u64) -> Timestamp {
        Timestamp::new(millis, 0, NodeId::new(1).unwrap()).unwrap()
    }

    fn hasher() -> FingerprintHasher {
        FingerprintHasher::for_owner(&OwnerId::from_bytes([1u8; 21]))
    }

    #[test]
    fn empty_set_digests_to_identity() {
        assert_eq!(
            hasher().digest(std::iter::empty::<&Timestamp>()),
            Fingerprint::EMPTY
        );
    }

    #[test]
    fn digest_is_order_insensitive() {
        let h = hasher();
        let (a, b, c) = (ts(1), ts(2), ts(3));
        assert_eq!(h.digest([&a, &b, &c]), h.digest([&c, &a, &b]));
    }

    #[test]
    fn owners_get_unrelated_digests() {
        let a = FingerprintHasher::for_owner(&OwnerId::from_bytes([1u8; 21]));
        let b = FingerprintHasher::for_owner(&OwnerId::from_bytes([2u8; 21]));
        assert_ne!(a.hash(&ts(1)), b.hash(&ts(1)));
    }

    proptest! {
        /// fp([lo,mid)) ^ fp([mid,hi)) == fp([lo,hi)) for any split point.
        #[test]
        fn digest_is_linear_under_splits(
            millis in proptest::collection::btree_set(0u64..1 << 40, 0..64),
            split in 0u64..1 << 40,
        ) {
            let h = hasher();
            let all: Vec<Timestamp> = millis.iter().map(|m| ts(*m)).collect();
            let left: Vec<Timestamp> = all.iter().filter(|t| t.millis < split).copied().collect();
            let right: Vec<Timestamp> = all.iter().filter(|t| t.millis >= split).copied().collect();

            let mut combined = h.digest(left.iter());
            combined.xor_assign(&h.digest(right.iter()));
            prop_assert_eq!(combined, h.digest(all.iter()));
        }
    }
}
