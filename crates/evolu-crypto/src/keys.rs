//! Owner secrets and their derivation.
//!
//! An owner is created from a BIP-39 mnemonic. The mnemonic seed feeds
//! HKDF-SHA256 with domain-separated info strings, yielding the public
//! owner id, the symmetric encryption key, and the relay write key. Knowing
//! the id alone grants access to nothing but ciphertext.

use bip39::Mnemonic;
use evolu_core::{EvoluError, OwnerId};
use hkdf::Hkdf;
use rand::{CryptoRng, RngCore};
use sha2::Sha256;
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length in bytes of an [`EncryptionKey`].
pub const ENCRYPTION_KEY_LEN: usize = 32;

/// Length in bytes of a [`WriteKey`].
pub const WRITE_KEY_LEN: usize = 16;

const OWNER_ID_INFO: &[u8] = b"evolu/owner-id";
const ENCRYPTION_KEY_INFO: &[u8] = b"evolu/encryption-key";
const WRITE_KEY_INFO: &[u8] = b"evolu/write-key";

/// Symmetric AEAD key for an owner's changes. Wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey(pub(crate) [u8; ENCRYPTION_KEY_LEN]);

impl EncryptionKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; ENCRYPTION_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; ENCRYPTION_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Shared secret authorizing writes for an owner at a relay.
///
/// Equality goes through [`subtle`] so a relay comparison leaks nothing
/// about how long a matching prefix an attacker presented.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct WriteKey(pub(crate) [u8; WRITE_KEY_LEN]);

impl WriteKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; WRITE_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Create from a byte slice, failing on length mismatch.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; WRITE_KEY_LEN]>::try_from(bytes).ok().map(Self)
    }

    /// Generate a fresh random write key (rotation).
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; WRITE_KEY_LEN];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; WRITE_KEY_LEN] {
        &self.0
    }
}

impl PartialEq for WriteKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for WriteKey {}

impl fmt::Debug for WriteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WriteKey(..)")
    }
}

/// A replica group's identity and secrets.
#[derive(Clone)]
pub struct Owner {
    /// Public id the relay indexes by.
    pub id: OwnerId,
    /// Secret AEAD key.
    pub encryption_key: EncryptionKey,
    /// Secret relay write authorization.
    pub write_key: WriteKey,
    /// The mnemonic everything derives from, kept for export/backup.
    pub mnemonic: Mnemonic,
}

impl fmt::Debug for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Owner").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Owner {
    /// Derive an owner from an existing mnemonic phrase.
    pub fn from_mnemonic_phrase(phrase: &str) -> Result<Self, EvoluError> {
        let mnemonic = Mnemonic::parse_normalized(phrase)
            .map_err(|e| EvoluError::serialization(format!("invalid mnemonic: {e}")))?;
        Ok(Self::derive(mnemonic))
    }

    /// Create a brand-new owner from fresh entropy (12-word mnemonic).
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Result<Self, EvoluError> {
        let mut entropy = [0u8; 16];
        rng.fill_bytes(&mut entropy);
        let mnemonic = Mnemonic::from_entropy(&entropy)
            .map_err(|e| EvoluError::serialization(format!("mnemonic generation: {e}")))?;
        entropy.zeroize();
        Ok(Self::derive(mnemonic))
    }

    fn derive(mnemonic: Mnemonic) -> Self {
        let mut seed = mnemonic.to_seed("");
        let hk = Hkdf::<Sha256>::new(None, &seed);

        let mut id = [0u8; evolu_core::identifiers::OWNER_ID_LEN];
        let mut encryption_key = [0u8; ENCRYPTION_KEY_LEN];
        let mut write_key = [0u8; WRITE_KEY_LEN];
        // Output lengths are far below the HKDF-SHA256 limit; expand cannot fail.
        let _ = hk.expand(OWNER_ID_INFO, &mut id);
        let _ = hk.expand(ENCRYPTION_KEY_INFO, &mut encryption_key);
        let _ = hk.expand(WRITE_KEY_INFO, &mut write_key);
        seed.zeroize();

        Self {
            id: OwnerId::from_bytes(id),
            encryption_key: EncryptionKey(encryption_key),
            write_key: WriteKey(write_key),
            mnemonic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    const PHRASE: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn derivation_is_deterministic() {
        let a = Owner::from_mnemonic_phrase(PHRASE).unwrap();
        let b = Owner::from_mnemonic_phrase(PHRASE).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.encryption_key.as_bytes(), b.encryption_key.as_bytes());
        assert_eq!(a.write_key, b.write_key);
    }

    #[test]
    fn domain_separation_yields_unrelated_outputs() {
        let owner = Owner::from_mnemonic_phrase(PHRASE).unwrap();
        // The three derived values share a seed but no bytes.
        assert_ne!(
            &owner.encryption_key.as_bytes()[..WRITE_KEY_LEN],
            owner.write_key.as_bytes()
        );
        assert_ne!(
            &owner.id.as_bytes()[..WRITE_KEY_LEN],
            owner.write_key.as_bytes()
        );
    }

    #[test]
    fn generated_owners_are_distinct() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let a = Owner::generate(&mut rng).unwrap();
        let b = Owner::generate(&mut rng).unwrap();
        assert_ne!(a.id, b.id);
        assert_ne!(a.write_key, b.write_key);
    }

    #[test]
    fn generated_owner_round_trips_through_its_phrase() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let owner = Owner::generate(&mut rng).unwrap();
        let reimported = Owner::from_mnemonic_phrase(&owner.mnemonic.to_string()).unwrap();
        assert_eq!(owner.id, reimported.id);
        assert_eq!(owner.write_key, reimported.write_key);
    }

    #[test]
    fn bad_phrase_is_rejected() {
        assert!(Owner::from_mnemonic_phrase("definitely not a mnemonic").is_err());
    }

    #[test]
    fn write_key_equality_is_by_value() {
        let a = WriteKey::from_bytes([9u8; WRITE_KEY_LEN]);
        let b = WriteKey::from_bytes([9u8; WRITE_KEY_LEN]);
        let c = WriteKey::from_bytes([10u8; WRITE_KEY_LEN]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        // Mismatches anywhere in the key are equally rejected.
        for i in 0..WRITE_KEY_LEN {
            let mut bytes = [9u8; WRITE_KEY_LEN];
            bytes[i] ^= 1;
            assert_ne!(a, WriteKey::from_bytes(bytes));
        }
    }
}
