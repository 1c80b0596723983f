//! # Evolu Crypto
//!
//! End-to-end encryption for the sync engine:
//!
//! - [`Owner`]: the secrets of a replica group, derived from a BIP-39
//!   mnemonic through HKDF-SHA256 with domain separation
//! - [`envelope`]: XChaCha20-Poly1305 AEAD over serialized changes, with
//!   `owner ‖ timestamp` as associated data
//! - [`WriteKey`]: the 16-byte relay write authorization secret, compared
//!   in constant time

pub mod envelope;
pub mod fingerprint;
pub mod keys;

pub use envelope::{open, seal, NONCE_LEN};
pub use fingerprint::{Fingerprint, FingerprintHasher, FINGERPRINT_LEN};
pub use keys::{EncryptionKey, Owner, WriteKey, ENCRYPTION_KEY_LEN, WRITE_KEY_LEN};
