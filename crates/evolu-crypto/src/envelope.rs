//! AEAD envelope over serialized changes.
//!
//! XChaCha20-Poly1305 with a 24-byte random nonce. The associated data is
//! `owner_id ‖ timestamp`, which binds a ciphertext to its log position: a
//! relay (or an attacker replaying relay traffic) cannot move a message to
//! a different owner or timestamp without failing authentication.
//!
//! Sealed layout: `nonce(24) ‖ ciphertext+tag`.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use evolu_core::{EvoluError, OwnerId, Timestamp};
use rand::{CryptoRng, RngCore};

use crate::keys::EncryptionKey;

/// XChaCha20-Poly1305 nonce size.
pub const NONCE_LEN: usize = 24;

fn associated_data(owner: &OwnerId, timestamp: &Timestamp) -> Vec<u8> {
    let mut aad = Vec::with_capacity(owner.as_bytes().len() + evolu_core::TIMESTAMP_LEN);
    aad.extend_from_slice(owner.as_bytes());
    aad.extend_from_slice(&timestamp.encode());
    aad
}

/// Encrypt a serialized change for `(owner, timestamp)`.
pub fn seal<R: RngCore + CryptoRng>(
    key: &EncryptionKey,
    owner: &OwnerId,
    timestamp: &Timestamp,
    plaintext: &[u8],
    rng: &mut R,
) -> Result<Vec<u8>, EvoluError> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce);
    let aad = associated_data(owner, timestamp);

    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|_| EvoluError::Decrypt)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt a sealed change, authenticating its `(owner, timestamp)` binding.
pub fn open(
    key: &EncryptionKey,
    owner: &OwnerId,
    timestamp: &Timestamp,
    sealed: &[u8],
) -> Result<Vec<u8>, EvoluError> {
    if sealed.len() < NONCE_LEN {
        return Err(EvoluError::Decrypt);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let aad = associated_data(owner, timestamp);

    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| EvoluError::Decrypt)
}
