//! Transport framing: PADMÉ padding plus the 4-byte length prefix.
//!
//! Both directions of a connection carry `u32-be length ‖ padded frame`,
//! where the padded frame hides the true message size behind the PADMÉ
//! bound. WebSocket already delimits messages, but the prefix keeps the
//! format transport-agnostic (any reliable ordered byte stream works).

use evolu_core::EvoluError;
use evolu_wire::{pad, prefix_frame, split_frame, unpad};
use rand::{CryptoRng, RngCore};

use crate::messages::{DecodeError, ProtocolMessage};

/// Encode, pad, and length-prefix a message for the wire.
pub fn seal_frame<R: RngCore + CryptoRng>(
    message: &ProtocolMessage,
    rng: &mut R,
) -> Result<Vec<u8>, EvoluError> {
    let encoded = message
        .encode()
        .map_err(|e| EvoluError::protocol(e.to_string()))?;
    let padded = pad(&encoded, rng).map_err(|e| EvoluError::protocol(e.to_string()))?;
    prefix_frame(&padded).map_err(|e| EvoluError::protocol(e.to_string()))
}

/// Reverse of [`seal_frame`]. Version mismatches surface as
/// [`DecodeError::Version`] so callers can answer with the right error code.
pub fn open_frame(bytes: &[u8]) -> Result<ProtocolMessage, DecodeError> {
    let (frame, rest) = split_frame(bytes)
        .map_err(DecodeError::Wire)?
        .ok_or(DecodeError::Wire(evolu_wire::WireError::UnexpectedEnd {
            needed: 4,
            remaining: bytes.len(),
        }))?;
    if !rest.is_empty() {
        return Err(DecodeError::Wire(evolu_wire::WireError::TrailingBytes {
            count: rest.len(),
        }));
    }
    let payload = unpad(frame).map_err(DecodeError::Wire)?;
    ProtocolMessage::decode(payload)
}
