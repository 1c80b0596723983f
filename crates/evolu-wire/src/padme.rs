//! PADMÉ length-obscuring padding.
//!
//! PADMÉ rounds a length `L` up so only the top `log2(L) − log2(log2(L))`
//! bits survive, which bounds padding overhead by `1/(2·log2 L)` while
//! leaking only `O(log log L)` bits of the true size. See Nikitin et al.,
//! "Reducing Metadata Leakage from Encrypted Files and Communication with
//! PURBs" (PETS 2019).
//!
//! A padded blob is `payload ‖ random fill ‖ u32-be payload length`; the
//! total is `padme_len(len + 4)` so the trailing footer always locates the
//! payload boundary.

use crate::primitives::WireError;
use rand::RngCore;

/// Trailing footer: big-endian payload length.
pub const FOOTER_LEN: usize = 4;

/// The PADMÉ padded size for a blob of `len` bytes.
///
/// Monotone, and `padme_len(len) >= len` for all inputs.
pub fn padme_len(len: usize) -> usize {
    if len < 2 {
        return len;
    }
    // e = floor(log2 len); s = floor(log2 e) + 1 bits of mantissa survive
    let e = usize::BITS - 1 - len.leading_zeros();
    let s = usize::BITS - e.leading_zeros();
    let last_bits = e.saturating_sub(s);
    let bit_mask = (1usize << last_bits) - 1;
    (len + bit_mask) & !bit_mask
}

/// Pad `payload` with random fill and the length footer.
pub fn pad<R: RngCore>(payload: &[u8], rng: &mut R) -> Result<Vec<u8>, WireError> {
    let len = u32::try_from(payload.len()).map_err(|_| WireError::LengthOverflow)?;
    let total = padme_len(payload.len() + FOOTER_LEN);
    let fill = total - FOOTER_LEN - payload.len();

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(payload);
    out.resize(payload.len() + fill, 0);
    rng.fill_bytes(&mut out[payload.len()..]);
    out.extend_from_slice(&len.to_be_bytes());
    Ok(out)
}

/// Strip padding, returning the payload slice.
pub fn unpad(padded: &[u8]) -> Result<&[u8], WireError> {
    if padded.len() < FOOTER_LEN {
        return Err(WireError::InvalidPadding);
    }
    let footer = &padded[padded.len() - FOOTER_LEN..];
    let len = u32::from_be_bytes([footer[0], footer[1], footer[2], footer[3]]) as usize;
    if len + FOOTER_LEN > padded.len() {
        return Err(WireError::InvalidPadding);
    }
    if padded.len() != padme_len(len + FOOTER_LEN) {
        return Err(WireError::InvalidPadding);
    }
    Ok(&padded[..len])
}
