//! # Evolu Wire
//!
//! Binary codec building blocks shared by the protocol layer and the
//! transports: big-endian primitive reader/writer, PADMÉ length-obscuring
//! padding, and the 4-byte length-prefix frame helpers.

pub mod padme;
pub mod primitives;

pub use padme::{pad, padme_len, unpad, FOOTER_LEN};
pub use primitives::{Reader, WireError, Writer};

/// Prefix a padded frame with its 4-byte big-endian length for a stream
/// transport.
pub fn prefix_frame(frame: &[u8]) -> Result<Vec<u8>, WireError> {
    let len = u32::try_from(frame.len()).map_err(|_| WireError::LengthOverflow)?;
    let mut out = Vec::with_capacity(4 + frame.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(frame);
    Ok(out)
}

/// Split one length-prefixed frame off the front of a buffer.
///
/// Returns the frame and the unconsumed remainder, or `None` when the
/// buffer does not yet hold a complete frame.
pub fn split_frame(buf: &[u8]) -> Result<Option<(&[u8], &[u8])>, WireError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let end = 4usize.checked_add(len).ok_or(WireError::LengthOverflow)?;
    if buf.len() < end {
        return Ok(None);
    }
    Ok(Some((&buf[4..end], &buf[end..])))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_prefix_round_trip() {
        let framed = prefix_frame(b"hello").unwrap();
        let (frame, rest) = split_frame(&framed).unwrap().unwrap();
        assert_eq!(frame, b"hello");
        assert!(rest.is_empty());
    }

    #[test]
    fn split_handles_partial_and_concatenated_frames() {
        let mut buf = prefix_frame(b"one").unwrap();
        buf.extend(prefix_frame(b"two").unwrap());

        let (first, rest) = split_frame(&buf).unwrap().unwrap();
        assert_eq!(first, b"one");
        let (second, rest) = split_frame(rest).unwrap().unwrap();
        assert_eq!(second, b"two");
        assert!(rest.is_empty());

        assert!(split_frame(&buf[..5]).unwrap().is_none());
        assert!(split_frame(&[]).unwrap().is_none());
    }
}
