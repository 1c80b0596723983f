//! Big-endian primitives for the hand-written protocol codec.
//!
//! Primitive vocabulary: `u8`..`u64` big-endian, `bytes(n)`, `varbytes`
//! (`u32` length then bytes), arrays (`u32` count then items).

/// Decoding failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Input ended before a field was complete.
    #[error("unexpected end of input: needed {needed} more bytes, {remaining} left")]
    UnexpectedEnd {
        /// Bytes the current field still required.
        needed: usize,
        /// Bytes that were actually left.
        remaining: usize,
    },

    /// A length or count field exceeds representable bounds.
    #[error("length field overflows")]
    LengthOverflow,

    /// Decoding finished with input left over.
    #[error("{count} trailing bytes after message end")]
    TrailingBytes {
        /// Number of unconsumed bytes.
        count: usize,
    },

    /// Unknown discriminator byte.
    #[error("invalid tag byte {tag:#04x}")]
    InvalidTag {
        /// The rejected byte.
        tag: u8,
    },

    /// Padding footer inconsistent with the padded length.
    #[error("invalid padding")]
    InvalidPadding,

    /// A structurally valid field carried an invalid value.
    #[error("malformed {what}")]
    Malformed {
        /// Which field was rejected.
        what: &'static str,
    },
}

/// Append-only big-endian encoder.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    /// Empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writer with a capacity hint.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Finish and take the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append a `u8`.
    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Append a big-endian `u16`.
    pub fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Append a big-endian `u32`.
    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Append a big-endian `u64`.
    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Append raw bytes with no length marker.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Append `u32` length then bytes.
    pub fn put_varbytes(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        let len = u32::try_from(bytes.len()).map_err(|_| WireError::LengthOverflow)?;
        self.put_u32(len);
        self.put_bytes(bytes);
        Ok(())
    }

    /// Append an array count.
    pub fn put_count(&mut self, count: usize) -> Result<(), WireError> {
        let count = u32::try_from(count).map_err(|_| WireError::LengthOverflow)?;
        self.put_u32(count);
        Ok(())
    }
}

/// Borrowing big-endian decoder.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Read from the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// True when everything was consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Fail unless the input was fully consumed.
    pub fn expect_end(&self) -> Result<(), WireError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(WireError::TrailingBytes {
                count: self.remaining(),
            })
        }
    }

    /// Take `n` raw bytes.
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::UnexpectedEnd {
                needed: n - self.remaining(),
                remaining: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Take a `u8`.
    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.bytes(1)?[0])
    }

    /// Take a big-endian `u16`.
    pub fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Take a big-endian `u32`.
    pub fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Take a big-endian `u64`.
    pub fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.bytes(8)?;
        let mut be = [0u8; 8];
        be.copy_from_slice(b);
        Ok(u64::from_be_bytes(be))
    }

    /// Take `u32` length then that many bytes.
    pub fn varbytes(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.u32()? as usize;
        self.bytes(len)
    }

    /// Take an array count.
    pub fn count(&mut self) -> Result<usize, WireError> {
        Ok(self.u32()? as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn primitive_round_trip() {
        let mut w = Writer::new();
        w.put_u8(0xab);
        w.put_u16(0x1234);
        w.put_u32(0xdead_beef);
        w.put_u64(0x0102_0304_0506_0708);
        w.put_varbytes(b"payload").unwrap();
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes);
        assert_eq!(r.u8().unwrap(), 0xab);
        assert_eq!(r.u16().unwrap(), 0x1234);
        assert_eq!(r.u32().unwrap(), 0xdead_beef);
        assert_eq!(r.u64().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(r.varbytes().unwrap(), b"payload");
        r.expect_end().unwrap();
    }

    #[test]
    fn truncated_input_reports_shortfall() {
        let mut r = Reader::new(&[0x01]);
        assert_eq!(
            r.u32().unwrap_err(),
            WireError::UnexpectedEnd {
                needed: 3,
                remaining: 1
            }
        );
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let r = Reader::new(&[0x00, 0x01]);
        assert_eq!(r.expect_end().unwrap_err(), WireError::TrailingBytes { count: 2 });
    }

    #[test]
    fn varbytes_length_beyond_input_fails() {
        let mut w = Writer::new();
        w.put_u32(100);
        w.put_bytes(b"short");
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert!(matches!(r.varbytes(), Err(WireError::UnexpectedEnd { .. })));
    }

    proptest! {
        #[test]
        fn varbytes_round_trips(data in proptest::collection::vec(any::<u8>(), 0..1024)) {
            let mut w = Writer::new();
            w.put_varbytes(&data).unwrap();
            let bytes = w.into_bytes();
            let mut r = Reader::new(&bytes);
            prop_assert_eq!(r.varbytes().unwrap(), &data[..]);
            r.expect_end().unwrap();
        }
    }
}
