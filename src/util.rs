use crate::errors::{Error, Result};

use byteorder::{ByteOrder, LittleEndian};
use std::convert::TryInto;

/// Bounds-checked reader over an untrusted datagram.
///
/// Every read advances the position by the consumed width. Reads past the end fail with
/// `Error::UnexpectedEndOfBuffer` and leave the position untouched.
#[derive(Clone, Debug)]
pub struct BinaryCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BinaryCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(Error::UnexpectedEndOfBuffer {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i16_le(&mut self) -> Result<i16> {
        Ok(LittleEndian::read_i16(self.take(2)?))
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn read_i32_le(&mut self) -> Result<i32> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn read_f32_le(&mut self) -> Result<f32> {
        Ok(LittleEndian::read_f32(self.take(4)?))
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.take(N)?;
        // `take` guarantees the length.
        Ok(bytes.try_into().unwrap_or([0; N]))
    }

    /// Reads up to the next NUL. A missing terminator is tolerated: the tail of the buffer is
    /// returned and the cursor ends up at the buffer end.
    pub fn read_cstring(&mut self) -> String {
        let rest = &self.buf[self.pos..];
        let (text, consumed) = match rest.iter().position(|&b| b == 0) {
            Some(end) => (&rest[..end], end + 1),
            None => (rest, rest.len()),
        };
        self.pos += consumed;
        String::from_utf8_lossy(text).into_owned()
    }

    /// Everything from the current position up to `len - n`. Empty if that range is empty.
    pub fn remaining_minus(&mut self, n: usize) -> &'a [u8] {
        let end = self.buf.len().saturating_sub(n);
        if end <= self.pos {
            return &[];
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        out
    }

    /// Everything from the current position to the end.
    pub fn rest(&mut self) -> &'a [u8] {
        self.remaining_minus(0)
    }
}
