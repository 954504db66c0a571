//! Packet codec primitives: cursor-based reads and writes over byte buffers
//!
//! The wire protocol mixes three kinds of fields:
//! - fixed-width big-endian integers (8/16/24/32/64 bit),
//! - legacy "offset" encodings kept for client compatibility (a value stored
//!   as `v + 128`, or with its bytes order-swapped),
//! - bit-packed fields used by the movement/update blocks, where values of
//!   arbitrary width (1..=32 bits) are packed back to back within a
//!   byte-granular buffer.
//!
//! Every read checks bounds and fails with a [`CodecError`] instead of
//! truncating, so a malformed payload can be discarded without poisoning the
//! stream position of the caller.

use thiserror::Error;

/// Errors produced by codec reads and writes
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer overrun: needed {needed}, only {available} available")]
    BufferOverrun { needed: usize, available: usize },
    #[error("invalid bit width {0}, must be 1..=32")]
    InvalidBitWidth(u32),
    #[error("string field missing null terminator")]
    UnterminatedString,
    #[error("bit access used outside begin_bits/end_bits")]
    BitModeRequired,
}

/// Cursor-based reader over a borrowed byte buffer
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    bit_pos: Option<usize>,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            bit_pos: None,
        }
    }

    /// Bytes not yet consumed by byte-mode reads
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn has_remaining(&self) -> bool {
        self.remaining() > 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::BufferOverrun {
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, CodecError> {
        Ok(self.take(1)?[0] as i8)
    }

    /// Offset encoding: the wire carries `v + 128`
    pub fn read_u8_add(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_u8()?.wrapping_sub(128))
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_i16(&mut self) -> Result<i16, CodecError> {
        Ok(self.read_u16()? as i16)
    }

    /// Big-endian with the low byte offset-encoded
    pub fn read_u16_add(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(((b[0] as u16) << 8) | b[1].wrapping_sub(128) as u16)
    }

    /// Byte-order-swapped legacy encoding
    pub fn read_u16_le(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u24(&mut self) -> Result<u32, CodecError> {
        let b = self.take(3)?;
        Ok(((b[0] as u32) << 16) | ((b[1] as u32) << 8) | b[2] as u32)
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u32_le(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(b);
        Ok(u64::from_be_bytes(bytes))
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        self.take(n)
    }

    /// Reads a null-terminated string, consuming the terminator
    pub fn read_cstring(&mut self) -> Result<String, CodecError> {
        let rest = &self.buf[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(CodecError::UnterminatedString)?;
        let s = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += end + 1;
        Ok(s)
    }

    /// Switches to bit mode at the current byte position
    pub fn begin_bits(&mut self) {
        self.bit_pos = Some(self.pos * 8);
    }

    /// Rounds the bit cursor up to a byte boundary and resumes byte mode
    pub fn end_bits(&mut self) -> Result<(), CodecError> {
        let bit = self.bit_pos.take().ok_or(CodecError::BitModeRequired)?;
        self.pos = (bit + 7) / 8;
        Ok(())
    }

    pub fn read_bits(&mut self, width: u32) -> Result<u32, CodecError> {
        if width == 0 || width > 32 {
            return Err(CodecError::InvalidBitWidth(width));
        }
        let mut bit = self.bit_pos.ok_or(CodecError::BitModeRequired)?;
        let total_bits = self.buf.len() * 8;
        if bit + width as usize > total_bits {
            return Err(CodecError::BufferOverrun {
                needed: width as usize,
                available: total_bits - bit,
            });
        }

        let mut value = 0u32;
        let mut remaining = width as usize;
        while remaining > 0 {
            let byte = self.buf[bit >> 3];
            let offset = bit & 7;
            let take = (8 - offset).min(remaining);
            let shift = 8 - offset - take;
            let mask = ((1u16 << take) - 1) as u8;
            value = (value << take) | ((byte >> shift) & mask) as u32;
            bit += take;
            remaining -= take;
        }
        self.bit_pos = Some(bit);
        Ok(value)
    }
}

/// Cursor-based writer over an owned, growable byte buffer
///
/// Byte writes append at the end. Bit writes pack values back to back from
/// the position where `begin_bits` was called, extending the buffer with
/// zeroed bytes as needed.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
    bit_pos: Option<usize>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            bit_pos: None,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_i8(&mut self, v: i8) {
        self.buf.push(v as u8);
    }

    /// Offset encoding: the wire carries `v + 128`
    pub fn put_u8_add(&mut self, v: u8) {
        self.buf.push(v.wrapping_add(128));
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Big-endian with the low byte offset-encoded
    pub fn put_u16_add(&mut self, v: u16) {
        self.buf.push((v >> 8) as u8);
        self.buf.push((v as u8).wrapping_add(128));
    }

    /// Byte-order-swapped legacy encoding
    pub fn put_u16_le(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u24(&mut self, v: u32) {
        self.buf.push((v >> 16) as u8);
        self.buf.push((v >> 8) as u8);
        self.buf.push(v as u8);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32_le(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Writes a null-terminated string
    pub fn put_cstring(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    /// Switches to bit mode at the current end of the buffer
    pub fn begin_bits(&mut self) {
        self.bit_pos = Some(self.buf.len() * 8);
    }

    /// Byte-aligns the buffer and resumes byte mode
    pub fn end_bits(&mut self) -> Result<(), CodecError> {
        self.bit_pos.take().ok_or(CodecError::BitModeRequired)?;
        Ok(())
    }

    pub fn put_bits(&mut self, width: u32, value: u32) -> Result<(), CodecError> {
        if width == 0 || width > 32 {
            return Err(CodecError::InvalidBitWidth(width));
        }
        let mut bit = self.bit_pos.ok_or(CodecError::BitModeRequired)?;
        let end_byte = (bit + width as usize + 7) / 8;
        if self.buf.len() < end_byte {
            self.buf.resize(end_byte, 0);
        }

        let mut remaining = width as usize;
        while remaining > 0 {
            let idx = bit >> 3;
            let offset = bit & 7;
            let take = (8 - offset).min(remaining);
            let shift = 8 - offset - take;
            let mask = ((1u16 << take) - 1) as u8;
            let chunk = ((value >> (remaining - take)) as u8) & mask;
            self.buf[idx] = (self.buf[idx] & !(mask << shift)) | (chunk << shift);
            bit += take;
            remaining -= take;
        }
        self.bit_pos = Some(bit);
        Ok(())
    }
}
