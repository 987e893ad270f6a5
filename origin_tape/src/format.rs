// Copyright 2026 the Origin Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Encoding/decoding primitives for the trace file format.
//!
//! Everything in the on-disk format is little-endian. Variable-width integers
//! use LEB128. Event records are individually checksummed with CRC-32 (IEEE).

use core::fmt;

use thiserror::Error;

/// A decode error for trace file artifacts.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Input ended unexpectedly.
    #[error("unexpected end of input")]
    UnexpectedEof,
    /// An integer encoding was invalid or overflowed.
    #[error("invalid varint encoding")]
    InvalidVarint,
    /// A length/offset was out of bounds.
    #[error("out of bounds")]
    OutOfBounds,
    /// A UTF-8 string was invalid.
    #[error("invalid UTF-8")]
    InvalidUtf8,
    /// The trace format version is not supported by this decoder.
    #[error("unsupported version {version}")]
    UnsupportedVersion {
        /// Format version from the header.
        version: u16,
    },
    /// A magic header mismatch.
    #[error("bad magic header")]
    BadMagic,
    /// An event checksum did not match its payload.
    #[error("event checksum mismatch at offset {offset}")]
    ChecksumMismatch {
        /// File offset of the event's tag byte.
        offset: u64,
    },
    /// The file ends before its declared code table or index.
    #[error("truncated trace file")]
    Truncated,
}

/// Decoding cursor over a byte slice.
///
/// The cursor keeps the not-yet-consumed tail of the input; each read splits
/// what it needs off the front or fails without consuming anything, so a
/// failed decode leaves the cursor where the problem is.
#[derive(Clone, Debug)]
pub struct Reader<'a> {
    rest: &'a [u8],
    full_len: usize,
}

impl<'a> Reader<'a> {
    /// Starts a cursor at the beginning of `bytes`.
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            rest: bytes,
            full_len: bytes.len(),
        }
    }

    /// How many bytes have been consumed so far.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.full_len - self.rest.len()
    }

    /// How many bytes are left.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.rest.len()
    }

    /// `true` once the whole input has been consumed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }

    fn split(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if len > self.rest.len() {
            return Err(DecodeError::UnexpectedEof);
        }
        let (head, tail) = self.rest.split_at(len);
        self.rest = tail;
        Ok(head)
    }

    fn fixed<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let head = self.split(N)?;
        let mut array = [0u8; N];
        array.copy_from_slice(head);
        Ok(array)
    }

    /// Consumes one byte.
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        self.fixed::<1>().map(|[b]| b)
    }

    /// Consumes a fixed-width little-endian `u16`.
    pub fn read_u16_le(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.fixed()?))
    }

    /// Consumes a fixed-width little-endian `u32`.
    pub fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.fixed()?))
    }

    /// Consumes a fixed-width little-endian `u64`.
    pub fn read_u64_le(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.fixed()?))
    }

    /// Consumes an unsigned LEB128 integer.
    pub fn read_uleb128_u64(&mut self) -> Result<u64, DecodeError> {
        let (value, used) = read_uleb128(self.rest)?;
        self.rest = &self.rest[used..];
        Ok(value)
    }

    /// Consumes an unsigned LEB128 integer that must fit in `u32`.
    pub fn read_uleb128_u32(&mut self) -> Result<u32, DecodeError> {
        u32::try_from(self.read_uleb128_u64()?).map_err(|_| DecodeError::OutOfBounds)
    }

    /// Consumes a signed LEB128 integer.
    pub fn read_sleb128_i64(&mut self) -> Result<i64, DecodeError> {
        let (value, used) = read_sleb128(self.rest)?;
        self.rest = &self.rest[used..];
        Ok(value)
    }

    /// Consumes `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        self.split(len)
    }

    /// Consumes a LEB128 length followed by that many UTF-8 bytes.
    pub fn read_len_str(&mut self) -> Result<&'a str, DecodeError> {
        let len = self.read_uleb128_u32()? as usize;
        core::str::from_utf8(self.split(len)?).map_err(|_| DecodeError::InvalidUtf8)
    }
}

/// Encoding buffer.
///
/// A thin growable byte buffer; every integer write routes through
/// [`Writer::write_bytes`] so there is exactly one place bytes land.
#[derive(Clone, Debug, Default)]
pub struct Writer {
    out: Vec<u8>,
}

impl Writer {
    /// Starts an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The bytes written so far.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.out
    }

    /// Number of bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.out.len()
    }

    /// `true` while nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    /// Takes the accumulated bytes.
    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.out
    }

    /// Discards the contents, keeping the allocation.
    pub fn clear(&mut self) {
        self.out.clear();
    }

    /// Appends raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    /// Appends one byte.
    pub fn write_u8(&mut self, v: u8) {
        self.out.push(v);
    }

    /// Appends a fixed-width little-endian `u16`.
    pub fn write_u16_le(&mut self, v: u16) {
        self.write_bytes(&v.to_le_bytes());
    }

    /// Appends a fixed-width little-endian `u32`.
    pub fn write_u32_le(&mut self, v: u32) {
        self.write_bytes(&v.to_le_bytes());
    }

    /// Appends a fixed-width little-endian `u64`.
    pub fn write_u64_le(&mut self, v: u64) {
        self.write_bytes(&v.to_le_bytes());
    }

    /// Appends an unsigned LEB128 integer.
    pub fn write_uleb128_u64(&mut self, v: u64) {
        write_uleb128(&mut self.out, v);
    }

    /// Appends an unsigned LEB128 integer given as `u32`.
    pub fn write_uleb128_u32(&mut self, v: u32) {
        self.write_uleb128_u64(u64::from(v));
    }

    /// Appends a signed LEB128 integer.
    pub fn write_sleb128_i64(&mut self, v: i64) {
        write_sleb128(&mut self.out, v);
    }

    /// Appends a LEB128 length followed by the UTF-8 bytes of `s`.
    pub fn write_len_str(&mut self, s: &str) {
        self.write_uleb128_u32(s.len() as u32);
        self.write_bytes(s.as_bytes());
    }
}

/// Decodes an unsigned LEB128 integer from the front of `input`, returning
/// the value and how many bytes it occupied.
pub fn read_uleb128(input: &[u8]) -> Result<(u64, usize), DecodeError> {
    let mut value = 0u64;
    for (i, &byte) in input.iter().enumerate() {
        // A u64 spans at most ten groups; the tenth holds one meaningful bit.
        if i == 9 && byte > 0x01 {
            return Err(DecodeError::InvalidVarint);
        }
        value |= u64::from(byte & 0x7F) << (7 * i as u32);
        if byte < 0x80 {
            return Ok((value, i + 1));
        }
    }
    Err(DecodeError::UnexpectedEof)
}

/// Encodes an unsigned LEB128 integer into `out`.
pub fn write_uleb128(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

/// Decodes a signed LEB128 integer from the front of `input`, returning the
/// value and how many bytes it occupied.
pub fn read_sleb128(input: &[u8]) -> Result<(i64, usize), DecodeError> {
    let mut value = 0i64;
    let mut shift = 0u32;
    for (i, &byte) in input.iter().enumerate() {
        if shift >= 64 {
            return Err(DecodeError::InvalidVarint);
        }
        value |= i64::from(byte & 0x7F) << shift;
        shift += 7;
        if byte < 0x80 {
            if shift < 64 && byte & 0x40 != 0 {
                // Sign-extend from the group's sign bit.
                value |= -1i64 << shift;
            }
            return Ok((value, i + 1));
        }
    }
    Err(DecodeError::UnexpectedEof)
}

/// Encodes a signed LEB128 integer into `out`.
pub fn write_sleb128(out: &mut Vec<u8>, mut v: i64) {
    loop {
        let byte = (v as u8) & 0x7F;
        v >>= 7;
        let done = (v == 0 && byte & 0x40 == 0) || (v == -1 && byte & 0x40 != 0);
        out.push(if done { byte } else { byte | 0x80 });
        if done {
            return;
        }
    }
}

const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC32_TABLE: [u32; 256] = crc32_table();

/// Incremental CRC-32 (IEEE 802.3 polynomial, reflected).
#[derive(Copy, Clone)]
pub struct Crc32(u32);

impl Crc32 {
    /// Creates a fresh checksum state.
    #[must_use]
    pub fn new() -> Self {
        Self(0xFFFF_FFFF)
    }

    /// Feeds `bytes` into the checksum.
    pub fn update(&mut self, bytes: &[u8]) {
        for &b in bytes {
            let ix = ((self.0 ^ u32::from(b)) & 0xFF) as usize;
            self.0 = (self.0 >> 8) ^ CRC32_TABLE[ix];
        }
    }

    /// Finalizes and returns the checksum.
    #[must_use]
    pub fn finish(self) -> u32 {
        self.0 ^ 0xFFFF_FFFF
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Crc32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Crc32({:08x})", self.0)
    }
}

/// Computes the CRC-32 of `bytes` in one shot.
#[must_use]
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut c = Crc32::new();
    c.update(bytes);
    c.finish()
}
