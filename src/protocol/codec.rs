//! PostgreSQL wire protocol encoding and decoding primitives.
//!
//! PostgreSQL uses big-endian (network byte order) for all integers.

use crate::error::{Error, Result};
use zerocopy::FromBytes;
use zerocopy::byteorder::big_endian::{I32 as I32BE, U16 as U16BE};

fn short(what: &str, data: &[u8], need: usize) -> Error {
    Error::Protocol(format!("{}: need {} bytes, have {}", what, need, data.len()))
}

/// Split off one byte.
#[inline]
pub fn read_u8(data: &[u8]) -> Result<(u8, &[u8])> {
    data.split_first()
        .map(|(&byte, rest)| (byte, rest))
        .ok_or_else(|| short("u8", data, 1))
}

/// Split off a big-endian u16.
#[inline]
pub fn read_u16(data: &[u8]) -> Result<(u16, &[u8])> {
    let (value, rest) = U16BE::read_from_prefix(data).map_err(|_| short("u16", data, 2))?;
    Ok((value.get(), rest))
}

/// Split off a big-endian i32.
#[inline]
pub fn read_i32(data: &[u8]) -> Result<(i32, &[u8])> {
    let (value, rest) = I32BE::read_from_prefix(data).map_err(|_| short("i32", data, 4))?;
    Ok((value.get(), rest))
}

/// Split off `len` raw bytes.
#[inline]
pub fn read_bytes(data: &[u8], len: usize) -> Result<(&[u8], &[u8])> {
    data.split_at_checked(len)
        .ok_or_else(|| short("bytes", data, len))
}

/// Split off a null-terminated UTF-8 string, dropping the terminator.
#[inline]
pub fn read_cstr(data: &[u8]) -> Result<(&str, &[u8])> {
    let pos = memchr::memchr(0, data)
        .ok_or_else(|| Error::Protocol("string without null terminator".into()))?;
    let (bytes, rest) = data.split_at(pos);
    let s = simdutf8::compat::from_utf8(bytes)
        .map_err(|e| Error::Protocol(format!("invalid UTF-8 in string: {e}")))?;
    Ok((s, &rest[1..]))
}

/// Frontend message under construction.
///
/// Layout: optional tag byte, then a 4-byte length that counts itself and
/// the payload but not the tag. The length is back-filled by `finish`.
pub struct MessageBuilder<'a> {
    buf: &'a mut Vec<u8>,
    length_at: usize,
}

impl<'a> MessageBuilder<'a> {
    /// Start a tagged message.
    pub fn new(buf: &'a mut Vec<u8>, tag: u8) -> Self {
        buf.push(tag);
        Self::new_startup(buf)
    }

    /// Start an untagged message (startup packet, SSL request).
    pub fn new_startup(buf: &'a mut Vec<u8>) -> Self {
        let length_at = buf.len();
        buf.extend_from_slice(&[0; 4]);
        Self { buf, length_at }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Write `s` followed by a null byte.
    pub fn write_cstr(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    /// Back-fill the length field.
    pub fn finish(self) {
        let len = (self.buf.len() - self.length_at) as i32;
        self.buf[self.length_at..self.length_at + 4].copy_from_slice(&len.to_be_bytes());
    }
}
