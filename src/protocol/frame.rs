//! Reassembly of length-prefixed backend frames from a chunked byte stream.
//!
//! A backend frame is laid out as:
//! - Type byte (1 byte)
//! - Length (4 bytes, big-endian) - counts itself, not the type byte
//! - Payload (Length - 4 bytes)
//!
//! Bytes arrive in whatever chunks the transport hands out. [`FrameReader`]
//! buffers them and yields a frame only once every byte of it is present.

use crate::error::{Error, Result};

use super::backend::RawMessage;

/// Size of the type byte plus the length field.
pub const HEADER_LEN: usize = 5;

/// Largest length the server will ever declare (1 GiB).
pub const MAX_FRAME_LEN: usize = 0x4000_0000;

const INITIAL_CAPACITY: usize = 8192;

/// Incremental frame reader.
///
/// Consumed bytes are not shifted out on every frame; the buffer is compacted
/// lazily the next time more input is appended.
#[derive(Debug)]
pub struct FrameReader {
    buf: Vec<u8>,
    /// Start of the first unconsumed byte
    pos: usize,
}

impl FrameReader {
    /// Create an empty reader.
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(INITIAL_CAPACITY),
            pos: 0,
        }
    }

    /// Number of buffered bytes not yet returned as part of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Returns true if no unconsumed bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.buffered() == 0
    }

    /// Append a chunk of bytes received from the transport.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.compact();
        self.buf.extend_from_slice(chunk);
    }

    /// Borrow `additional` writable bytes at the tail of the buffer.
    ///
    /// After filling `n` of them, call [`FrameReader::commit`] with `n`.
    pub fn spare(&mut self, additional: usize) -> &mut [u8] {
        self.compact();
        let len = self.buf.len();
        self.buf.resize(len + additional, 0);
        &mut self.buf[len..]
    }

    /// Keep `filled` bytes of the region handed out by the last [`FrameReader::spare`].
    pub fn commit(&mut self, spare: usize, filled: usize) {
        let keep = self.buf.len() - spare + filled.min(spare);
        self.buf.truncate(keep);
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.pos = 0;
    }

    /// Extract the next complete frame.
    ///
    /// Returns `Ok(None)` without consuming anything if the buffered bytes do
    /// not yet hold a whole frame (including the case of a partial header).
    pub fn next_frame(&mut self) -> Result<Option<RawMessage<'_>>> {
        let available = &self.buf[self.pos..];
        let Some(header) = available.get(..HEADER_LEN) else {
            return Ok(None);
        };

        let type_byte = header[0];
        let length = i32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        if length < 4 || length as usize > MAX_FRAME_LEN {
            return Err(Error::Protocol(format!(
                "invalid length {} for message '{}'",
                length, type_byte as char
            )));
        }

        let total = 1 + length as usize;
        if available.len() < total {
            return Ok(None);
        }

        let start = self.pos;
        self.pos += total;
        tracing::trace!(type_byte = %(type_byte as char), length, "frame");
        Ok(Some(RawMessage::new(
            type_byte,
            &self.buf[start + HEADER_LEN..start + total],
        )))
    }

    fn compact(&mut self) {
        if self.pos == 0 {
            return;
        }
        if self.pos == self.buf.len() {
            self.buf.clear();
        } else {
            self.buf.drain(..self.pos);
        }
        self.pos = 0;
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}
