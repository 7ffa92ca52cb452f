//! Per-connection buffers shared by the state machines.

use crate::error::Result;
use crate::protocol::backend::{BackendMessage, MessageDecoder};
use crate::protocol::frame::FrameReader;

/// Buffer set for state machine operations.
#[derive(Debug)]
pub struct BufferSet {
    /// Bytes received from the server, reassembled into frames
    pub reader: FrameReader,
    /// Outgoing frames for the next write
    pub write_buffer: Vec<u8>,
    /// Column formats of the result set being read
    pub decoder: MessageDecoder,
}

impl BufferSet {
    /// Create a new buffer set.
    pub fn new() -> Self {
        Self {
            reader: FrameReader::new(),
            write_buffer: Vec::with_capacity(8192),
            decoder: MessageDecoder::new(),
        }
    }

    /// Decode the next buffered message, or `None` if more bytes are needed.
    pub fn next_message(&mut self) -> Result<Option<BackendMessage>> {
        match self.reader.next_frame()? {
            Some(raw) => self.decoder.decode(raw).map(Some),
            None => Ok(None),
        }
    }

    /// Forget all connection-specific contents, keeping allocations.
    pub fn reset(&mut self) {
        self.reader.clear();
        self.write_buffer.clear();
        self.decoder = MessageDecoder::new();
    }
}

impl Default for BufferSet {
    fn default() -> Self {
        Self::new()
    }
}
