//! Action types for state machine I/O requests.

/// Action requested by a state machine.
///
/// The caller should perform the requested I/O and then call `step()` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Write `buffer_set.write_buffer` to the server, then read a single raw byte.
    ///
    /// Used for encryption negotiation: write the SSL request, then read 'S' or 'N'.
    /// The byte is handed back through the state machine's setter.
    WriteAndReadByte,

    /// Read more bytes from the server into `buffer_set.reader`.
    ///
    /// Issued whenever the buffered bytes do not yet hold a complete frame.
    ReadMessage,

    /// Write `buffer_set.write_buffer` to the server and clear it.
    Write,

    /// Upgrade the transport to TLS.
    TlsHandshake,

    /// The state machine has finished successfully.
    Finished,
}
