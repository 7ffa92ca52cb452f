//! PostgreSQL wire protocol implementation.
//!
//! This module contains the low-level protocol encoding and decoding.
//!
//! # Structure
//!
//! - `backend`: Server → Client messages (decoding)
//! - `frontend`: Client → Server messages (encoding)
//! - `frame`: Reassembly of backend frames from a chunked byte stream
//! - `codec`: Low-level encoding/decoding primitives
//! - `types`: Common protocol types (FormatCode, Oid, TransactionStatus)

pub mod backend;
pub mod codec;
pub mod frame;
pub mod frontend;
pub mod types;

// Re-export commonly used types
pub use backend::{BackendMessage, MessageDecoder, RawMessage};
pub use frame::FrameReader;
pub use types::{FormatCode, Oid, TransactionStatus};
