//! PostgreSQL frontend (client → server) messages.

pub mod auth;
pub mod simple;
pub mod startup;

pub use auth::{md5_password, write_password};
pub use simple::write_query;
pub use startup::{write_ssl_request, write_startup, write_terminate};

/// Frontend message type bytes.
pub mod msg_type {
    /// Password response (cleartext or MD5)
    pub const PASSWORD: u8 = b'p';
    /// Query (simple query protocol)
    pub const QUERY: u8 = b'Q';
    /// Terminate
    pub const TERMINATE: u8 = b'X';
}
