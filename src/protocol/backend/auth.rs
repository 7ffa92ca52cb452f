//! Authentication-related backend messages.

use zerocopy::byteorder::big_endian::U32 as U32BE;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::{Error, Result};
use crate::protocol::codec::{read_bytes, read_cstr, read_i32, read_u8};
use crate::protocol::types::TransactionStatus;

/// Authentication method constants.
pub mod auth_type {
    pub const OK: i32 = 0;
    pub const CLEARTEXT_PASSWORD: i32 = 3;
    pub const MD5_PASSWORD: i32 = 5;
}

/// Authentication message from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationMessage {
    /// Authentication successful
    Ok,
    /// Cleartext password required
    CleartextPassword,
    /// MD5 password required (with 4-byte salt)
    Md5Password { salt: [u8; 4] },
    /// Any other method (Kerberos, GSS, SSPI, SASL, ...); never negotiated by this client
    Other(i32),
}

impl AuthenticationMessage {
    /// Parse an Authentication message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (auth_type, rest) = read_i32(payload)?;

        match auth_type {
            auth_type::OK => Ok(AuthenticationMessage::Ok),
            auth_type::CLEARTEXT_PASSWORD => Ok(AuthenticationMessage::CleartextPassword),
            auth_type::MD5_PASSWORD => {
                let (salt, _) = read_bytes(rest, 4)
                    .map_err(|_| Error::Protocol("MD5Password: missing salt".into()))?;
                let mut buf = [0u8; 4];
                buf.copy_from_slice(salt);
                Ok(AuthenticationMessage::Md5Password { salt: buf })
            }
            other => Ok(AuthenticationMessage::Other(other)),
        }
    }
}

/// BackendKeyData message - contains process ID and secret key for cancellation.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct BackendKeyData {
    /// Process ID of the backend
    pub pid: U32BE,
    /// Secret key for cancellation
    pub secret_key: U32BE,
}

impl BackendKeyData {
    /// Parse a BackendKeyData message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        Self::read_from_bytes(payload)
            .map_err(|e| Error::Protocol(format!("BackendKeyData: {e:?}")))
    }

    /// Get the process ID.
    pub fn process_id(&self) -> u32 {
        self.pid.get()
    }

    /// Get the secret key.
    pub fn secret(&self) -> u32 {
        self.secret_key.get()
    }
}

impl PartialEq for BackendKeyData {
    fn eq(&self, other: &Self) -> bool {
        self.process_id() == other.process_id() && self.secret() == other.secret()
    }
}

/// ParameterStatus message - server parameter name and value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterStatus {
    /// Parameter name
    pub name: String,
    /// Parameter value
    pub value: String,
}

impl ParameterStatus {
    /// Parse a ParameterStatus message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (name, rest) = read_cstr(payload)?;
        let (value, _) = read_cstr(rest)?;
        Ok(Self {
            name: name.to_string(),
            value: value.to_string(),
        })
    }
}

/// ReadyForQuery message - indicates server is ready for a new query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyForQuery {
    /// Transaction status
    pub status: TransactionStatus,
}

impl ReadyForQuery {
    /// Parse a ReadyForQuery message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (byte, _) = read_u8(payload)?;
        let status = TransactionStatus::from_byte(byte).ok_or_else(|| {
            Error::Protocol(format!("ReadyForQuery: unknown status '{}'", byte as char))
        })?;
        Ok(Self { status })
    }
}
