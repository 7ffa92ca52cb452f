//! PostgreSQL backend (server → client) messages.

pub mod auth;
pub mod error;
pub mod query;

pub use auth::{AuthenticationMessage, BackendKeyData, ParameterStatus, ReadyForQuery};
pub use error::{ErrorResponse, NoticeResponse};
pub use query::{CommandComplete, DataRow, FieldDescription, FieldValue, RowDescription};

use crate::error::{Error, Result};
use crate::protocol::types::FormatCode;

/// Backend message type bytes.
pub mod msg_type {
    /// Authentication message
    pub const AUTHENTICATION: u8 = b'R';
    /// BackendKeyData
    pub const BACKEND_KEY_DATA: u8 = b'K';
    /// ParameterStatus
    pub const PARAMETER_STATUS: u8 = b'S';
    /// ReadyForQuery
    pub const READY_FOR_QUERY: u8 = b'Z';
    /// RowDescription
    pub const ROW_DESCRIPTION: u8 = b'T';
    /// DataRow
    pub const DATA_ROW: u8 = b'D';
    /// CommandComplete
    pub const COMMAND_COMPLETE: u8 = b'C';
    /// EmptyQueryResponse
    pub const EMPTY_QUERY_RESPONSE: u8 = b'I';
    /// ErrorResponse
    pub const ERROR_RESPONSE: u8 = b'E';
    /// NoticeResponse
    pub const NOTICE_RESPONSE: u8 = b'N';
}

/// Raw message from the PostgreSQL server.
///
/// This is a thin wrapper around the message type byte and payload,
/// borrowed from the frame reader's buffer.
#[derive(Debug, Clone, Copy)]
pub struct RawMessage<'a> {
    /// Message type byte
    pub type_byte: u8,
    /// Message payload (after length field)
    pub payload: &'a [u8],
}

impl<'a> RawMessage<'a> {
    /// Create a new RawMessage.
    pub fn new(type_byte: u8, payload: &'a [u8]) -> Self {
        Self { type_byte, payload }
    }
}

/// A decoded backend message, one variant per message kind.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    Authentication(AuthenticationMessage),
    BackendKeyData(BackendKeyData),
    ParameterStatus(ParameterStatus),
    ReadyForQuery(ReadyForQuery),
    RowDescription(RowDescription),
    DataRow(DataRow),
    CommandComplete(CommandComplete),
    EmptyQueryResponse,
    ErrorResponse(ErrorResponse),
    NoticeResponse(NoticeResponse),
}

impl BackendMessage {
    /// Decode one frame.
    ///
    /// `formats` are the column formats of the RowDescription currently in
    /// effect; they are only consulted for DataRow.
    pub fn decode(raw: RawMessage<'_>, formats: &[FormatCode]) -> Result<Self> {
        let payload = raw.payload;
        let msg = match raw.type_byte {
            msg_type::AUTHENTICATION => {
                BackendMessage::Authentication(AuthenticationMessage::parse(payload)?)
            }
            msg_type::BACKEND_KEY_DATA => {
                BackendMessage::BackendKeyData(BackendKeyData::parse(payload)?)
            }
            msg_type::PARAMETER_STATUS => {
                BackendMessage::ParameterStatus(ParameterStatus::parse(payload)?)
            }
            msg_type::READY_FOR_QUERY => {
                BackendMessage::ReadyForQuery(ReadyForQuery::parse(payload)?)
            }
            msg_type::ROW_DESCRIPTION => {
                BackendMessage::RowDescription(RowDescription::parse(payload)?)
            }
            msg_type::DATA_ROW => BackendMessage::DataRow(DataRow::parse(payload, formats)?),
            msg_type::COMMAND_COMPLETE => {
                BackendMessage::CommandComplete(CommandComplete::parse(payload)?)
            }
            msg_type::EMPTY_QUERY_RESPONSE => BackendMessage::EmptyQueryResponse,
            msg_type::ERROR_RESPONSE => BackendMessage::ErrorResponse(ErrorResponse::parse(payload)?),
            msg_type::NOTICE_RESPONSE => {
                BackendMessage::NoticeResponse(NoticeResponse::parse(payload)?)
            }
            other => {
                return Err(Error::Protocol(format!(
                    "Unknown message type: '{}'",
                    other as char
                )));
            }
        };
        Ok(msg)
    }
}

/// Stateful decoder for one connection.
///
/// Remembers the column formats of the latest RowDescription so that the
/// DataRows of the same query decode each value as text or binary.
#[derive(Debug, Default)]
pub struct MessageDecoder {
    formats: Vec<FormatCode>,
}

impl MessageDecoder {
    /// Create a decoder with no result set in effect.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one frame, updating the per-query column formats.
    pub fn decode(&mut self, raw: RawMessage<'_>) -> Result<BackendMessage> {
        let msg = BackendMessage::decode(raw, &self.formats)?;
        match &msg {
            BackendMessage::RowDescription(desc) => self.formats = desc.formats(),
            BackendMessage::ReadyForQuery(_) => self.formats.clear(),
            _ => {}
        }
        Ok(msg)
    }
}
