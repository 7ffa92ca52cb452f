//! ErrorResponse and NoticeResponse.

use crate::error::{Error, ErrorFields, Result};
use crate::protocol::codec::{read_cstr, read_u8};

/// Text-valued field identified by its wire code.
fn text_slot(fields: &mut ErrorFields, code: u8) -> Option<&mut Option<String>> {
    let slot = match code {
        b'S' => &mut fields.severity,
        b'V' => &mut fields.severity_non_localized,
        b'C' => &mut fields.code,
        b'M' => &mut fields.message,
        b'D' => &mut fields.detail,
        b'H' => &mut fields.hint,
        b'q' => &mut fields.internal_query,
        b'W' => &mut fields.where_,
        b's' => &mut fields.schema,
        b't' => &mut fields.table,
        b'c' => &mut fields.column,
        b'd' => &mut fields.data_type,
        b'n' => &mut fields.constraint,
        b'F' => &mut fields.file,
        b'R' => &mut fields.routine,
        _ => return None,
    };
    Some(slot)
}

/// Numeric field identified by its wire code.
fn number_slot(fields: &mut ErrorFields, code: u8) -> Option<&mut Option<u32>> {
    match code {
        b'P' => Some(&mut fields.position),
        b'p' => Some(&mut fields.internal_position),
        b'L' => Some(&mut fields.line),
        _ => None,
    }
}

/// Decode `(code byte, cstring)*` followed by a zero byte.
fn parse_fields(payload: &[u8]) -> Result<ErrorFields> {
    let mut fields = ErrorFields::default();
    let mut data = payload;

    loop {
        let (code, rest) = read_u8(data)?;
        if code == 0 {
            return Ok(fields);
        }
        let (value, rest) = read_cstr(rest)?;
        data = rest;

        if let Some(slot) = text_slot(&mut fields, code) {
            *slot = Some(value.to_string());
        } else if let Some(slot) = number_slot(&mut fields, code) {
            *slot = value.parse().ok();
        } else {
            tracing::debug!("ignoring error field {:?}", code as char);
        }
    }
}

/// ErrorResponse message - error reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    /// Parsed error fields
    pub fields: ErrorFields,
}

impl ErrorResponse {
    /// Parse an ErrorResponse message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        Ok(Self {
            fields: parse_fields(payload)?,
        })
    }

    /// Convert to an Error.
    pub fn into_error(self) -> Error {
        Error::Server(self.fields)
    }

    /// Get the SQLSTATE code.
    pub fn code(&self) -> Option<&str> {
        self.fields.code.as_deref()
    }
}

/// NoticeResponse message - non-fatal warning/info from server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoticeResponse {
    /// Parsed notice fields
    pub fields: ErrorFields,
}

impl NoticeResponse {
    /// Parse a NoticeResponse message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        Ok(Self {
            fields: parse_fields(payload)?,
        })
    }
}
