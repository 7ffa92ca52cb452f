//! Query-related backend messages.

use std::mem::size_of;

use zerocopy::byteorder::big_endian::{I16 as I16BE, I32 as I32BE, U16 as U16BE, U32 as U32BE};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::{Error, Result};
use crate::protocol::codec::{read_cstr, read_u16};
use crate::protocol::types::{FormatCode, Oid};

/// Fixed-size tail of a field description (18 bytes).
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct FieldDescriptionTail {
    /// Table OID (0 if not a table column)
    pub table_oid: U32BE,
    /// Column attribute number (0 if not a table column)
    pub column_id: I16BE,
    /// Data type OID
    pub type_oid: U32BE,
    /// Type size (-1 for variable, -2 for null-terminated)
    pub type_size: I16BE,
    /// Type modifier (type-specific)
    pub type_modifier: I32BE,
    /// Format code (0=text, 1=binary)
    pub format: U16BE,
}

/// Field description within a RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    /// Field name
    pub name: String,
    /// Table OID (0 if not a table column)
    pub table_oid: Oid,
    /// Column attribute number (0 if not a table column)
    pub column_id: i16,
    /// Data type OID
    pub type_oid: Oid,
    /// Type size (-1 for variable, -2 for null-terminated)
    pub type_size: i16,
    /// Type modifier (type-specific)
    pub type_modifier: i32,
    /// Format of this column's values in every DataRow of the query
    pub format: FormatCode,
}

/// RowDescription message - describes the columns in a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowDescription {
    /// Field descriptions, in column order
    pub fields: Vec<FieldDescription>,
}

impl RowDescription {
    /// Parse a RowDescription message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        const TAIL_SIZE: usize = size_of::<FieldDescriptionTail>();

        let (num_fields, mut data) = read_u16(payload)?;
        let mut fields = Vec::with_capacity(num_fields as usize);

        for _ in 0..num_fields {
            let (name, rest) = read_cstr(data)?;
            let (tail, rest) = FieldDescriptionTail::read_from_prefix(rest)
                .map_err(|e| Error::Protocol(format!("FieldDescription tail: {e:?}")))?;

            fields.push(FieldDescription {
                name: name.to_string(),
                table_oid: tail.table_oid.get(),
                column_id: tail.column_id.get(),
                type_oid: tail.type_oid.get(),
                type_size: tail.type_size.get(),
                type_modifier: tail.type_modifier.get(),
                format: FormatCode::from_u16(tail.format.get()),
            });

            data = rest;
        }

        Ok(Self { fields })
    }

    /// Column formats, in column order.
    pub fn formats(&self) -> Vec<FormatCode> {
        self.fields.iter().map(|f| f.format).collect()
    }
}

/// One non-NULL column value of a DataRow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Value of a text-format column
    Text(String),
    /// Value of a binary-format column
    Binary(Vec<u8>),
}

impl FieldValue {
    /// Raw bytes of the value regardless of format.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            FieldValue::Text(s) => s.as_bytes(),
            FieldValue::Binary(b) => b,
        }
    }

    /// Text of the value, if it came from a text-format column.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            FieldValue::Binary(_) => None,
        }
    }

    /// Format the value arrived in.
    pub fn format(&self) -> FormatCode {
        match self {
            FieldValue::Text(_) => FormatCode::Text,
            FieldValue::Binary(_) => FormatCode::Binary,
        }
    }
}

/// DataRow message - contains a single row of data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRow {
    /// Column values in column order; `None` is SQL NULL
    pub values: Vec<Option<FieldValue>>,
}

impl DataRow {
    /// Parse a DataRow message from payload bytes.
    ///
    /// The wire payload has no per-value format marker, so the formats
    /// declared by the query's RowDescription are passed in.
    pub fn parse(payload: &[u8], formats: &[FormatCode]) -> Result<Self> {
        let (num_columns, data) = read_u16(payload)?;
        let num_columns = num_columns as usize;
        if num_columns != formats.len() {
            return Err(Error::Protocol(format!(
                "DataRow has {} columns but RowDescription declared {}",
                num_columns,
                formats.len()
            )));
        }

        let mut values = Vec::with_capacity(num_columns);
        let mut iter = DataRowIter { remaining: data };
        for format in formats {
            let raw = iter
                .next()
                .ok_or_else(|| Error::Protocol("DataRow: truncated column value".into()))?;
            let value = match raw {
                None => None,
                Some(bytes) => Some(match format {
                    FormatCode::Text => {
                        let s = simdutf8::compat::from_utf8(bytes).map_err(|e| {
                            Error::Protocol(format!("DataRow: invalid UTF-8: {e}"))
                        })?;
                        FieldValue::Text(s.to_string())
                    }
                    FormatCode::Binary => FieldValue::Binary(bytes.to_vec()),
                }),
            };
            values.push(value);
        }

        Ok(Self { values })
    }

    /// Get the number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if there are no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Iterator over raw column values in a DataRow payload.
#[derive(Debug, Clone)]
struct DataRowIter<'a> {
    remaining: &'a [u8],
}

impl<'a> Iterator for DataRowIter<'a> {
    type Item = Option<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        let len;
        (len, self.remaining) = self.remaining.split_at_checked(4)?;
        let len = i32::from_be_bytes([len[0], len[1], len[2], len[3]]);

        if len < 0 {
            // NULL value
            Some(None)
        } else {
            let value;
            (value, self.remaining) = self.remaining.split_at_checked(len as usize)?;
            Some(Some(value))
        }
    }
}

/// CommandComplete message - indicates successful completion of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandComplete {
    /// Command tag (e.g., "SELECT 5", "INSERT 0 1", "UPDATE 10")
    pub tag: String,
}

impl CommandComplete {
    /// Parse a CommandComplete message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (tag, _) = read_cstr(payload)?;
        Ok(Self {
            tag: tag.to_string(),
        })
    }
}
