//! Column value decoding.
//!
//! A [`TypeRegistry`] maps `(type oid, format)` to a decoder producing a
//! [`Value`]. Columns whose type has no registered decoder pass through as
//! [`Value::Text`] or [`Value::Bytes`].
//!
//! The registry is immutable once built and is handed to connections through
//! [`Opts::registry`](crate::Opts::registry):
//!
//! ```
//! use slim_postgres::types::{TypeRegistry, Value};
//! use slim_postgres::protocol::types::FormatCode;
//! use slim_postgres::protocol::backend::FieldValue;
//!
//! fn shout(v: &FieldValue) -> slim_postgres::Result<Value> {
//!     Ok(Value::Text(v.as_str().unwrap_or_default().to_uppercase()))
//! }
//!
//! let registry = TypeRegistry::standard().with(25, FormatCode::Text, shout);
//! ```

pub mod array;
mod binary;
mod text;

use std::collections::HashMap;

use crate::error::Result;
use crate::protocol::backend::{FieldDescription, FieldValue};
use crate::protocol::types::{FormatCode, Oid, oid};

pub use array::{ArrayElem, parse_array, parse_text_array};

/// A decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL
    Null,
    Bool(bool),
    /// Any integer type (int2, int4, int8, oid)
    Int(i64),
    /// Any floating-point type (float4, float8)
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// Array of any dimension; nested dimensions are nested `Array`s
    Array(Vec<Value>),
    #[cfg(feature = "with-chrono")]
    Date(chrono::NaiveDate),
    #[cfg(feature = "with-chrono")]
    Timestamp(chrono::NaiveDateTime),
    #[cfg(feature = "with-chrono")]
    TimestampTz(chrono::DateTime<chrono::Utc>),
}

impl Value {
    /// Returns true for SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }
}

impl From<ArrayElem<Value>> for Value {
    fn from(elem: ArrayElem<Value>) -> Self {
        match elem {
            ArrayElem::Null => Value::Null,
            ArrayElem::Value(v) => v,
            ArrayElem::Nested(items) => Value::Array(items.into_iter().map(Value::from).collect()),
        }
    }
}

/// Decoder for one `(oid, format)` pair.
pub type DecodeFn = fn(&FieldValue) -> Result<Value>;

/// Immutable mapping from `(type oid, format)` to a value decoder.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    decoders: HashMap<(Oid, FormatCode), DecodeFn>,
}

impl TypeRegistry {
    /// A registry with no decoders; every value passes through.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in decoders for the common scalar and array types.
    pub fn standard() -> Self {
        use FormatCode::{Binary, Text};

        let mut registry = Self::empty()
            .with(oid::BOOL, Text, text::decode_bool)
            .with(oid::INT2, Text, text::decode_int)
            .with(oid::INT4, Text, text::decode_int)
            .with(oid::INT8, Text, text::decode_int)
            .with(oid::OID, Text, text::decode_int)
            .with(oid::FLOAT4, Text, text::decode_float)
            .with(oid::FLOAT8, Text, text::decode_float)
            .with(oid::TEXT, Text, text::decode_text)
            .with(oid::VARCHAR, Text, text::decode_text)
            .with(oid::BPCHAR, Text, text::decode_text)
            .with(oid::NAME, Text, text::decode_text)
            .with(oid::BYTEA, Text, text::decode_bytea)
            .with(oid::BOOL_ARRAY, Text, text::decode_bool_array)
            .with(oid::INT2_ARRAY, Text, text::decode_int_array)
            .with(oid::INT4_ARRAY, Text, text::decode_int_array)
            .with(oid::INT8_ARRAY, Text, text::decode_int_array)
            .with(oid::OID_ARRAY, Text, text::decode_int_array)
            .with(oid::FLOAT4_ARRAY, Text, text::decode_float_array)
            .with(oid::FLOAT8_ARRAY, Text, text::decode_float_array)
            .with(oid::TEXT_ARRAY, Text, text::decode_text_array)
            .with(oid::VARCHAR_ARRAY, Text, text::decode_text_array)
            .with(oid::BPCHAR_ARRAY, Text, text::decode_text_array)
            .with(oid::BOOL, Binary, binary::decode_bool)
            .with(oid::INT2, Binary, binary::decode_int2)
            .with(oid::INT4, Binary, binary::decode_int4)
            .with(oid::INT8, Binary, binary::decode_int8)
            .with(oid::OID, Binary, binary::decode_oid)
            .with(oid::FLOAT4, Binary, binary::decode_float4)
            .with(oid::FLOAT8, Binary, binary::decode_float8)
            .with(oid::TEXT, Binary, binary::decode_text)
            .with(oid::VARCHAR, Binary, binary::decode_text)
            .with(oid::BPCHAR, Binary, binary::decode_text)
            .with(oid::NAME, Binary, binary::decode_text)
            .with(oid::BYTEA, Binary, binary::decode_bytea);

        #[cfg(feature = "with-chrono")]
        {
            registry = registry
                .with(oid::DATE, Text, text::decode_date)
                .with(oid::TIMESTAMP, Text, text::decode_timestamp)
                .with(oid::TIMESTAMPTZ, Text, text::decode_timestamptz)
                .with(oid::DATE, Binary, binary::decode_date)
                .with(oid::TIMESTAMP, Binary, binary::decode_timestamp)
                .with(oid::TIMESTAMPTZ, Binary, binary::decode_timestamptz);
        }

        registry.decoders.shrink_to_fit();
        registry
    }

    /// Register (or replace) the decoder for `(oid, format)`.
    #[must_use]
    pub fn with(mut self, oid: Oid, format: FormatCode, decoder: DecodeFn) -> Self {
        self.decoders.insert((oid, format), decoder);
        self
    }

    /// Look up the decoder for `(oid, format)`.
    pub fn get(&self, oid: Oid, format: FormatCode) -> Option<DecodeFn> {
        self.decoders.get(&(oid, format)).copied()
    }

    /// Decode one column value described by `field`.
    pub fn decode(&self, field: &FieldDescription, value: Option<&FieldValue>) -> Result<Value> {
        let Some(value) = value else {
            return Ok(Value::Null);
        };
        match self.get(field.type_oid, value.format()) {
            Some(decoder) => decoder(value),
            None => Ok(match value {
                FieldValue::Text(s) => Value::Text(s.clone()),
                FieldValue::Binary(b) => Value::Bytes(b.clone()),
            }),
        }
    }
}
