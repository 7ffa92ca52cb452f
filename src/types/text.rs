//! Decoders for text-format values.

use crate::error::{Error, Result};
use crate::protocol::backend::FieldValue;

use super::Value;
use super::array::parse_array;

fn as_text(value: &FieldValue) -> Result<&str> {
    value
        .as_str()
        .ok_or_else(|| Error::Decode("expected a text-format value".into()))
}

fn parse_bool(s: &str) -> Result<bool> {
    match s {
        "t" | "true" | "TRUE" | "T" | "y" | "yes" | "on" | "1" => Ok(true),
        "f" | "false" | "FALSE" | "F" | "n" | "no" | "off" | "0" => Ok(false),
        _ => Err(Error::Decode(format!("invalid boolean: {s:?}"))),
    }
}

fn parse_int(s: &str) -> Result<i64> {
    s.parse()
        .map_err(|e| Error::Decode(format!("invalid integer {s:?}: {e}")))
}

fn parse_float(s: &str) -> Result<f64> {
    s.parse()
        .map_err(|e| Error::Decode(format!("invalid float {s:?}: {e}")))
}

pub(super) fn decode_bool(value: &FieldValue) -> Result<Value> {
    parse_bool(as_text(value)?).map(Value::Bool)
}

pub(super) fn decode_int(value: &FieldValue) -> Result<Value> {
    parse_int(as_text(value)?).map(Value::Int)
}

pub(super) fn decode_float(value: &FieldValue) -> Result<Value> {
    parse_float(as_text(value)?).map(Value::Float)
}

pub(super) fn decode_text(value: &FieldValue) -> Result<Value> {
    Ok(Value::Text(as_text(value)?.to_string()))
}

/// bytea in the `\x` hex output format.
pub(super) fn decode_bytea(value: &FieldValue) -> Result<Value> {
    let s = as_text(value)?;
    let hex = s
        .strip_prefix("\\x")
        .ok_or_else(|| Error::Decode(format!("unsupported bytea format: {s:?}")))?;
    if hex.len() % 2 != 0 {
        return Err(Error::Decode("odd-length bytea hex".into()));
    }
    hex.as_bytes()
        .chunks_exact(2)
        .map(|pair| {
            let digits = simdutf8::compat::from_utf8(pair)
                .map_err(|e| Error::Decode(format!("invalid UTF-8: {e}")))?;
            u8::from_str_radix(digits, 16)
                .map_err(|e| Error::Decode(format!("invalid bytea hex {digits:?}: {e}")))
        })
        .collect::<Result<Vec<u8>>>()
        .map(Value::Bytes)
}

fn decode_array_with(value: &FieldValue, leaf: fn(&str) -> Result<Value>) -> Result<Value> {
    let items = parse_array(as_text(value)?, leaf)?;
    Ok(Value::Array(items.into_iter().map(Value::from).collect()))
}

pub(super) fn decode_bool_array(value: &FieldValue) -> Result<Value> {
    decode_array_with(value, |s| parse_bool(s).map(Value::Bool))
}

pub(super) fn decode_int_array(value: &FieldValue) -> Result<Value> {
    decode_array_with(value, |s| parse_int(s).map(Value::Int))
}

pub(super) fn decode_float_array(value: &FieldValue) -> Result<Value> {
    decode_array_with(value, |s| parse_float(s).map(Value::Float))
}

pub(super) fn decode_text_array(value: &FieldValue) -> Result<Value> {
    decode_array_with(value, |s| Ok(Value::Text(s.to_string())))
}

#[cfg(feature = "with-chrono")]
pub(super) fn decode_date(value: &FieldValue) -> Result<Value> {
    let s = as_text(value)?;
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map(Value::Date)
        .map_err(|e| Error::Decode(format!("invalid date: {e}")))
}

#[cfg(feature = "with-chrono")]
pub(super) fn decode_timestamp(value: &FieldValue) -> Result<Value> {
    let s = as_text(value)?;
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .map(Value::Timestamp)
        .map_err(|e| Error::Decode(format!("invalid timestamp: {e}")))
}

/// Server output looks like `2024-01-15 10:30:00+00`.
#[cfg(feature = "with-chrono")]
pub(super) fn decode_timestamptz(value: &FieldValue) -> Result<Value> {
    let s = as_text(value)?;
    chrono::DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z")
        .or_else(|_| chrono::DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%#z"))
        .map(|dt| Value::TimestampTz(dt.with_timezone(&chrono::Utc)))
        .map_err(|e| Error::Decode(format!("invalid timestamptz: {e}")))
}
