//! Decoders for binary-format values.

use crate::error::{Error, Result};
use crate::protocol::backend::FieldValue;

use super::Value;

fn fixed<const N: usize>(value: &FieldValue, what: &str) -> Result<[u8; N]> {
    let bytes = value.as_bytes();
    bytes
        .try_into()
        .map_err(|_| Error::Decode(format!("invalid {} length: {}", what, bytes.len())))
}

pub(super) fn decode_bool(value: &FieldValue) -> Result<Value> {
    let [b] = fixed::<1>(value, "boolean")?;
    Ok(Value::Bool(b != 0))
}

pub(super) fn decode_int2(value: &FieldValue) -> Result<Value> {
    Ok(Value::Int(i16::from_be_bytes(fixed(value, "int2")?).into()))
}

pub(super) fn decode_int4(value: &FieldValue) -> Result<Value> {
    Ok(Value::Int(i32::from_be_bytes(fixed(value, "int4")?).into()))
}

pub(super) fn decode_int8(value: &FieldValue) -> Result<Value> {
    Ok(Value::Int(i64::from_be_bytes(fixed(value, "int8")?)))
}

pub(super) fn decode_oid(value: &FieldValue) -> Result<Value> {
    Ok(Value::Int(u32::from_be_bytes(fixed(value, "oid")?).into()))
}

pub(super) fn decode_float4(value: &FieldValue) -> Result<Value> {
    Ok(Value::Float(f32::from_be_bytes(fixed(value, "float4")?).into()))
}

pub(super) fn decode_float8(value: &FieldValue) -> Result<Value> {
    Ok(Value::Float(f64::from_be_bytes(fixed(value, "float8")?)))
}

pub(super) fn decode_text(value: &FieldValue) -> Result<Value> {
    let s = simdutf8::compat::from_utf8(value.as_bytes())
        .map_err(|e| Error::Decode(format!("invalid UTF-8: {e}")))?;
    Ok(Value::Text(s.to_string()))
}

pub(super) fn decode_bytea(value: &FieldValue) -> Result<Value> {
    Ok(Value::Bytes(value.as_bytes().to_vec()))
}

#[cfg(feature = "with-chrono")]
mod datetime {
    use chrono::{NaiveDate, NaiveDateTime, TimeDelta};

    use super::*;

    /// PostgreSQL epoch: 2000-01-01
    const PG_EPOCH: NaiveDate = match NaiveDate::from_ymd_opt(2000, 1, 1) {
        Some(d) => d,
        None => panic!("invalid date"),
    };

    fn from_pg_micros(usecs: i64) -> Result<NaiveDateTime> {
        PG_EPOCH
            .and_hms_opt(0, 0, 0)
            .and_then(|epoch| epoch.checked_add_signed(TimeDelta::microseconds(usecs)))
            .ok_or_else(|| Error::Decode("timestamp overflow".into()))
    }

    pub(in crate::types) fn decode_date(value: &FieldValue) -> Result<Value> {
        let days = i32::from_be_bytes(fixed(value, "date")?);
        PG_EPOCH
            .checked_add_signed(TimeDelta::days(days.into()))
            .map(Value::Date)
            .ok_or_else(|| Error::Decode("date overflow".into()))
    }

    pub(in crate::types) fn decode_timestamp(value: &FieldValue) -> Result<Value> {
        let usecs = i64::from_be_bytes(fixed(value, "timestamp")?);
        from_pg_micros(usecs).map(Value::Timestamp)
    }

    /// Stored as UTC microseconds since the epoch.
    pub(in crate::types) fn decode_timestamptz(value: &FieldValue) -> Result<Value> {
        let usecs = i64::from_be_bytes(fixed(value, "timestamptz")?);
        from_pg_micros(usecs).map(|dt| Value::TimestampTz(dt.and_utc()))
    }
}

#[cfg(feature = "with-chrono")]
pub(super) use datetime::{decode_date, decode_timestamp, decode_timestamptz};

#[cfg(test)]
mod tests {
    use super::*;

    fn bin(bytes: &[u8]) -> FieldValue {
        FieldValue::Binary(bytes.to_vec())
    }

    #[test]
    fn test_integers() {
        assert_eq!(decode_int2(&bin(&(-2i16).to_be_bytes())).unwrap(), Value::Int(-2));
        assert_eq!(decode_int4(&bin(&7i32.to_be_bytes())).unwrap(), Value::Int(7));
        assert_eq!(
            decode_int8(&bin(&i64::MIN.to_be_bytes())).unwrap(),
            Value::Int(i64::MIN)
        );
        assert_eq!(
            decode_oid(&bin(&u32::MAX.to_be_bytes())).unwrap(),
            Value::Int(u32::MAX.into())
        );
    }

    #[test]
    fn test_wrong_length() {
        assert!(decode_int4(&bin(&[0, 0, 1])).is_err());
        assert!(decode_bool(&bin(&[])).is_err());
        assert!(decode_float8(&bin(&1.0f32.to_be_bytes())).is_err());
    }

    #[test]
    fn test_floats_and_text() {
        assert_eq!(decode_float4(&bin(&1.5f32.to_be_bytes())).unwrap(), Value::Float(1.5));
        assert_eq!(decode_float8(&bin(&(-0.25f64).to_be_bytes())).unwrap(), Value::Float(-0.25));
        assert_eq!(decode_text(&bin("h\u{e9}llo".as_bytes())).unwrap(), Value::Text("h\u{e9}llo".into()));
        assert!(decode_text(&bin(&[0xff, 0xfe])).is_err());
        assert_eq!(decode_bool(&bin(&[1])).unwrap(), Value::Bool(true));
    }

    #[cfg(feature = "with-chrono")]
    #[test]
    fn test_datetime() {
        use chrono::NaiveDate;

        assert_eq!(
            decode_date(&bin(&1i32.to_be_bytes())).unwrap(),
            Value::Date(NaiveDate::from_ymd_opt(2000, 1, 2).unwrap())
        );
        assert_eq!(
            decode_date(&bin(&(-1i32).to_be_bytes())).unwrap(),
            Value::Date(NaiveDate::from_ymd_opt(1999, 12, 31).unwrap())
        );

        let one_sec_and_a_half = 1_500_000i64;
        let expected = NaiveDate::from_ymd_opt(2000, 1, 1)
            .unwrap()
            .and_hms_micro_opt(0, 0, 1, 500_000)
            .unwrap();
        assert_eq!(
            decode_timestamp(&bin(&one_sec_and_a_half.to_be_bytes())).unwrap(),
            Value::Timestamp(expected)
        );
        assert_eq!(
            decode_timestamptz(&bin(&one_sec_and_a_half.to_be_bytes())).unwrap(),
            Value::TimestampTz(expected.and_utc())
        );
    }
}
