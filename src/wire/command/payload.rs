use std::collections::BTreeMap;
use std::io::Cursor;

use rmpv::Value;
use thiserror::Error;

pub type PayloadMap = BTreeMap<String, Value>;

#[derive(Debug, Error, PartialEq)]
pub enum PayloadError {
    #[error("missing payload field '{field}'")]
    MissingField { field: &'static str },
    #[error("invalid field type for '{field}', expected {expected}")]
    InvalidFieldType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("payload must be a map with UTF-8 string keys")]
    NotAStringKeyedMap,
    #[error("payload contains trailing MessagePack data")]
    TrailingData,
    #[error("messagepack decode error: {0}")]
    Decode(String),
    #[error("messagepack encode error: {0}")]
    Encode(String),
}

pub fn encode_payload(payload: PayloadMap) -> Result<Vec<u8>, PayloadError> {
    let entries = payload
        .into_iter()
        .map(|(key, value)| (Value::String(key.into()), value))
        .collect::<Vec<_>>();

    let mut encoded = Vec::new();
    rmpv::encode::write_value(&mut encoded, &Value::Map(entries))
        .map_err(|source| PayloadError::Encode(source.to_string()))?;
    Ok(encoded)
}

pub fn decode_payload(raw: &[u8]) -> Result<PayloadMap, PayloadError> {
    let mut cursor = Cursor::new(raw);
    let value = rmpv::decode::read_value(&mut cursor)
        .map_err(|source| PayloadError::Decode(source.to_string()))?;
    if cursor.position() as usize != raw.len() {
        return Err(PayloadError::TrailingData);
    }

    let Value::Map(entries) = value else {
        return Err(PayloadError::NotAStringKeyedMap);
    };

    let mut payload = PayloadMap::new();
    for (key, value) in entries {
        let Value::String(text) = key else {
            return Err(PayloadError::NotAStringKeyedMap);
        };
        let Some(text) = text.into_str() else {
            return Err(PayloadError::NotAStringKeyedMap);
        };
        payload.insert(text, value);
    }

    Ok(payload)
}

pub fn get_u64(payload: &PayloadMap, field: &'static str) -> Result<u64, PayloadError> {
    payload
        .get(field)
        .ok_or(PayloadError::MissingField { field })?
        .as_u64()
        .ok_or(PayloadError::InvalidFieldType {
            field,
            expected: "unsigned int",
        })
}

pub fn get_u32(payload: &PayloadMap, field: &'static str) -> Result<u32, PayloadError> {
    let value = get_u64(payload, field)?;
    u32::try_from(value).map_err(|_| PayloadError::InvalidFieldType {
        field,
        expected: "u32",
    })
}

pub fn get_u16(payload: &PayloadMap, field: &'static str) -> Result<u16, PayloadError> {
    let value = get_u64(payload, field)?;
    u16::try_from(value).map_err(|_| PayloadError::InvalidFieldType {
        field,
        expected: "u16",
    })
}

pub fn get_i64(payload: &PayloadMap, field: &'static str) -> Result<i64, PayloadError> {
    payload
        .get(field)
        .ok_or(PayloadError::MissingField { field })?
        .as_i64()
        .ok_or(PayloadError::InvalidFieldType {
            field,
            expected: "int",
        })
}

pub fn get_bool(payload: &PayloadMap, field: &'static str) -> Result<bool, PayloadError> {
    payload
        .get(field)
        .ok_or(PayloadError::MissingField { field })?
        .as_bool()
        .ok_or(PayloadError::InvalidFieldType {
            field,
            expected: "bool",
        })
}

pub fn get_string(payload: &PayloadMap, field: &'static str) -> Result<String, PayloadError> {
    payload
        .get(field)
        .ok_or(PayloadError::MissingField { field })?
        .as_str()
        .map(str::to_owned)
        .ok_or(PayloadError::InvalidFieldType {
            field,
            expected: "string",
        })
}

/// Builds a payload map from `(key, value)` pairs.
pub fn payload<const N: usize>(entries: [(&str, Value); N]) -> PayloadMap {
    entries
        .into_iter()
        .map(|(key, value)| (key.to_owned(), value))
        .collect()
}

#[cfg(test)]
mod tests {
    use rmpv::Value;

    use super::{decode_payload, encode_payload, get_u32, payload, PayloadError, PayloadMap};

    #[test]
    fn rejects_non_map_payload() {
        let mut raw = Vec::new();
        rmpv::encode::write_value(&mut raw, &Value::Array(vec![]))
            .expect("test payload should encode");

        let err = decode_payload(&raw).expect_err("array payload should fail");
        assert_eq!(err, PayloadError::NotAStringKeyedMap);
    }

    #[test]
    fn rejects_trailing_data() {
        let mut raw = encode_payload(PayloadMap::new()).expect("empty map should encode");
        rmpv::encode::write_value(&mut raw, &Value::Nil).expect("nil should encode");

        let err = decode_payload(&raw).expect_err("trailing data should fail");
        assert_eq!(err, PayloadError::TrailingData);
    }

    #[test]
    fn narrow_integer_getters_reject_overflow() {
        let map = payload([("cpus", Value::from(u64::from(u32::MAX) + 1))]);

        let err = get_u32(&map, "cpus").expect_err("overflow should fail");
        assert!(matches!(err, PayloadError::InvalidFieldType { field: "cpus", .. }));
    }
}
