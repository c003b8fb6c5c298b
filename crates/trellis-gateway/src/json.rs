use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde_json::Value;
use tracing::warn;
use trellis_object::{Fault, Map, Object};

/// Decodes a JSON payload that must be an object, into the bus object
/// model. JSON strings become byte strings; object key order is
/// preserved.
pub fn decode_json_map(payload: &[u8]) -> Result<Map<'static>, Fault> {
    let value: Value = serde_json::from_slice(payload).map_err(|err| {
        warn!(%err, "payload is not valid json");
        Fault::Parse
    })?;
    match value {
        Value::Object(map) => Ok(json_object_to_map(map)),
        _ => {
            warn!("payload is not a JSON object");
            Err(Fault::Invalid)
        }
    }
}

fn json_object_to_map(map: serde_json::Map<String, Value>) -> Map<'static> {
    map.into_iter()
        .map(|(key, value)| (key.into_bytes().into(), json_to_object(value)))
        .collect()
}

pub fn json_to_object(value: Value) -> Object<'static> {
    match value {
        Value::Null => Object::Null,
        Value::Bool(b) => Object::Bool(b),
        Value::Number(n) => n.as_i64().map_or_else(
            || Object::F64(n.as_f64().unwrap_or(f64::NAN)),
            Object::I64,
        ),
        Value::String(s) => Object::Bytes(s.into_bytes().into()),
        Value::Array(items) => Object::List(items.into_iter().map(json_to_object).collect()),
        Value::Object(map) => Object::Map(json_object_to_map(map)),
    }
}

/// Converts a bus object to JSON. Byte strings must be UTF-8; binary
/// payloads are expected to be base64-encoded by the operation model
/// before reaching this point.
pub fn object_to_json(obj: &Object<'_>) -> Result<Value, Fault> {
    Ok(match obj {
        Object::Null => Value::Null,
        Object::Bool(b) => Value::Bool(*b),
        Object::I64(i) => Value::from(*i),
        Object::F64(f) => serde_json::Number::from_f64(*f).map(Value::Number).ok_or_else(|| {
            warn!("non-finite float cannot be encoded as json");
            Fault::Invalid
        })?,
        Object::Bytes(bytes) => {
            let s = std::str::from_utf8(bytes).map_err(|_| {
                warn!("non-utf8 bytes cannot be encoded as json string");
                Fault::Invalid
            })?;
            Value::String(s.to_string())
        }
        Object::List(items) => {
            Value::Array(items.iter().map(object_to_json).collect::<Result<_, _>>()?)
        }
        Object::Map(map) => {
            let mut json = serde_json::Map::with_capacity(map.len());
            for (key, value) in map.iter() {
                let key = std::str::from_utf8(key).map_err(|_| {
                    warn!("non-utf8 map key cannot be encoded as json");
                    Fault::Invalid
                })?;
                json.insert(key.to_string(), object_to_json(value)?);
            }
            Value::Object(json)
        }
    })
}

/// Serializes `obj` as JSON into `out`, bounded by `budget` bytes.
pub fn encode_json_payload(
    obj: &Object<'_>,
    out: &mut Vec<u8>,
    budget: usize,
) -> Result<(), Fault> {
    let value = object_to_json(obj)?;
    let rendered = serde_json::to_vec(&value).map_err(|err| {
        warn!(%err, "json encode failed");
        Fault::Failure
    })?;
    if rendered.len() > budget {
        warn!("json payload exceeds frame budget");
        return Err(Fault::NoMem);
    }
    out.extend_from_slice(&rendered);
    Ok(())
}

/// Decodes a base64 text field into raw bytes. Empty input is legal and
/// yields an empty payload.
pub fn base64_decode(text: &[u8]) -> Result<Vec<u8>, Fault> {
    BASE64.decode(text).map_err(|_| {
        warn!("field is not valid base64");
        Fault::Invalid
    })
}

pub fn base64_encode(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}
