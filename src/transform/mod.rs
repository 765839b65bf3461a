//! # Payload Transform
//!
//! Pure conversion of a raw ingress payload into its processed form:
//! every string-valued field of the top-level object is uppercased, every
//! other value passes through unchanged, and `processed_at` is set to the
//! current UTC time.
//!
//! Payloads are modelled with `serde_json::Value`, a closed enum over
//! null/bool/number/string/array/object, so the rewrite below is an
//! exhaustive match.

mod errors;

pub use errors::{TransformError, TransformResult};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

/// Field added to every processed payload
pub const PROCESSED_AT_FIELD: &str = "processed_at";

/// Decode `raw` as a JSON object
pub fn decode_object(raw: &[u8]) -> TransformResult<Map<String, Value>> {
    match serde_json::from_slice::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        other => Err(TransformError::NotAnObject(kind_of(&other))),
    }
}

/// Validate and re-encode without changing any value
pub fn canonicalize(raw: &[u8]) -> TransformResult<Vec<u8>> {
    let object = decode_object(raw)?;
    Ok(serde_json::to_vec(&Value::Object(object))?)
}

/// Apply the transform with the current time
pub fn process(raw: &[u8]) -> TransformResult<Vec<u8>> {
    process_at(raw, Utc::now())
}

/// Apply the transform with an explicit timestamp
pub fn process_at(raw: &[u8], now: DateTime<Utc>) -> TransformResult<Vec<u8>> {
    let object = decode_object(raw)?;

    let mut processed: Map<String, Value> = object
        .into_iter()
        .map(|(key, value)| (key, uppercase_strings(value)))
        .collect();
    processed.insert(
        PROCESSED_AT_FIELD.to_string(),
        Value::String(format_timestamp(now)),
    );

    Ok(serde_json::to_vec(&Value::Object(processed))?)
}

/// RFC 3339, UTC, microseconds, `Z` suffix
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn uppercase_strings(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.to_uppercase()),
        Value::Null => Value::Null,
        Value::Bool(b) => Value::Bool(b),
        Value::Number(n) => Value::Number(n),
        Value::Array(items) => Value::Array(items),
        Value::Object(map) => Value::Object(map),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
