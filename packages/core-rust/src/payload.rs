//! Codec for the opaque payload fields of the envelope.
//!
//! Parameters, results, and event data travel as UTF-8 JSON byte blobs so
//! the envelope schema never changes per method.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a value into a UTF-8 JSON payload blob.
///
/// # Errors
///
/// Returns an error if the value cannot be represented as JSON (e.g. a map
/// with non-string keys).
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(value)
}

/// Decodes a UTF-8 JSON payload blob.
///
/// # Errors
///
/// Returns an error if the bytes are not valid JSON for `T`.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn map_roundtrip_yields_equal_map() {
        let mut params = HashMap::new();
        params.insert("location".to_string(), json!("Boston"));
        params.insert("units".to_string(), json!({"temp": "celsius"}));
        params.insert("days".to_string(), json!([1, 2, 3]));

        let bytes = encode_payload(&params).unwrap();
        let decoded: HashMap<String, Value> = decode_payload(&bytes).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn nested_value_roundtrip() {
        let value = json!({
            "a": 5,
            "b": [true, null, "x"],
            "c": {"deep": {"deeper": 1.5}}
        });
        let bytes = encode_payload(&value).unwrap();
        let decoded: Value = decode_payload(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn payload_is_utf8_json_text() {
        let bytes = encode_payload(&json!({"a": 1})).unwrap();
        assert_eq!(std::str::from_utf8(&bytes).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn decode_rejects_invalid_json() {
        let result: Result<Value, _> = decode_payload(b"{not json");
        assert!(result.is_err());
    }

    #[test]
    fn empty_object_roundtrip() {
        let params: HashMap<String, Value> = HashMap::new();
        let bytes = encode_payload(&params).unwrap();
        let decoded: HashMap<String, Value> = decode_payload(&bytes).unwrap();
        assert!(decoded.is_empty());
    }
}
