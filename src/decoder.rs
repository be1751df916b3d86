//! Message body decoding.
//!
//! Bodies are JSON objects. The `message` field is the audited content; any
//! other top-level fields are kept as-is for downstream consumers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::DecodeError;

/// Structured content of a queued message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedPayload {
    /// Message content recorded in the event store
    #[serde(default, alias = "Message")]
    pub message: String,

    /// Remaining top-level fields of the body
    #[serde(flatten)]
    pub attributes: Map<String, JsonValue>,
}

impl DecodedPayload {
    /// Look up an extra top-level field
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.attributes.get(key)
    }
}

/// Decode a raw message body into a [`DecodedPayload`].
///
/// # Errors
/// Returns [`DecodeError::Json`] for malformed JSON (including a non-string
/// `message` field) and [`DecodeError::NotAnObject`] when the body is valid
/// JSON but not an object.
pub fn decode(body: &str) -> Result<DecodedPayload, DecodeError> {
    let value: JsonValue = serde_json::from_str(body)?;

    let kind = match &value {
        JsonValue::Object(_) => None,
        JsonValue::Array(_) => Some("array"),
        JsonValue::String(_) => Some("string"),
        JsonValue::Number(_) => Some("number"),
        JsonValue::Bool(_) => Some("boolean"),
        JsonValue::Null => Some("null"),
    };
    if let Some(kind) = kind {
        return Err(DecodeError::NotAnObject(kind));
    }

    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_message_and_extras() {
        let payload = decode(r#"{"message": "file uploaded", "bucket": "inbox", "size": 42}"#)
            .unwrap();

        assert_eq!(payload.message, "file uploaded");
        assert_eq!(payload.get("bucket"), Some(&json!("inbox")));
        assert_eq!(payload.get("size"), Some(&json!(42)));
        assert!(payload.get("message").is_none());
    }

    #[test]
    fn test_decode_capitalised_field() {
        let payload = decode(r#"{"Message": "hello"}"#).unwrap();
        assert_eq!(payload.message, "hello");
    }

    #[test]
    fn test_decode_missing_message_defaults_to_empty() {
        let payload = decode("{}").unwrap();
        assert_eq!(payload.message, "");
        assert!(payload.attributes.is_empty());
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(decode("{not json"), Err(DecodeError::Json(_))));
        assert!(matches!(decode(""), Err(DecodeError::Json(_))));
    }

    #[test]
    fn test_decode_non_object() {
        assert!(matches!(decode("[1, 2]"), Err(DecodeError::NotAnObject("array"))));
        assert!(matches!(decode("\"text\""), Err(DecodeError::NotAnObject("string"))));
        assert!(matches!(decode("null"), Err(DecodeError::NotAnObject("null"))));
    }

    #[test]
    fn test_decode_wrong_message_type() {
        assert!(matches!(decode(r#"{"message": 5}"#), Err(DecodeError::Json(_))));
    }
}
