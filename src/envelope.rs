//! Change envelopes carried from the product table to the durable queue.
//!
//! The scanner publishes the direct shape `{"new": {...}}`; the notification
//! bridge forwards `{"channel": ..., "payload": "..."}` where the payload is
//! the JSON-encoded trigger notification. The consumer accepts both.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fingerprint;
use crate::metadata::{flatten_fields, MetadataMap};

/// Row field promoted to embedding text; everything else becomes metadata.
pub const TEXT_FIELD: &str = "description";

/// Wire payload wrapping a changed row on its way through the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEnvelope {
    /// Snapshot of the row after the change.
    pub new: Value,
    /// Snapshot before the change, when the trigger supplies one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
}

impl ChangeEnvelope {
    /// Wraps a row snapshot in the direct envelope shape.
    pub fn from_row(new: Value) -> Self {
        Self { new, old: None }
    }

    /// Serializes the envelope as a queue message body.
    pub fn message_body(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Derives the embedding input for this change.
    ///
    /// Requires the row to carry a primary key and the description text;
    /// all remaining fields are coerced into index metadata.
    pub fn embedder_input(&self) -> Result<EmbedderInput, EnvelopeError> {
        let fields = self.new.as_object().ok_or(EnvelopeError::NotAnObject)?;
        let id = fields
            .get("id")
            .and_then(id_as_string)
            .ok_or(EnvelopeError::MissingId)?;
        let text = fields
            .get(TEXT_FIELD)
            .and_then(Value::as_str)
            .ok_or(EnvelopeError::MissingDescription)?
            .to_string();
        let metadata = flatten_fields(fields, TEXT_FIELD);
        Ok(EmbedderInput {
            id: Some(id),
            text,
            metadata,
        })
    }
}

/// One unit of embedding work derived from a change envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbedderInput {
    /// Source row identity, when the change carried one.
    pub id: Option<String>,
    /// Text submitted to the embedding model.
    pub text: String,
    /// Coerced row fields attached to the upserted vector.
    pub metadata: MetadataMap,
}

impl EmbedderInput {
    /// Identity of the vector this input produces.
    ///
    /// Keyed on the source row so redelivery overwrites in place; inputs
    /// without an id fall back to a stable fingerprint of the text.
    pub fn vector_id(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => format!(
                "text-{}",
                fingerprint::hex_fingerprint(self.text.as_bytes())
            ),
        }
    }
}

/// Parses a queue message body into a change envelope.
///
/// Accepts the direct shape `{"new": {...}}` and the enveloped shape
/// `{"payload": ...}` where the payload is either a JSON object or a
/// JSON-encoded string.
pub fn parse_message_body(body: &str) -> Result<ChangeEnvelope, EnvelopeError> {
    let value: Value =
        serde_json::from_str(body).map_err(|err| EnvelopeError::InvalidJson(err.to_string()))?;
    let fields = value.as_object().ok_or(EnvelopeError::NotAnObject)?;
    if fields.contains_key("new") {
        return envelope_from_fields(fields);
    }
    match fields.get("payload") {
        Some(Value::String(inner)) => {
            let parsed: Value = serde_json::from_str(inner)
                .map_err(|err| EnvelopeError::InvalidJson(err.to_string()))?;
            let inner_fields = parsed.as_object().ok_or(EnvelopeError::NotAnObject)?;
            envelope_from_fields(inner_fields)
        }
        Some(inner) => {
            let inner_fields = inner.as_object().ok_or(EnvelopeError::NotAnObject)?;
            envelope_from_fields(inner_fields)
        }
        None => Err(EnvelopeError::MissingRow),
    }
}

fn envelope_from_fields(
    fields: &serde_json::Map<String, Value>,
) -> Result<ChangeEnvelope, EnvelopeError> {
    let new = fields.get("new").cloned().ok_or(EnvelopeError::MissingRow)?;
    Ok(ChangeEnvelope {
        new,
        old: fields.get("old").cloned(),
    })
}

fn id_as_string(value: &Value) -> Option<String> {
    match value {
        Value::Number(num) => Some(num.to_string()),
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        _ => None,
    }
}

/// Errors surfaced while decoding queue message bodies.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeError {
    /// The body (or its nested payload) was not valid JSON.
    InvalidJson(String),
    /// The body decoded to something other than a JSON object.
    NotAnObject,
    /// Neither a `new` row nor a `payload` wrapper was present.
    MissingRow,
    /// The changed row lacks a usable primary key.
    MissingId,
    /// The changed row lacks the description text to embed.
    MissingDescription,
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson(detail) => write!(f, "message body is not valid JSON: {detail}"),
            Self::NotAnObject => write!(f, "message body is not a JSON object"),
            Self::MissingRow => write!(f, "message body carries no changed row"),
            Self::MissingId => write!(f, "changed row has no usable id"),
            Self::MissingDescription => write!(f, "changed row has no description"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataValue;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn parses_direct_shape() {
        let body = r#"{"new": {"id": 42, "description": "red shoes"}}"#;
        let envelope = parse_message_body(body).expect("direct shape");
        assert_eq!(envelope.new["id"], json!(42));
    }

    #[test]
    fn parses_enveloped_object_payload() {
        let body = r#"{"payload": {"new": {"id": 7, "description": "blue hat"}}}"#;
        let envelope = parse_message_body(body).expect("enveloped shape");
        assert_eq!(envelope.new["description"], json!("blue hat"));
    }

    #[test]
    fn parses_notification_bridge_shape() {
        // The listener forwards the raw notification: payload is a string.
        let body = json!({
            "channel": "table_change",
            "payload": r#"{"new": {"id": 7, "description": "blue hat"}}"#,
        })
        .to_string();
        let envelope = parse_message_body(&body).expect("bridge shape");
        assert_eq!(envelope.new["id"], json!(7));
    }

    #[test]
    fn rejects_invalid_json() {
        match parse_message_body("not json at all") {
            Err(EnvelopeError::InvalidJson(_)) => {}
            other => panic!("expected invalid json error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_body_without_row() {
        match parse_message_body(r#"{"something": "else"}"#) {
            Err(EnvelopeError::MissingRow) => {}
            other => panic!("expected missing row error, got {other:?}"),
        }
    }

    #[test]
    fn input_requires_id_and_description() {
        let no_id = ChangeEnvelope::from_row(json!({"description": "x"}));
        assert_eq!(no_id.embedder_input(), Err(EnvelopeError::MissingId));

        let no_text = ChangeEnvelope::from_row(json!({"id": 1}));
        assert_eq!(
            no_text.embedder_input(),
            Err(EnvelopeError::MissingDescription)
        );
    }

    #[test]
    fn input_flattens_remaining_fields() {
        let envelope = ChangeEnvelope::from_row(json!({
            "id": 42,
            "description": "red shoes",
            "sku": "SKU-XY-99",
            "price": 129.5,
            "deleted_at": null,
        }));
        let input = envelope.embedder_input().expect("input");
        assert_eq!(input.id.as_deref(), Some("42"));
        assert_eq!(input.text, "red shoes");
        assert_eq!(input.metadata.get("id"), Some(&MetadataValue::Num(42.0)));
        assert_eq!(
            input.metadata.get("sku"),
            Some(&MetadataValue::Str("SKU-XY-99".into()))
        );
        assert_eq!(input.metadata.get("description"), None);
        assert_eq!(input.metadata.get("deleted_at"), None);
    }

    #[test]
    fn vector_id_is_deterministic() {
        let keyed = EmbedderInput {
            id: Some("42".into()),
            text: "red shoes".into(),
            metadata: MetadataMap::new(),
        };
        assert_eq!(keyed.vector_id(), "42");

        let unkeyed = EmbedderInput {
            id: None,
            text: "red shoes".into(),
            metadata: MetadataMap::new(),
        };
        assert_eq!(unkeyed.vector_id(), unkeyed.vector_id());
        assert!(unkeyed.vector_id().starts_with("text-"));
    }

    #[test]
    fn round_trips_message_body() {
        let envelope = ChangeEnvelope::from_row(json!({"id": 1, "description": "a"}));
        let body = envelope.message_body().expect("serialize");
        assert_eq!(parse_message_body(&body).expect("parse"), envelope);
    }
}
