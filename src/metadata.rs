//! Tagged metadata values accepted by the vector index.
//!
//! Source rows carry arbitrary columns; the index only accepts strings,
//! numbers, booleans, and string arrays as metadata. Coercion is total:
//! every JSON value maps to exactly one accepted shape or is dropped.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata map attached to an upserted vector.
pub type MetadataMap = BTreeMap<String, MetadataValue>;

/// The value shapes the vector index accepts as record metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    /// Boolean flag.
    Bool(bool),
    /// Numeric value; integers are widened to f64.
    Num(f64),
    /// Plain string.
    Str(String),
    /// Array of strings; non-string elements are filtered out.
    StrList(Vec<String>),
}

impl MetadataValue {
    /// Coerces an arbitrary JSON value into an accepted metadata shape.
    ///
    /// Nulls are dropped (`None`); booleans, numbers, and strings pass
    /// through; arrays keep only their string elements; objects and any
    /// number that cannot be represented as f64 are stringified.
    pub fn coerce(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(flag) => Some(Self::Bool(*flag)),
            Value::Number(num) => Some(match num.as_f64() {
                Some(float) => Self::Num(float),
                None => Self::Str(num.to_string()),
            }),
            Value::String(text) => Some(Self::Str(text.clone())),
            Value::Array(items) => Some(Self::StrList(
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect(),
            )),
            Value::Object(_) => Some(Self::Str(value.to_string())),
        }
    }
}

/// Flattens a JSON object into a metadata map, skipping the named field.
///
/// The skipped field is the one promoted to embedding text; everything else
/// survives coercion or is dropped.
pub fn flatten_fields(fields: &serde_json::Map<String, Value>, skip: &str) -> MetadataMap {
    fields
        .iter()
        .filter(|(key, _)| key.as_str() != skip)
        .filter_map(|(key, value)| MetadataValue::coerce(value).map(|v| (key.clone(), v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn nulls_are_dropped() {
        assert_eq!(MetadataValue::coerce(&Value::Null), None);
    }

    #[test]
    fn scalars_pass_through() {
        assert_eq!(
            MetadataValue::coerce(&json!(true)),
            Some(MetadataValue::Bool(true))
        );
        assert_eq!(
            MetadataValue::coerce(&json!(42)),
            Some(MetadataValue::Num(42.0))
        );
        assert_eq!(
            MetadataValue::coerce(&json!("red shoes")),
            Some(MetadataValue::Str("red shoes".into()))
        );
    }

    #[test]
    fn arrays_keep_only_strings() {
        assert_eq!(
            MetadataValue::coerce(&json!(["a", 1, null, "b"])),
            Some(MetadataValue::StrList(vec!["a".into(), "b".into()]))
        );
    }

    #[test]
    fn objects_are_stringified() {
        assert_eq!(
            MetadataValue::coerce(&json!({"nested": 1})),
            Some(MetadataValue::Str("{\"nested\":1}".into()))
        );
    }

    #[test]
    fn flatten_skips_text_field_and_nulls() {
        let row = json!({
            "id": 7,
            "description": "blue hat",
            "sku": "SKU-AB-12",
            "discontinued": null,
        });
        let fields = row.as_object().expect("object");
        let meta = flatten_fields(fields, "description");
        assert_eq!(meta.get("id"), Some(&MetadataValue::Num(7.0)));
        assert_eq!(meta.get("sku"), Some(&MetadataValue::Str("SKU-AB-12".into())));
        assert_eq!(meta.get("description"), None);
        assert_eq!(meta.get("discontinued"), None);
    }

    #[test]
    fn untagged_serialization_round_trips() {
        let meta: MetadataMap = [
            ("price".to_string(), MetadataValue::Num(129.5)),
            ("tags".to_string(), MetadataValue::StrList(vec!["sale".into()])),
        ]
        .into_iter()
        .collect();
        let encoded = serde_json::to_string(&meta).expect("serialize");
        assert_eq!(encoded, r#"{"price":129.5,"tags":["sale"]}"#);
        let decoded: MetadataMap = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(decoded, meta);
    }
}
