//! `$jsonSchema` validators for the embedded store.
//!
//! Supports the subset of keywords used by chat-memory style collections:
//! `bsonType`, `required`, `properties`, `additionalProperties`, `enum`,
//! `items`, `minItems`/`maxItems`, `minLength`/`maxLength`,
//! `minimum`/`maximum`, plus the annotation keywords `description` and
//! `title`. Unknown keywords make the schema malformed, as they do on the
//! server.
//!
//! Dates use the extended-JSON form `{"$date": "<rfc3339>"}` (or
//! `{"$date": <millis>}`).

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::error::{BootstrapError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BsonType {
    Object,
    Array,
    String,
    Bool,
    Null,
    Date,
    ObjectId,
    Int,
    Long,
    Double,
    Decimal,
    Number,
}

impl BsonType {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "object" => Self::Object,
            "array" => Self::Array,
            "string" => Self::String,
            "bool" => Self::Bool,
            "null" => Self::Null,
            "date" => Self::Date,
            "objectId" => Self::ObjectId,
            "int" => Self::Int,
            "long" => Self::Long,
            "double" => Self::Double,
            "decimal" => Self::Decimal,
            "number" => Self::Number,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            Self::Object => "object",
            Self::Array => "array",
            Self::String => "string",
            Self::Bool => "bool",
            Self::Null => "null",
            Self::Date => "date",
            Self::ObjectId => "objectId",
            Self::Int => "int",
            Self::Long => "long",
            Self::Double => "double",
            Self::Decimal => "decimal",
            Self::Number => "number",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            Self::Object => value.is_object() && !is_extended(value),
            Self::Array => value.is_array(),
            Self::String => value.is_string(),
            Self::Bool => value.is_boolean(),
            Self::Null => value.is_null(),
            Self::Date => parse_date(value).is_some(),
            Self::ObjectId => value
                .get("$oid")
                .and_then(Value::as_str)
                .is_some_and(|oid| oid.len() == 24 && oid.chars().all(|c| c.is_ascii_hexdigit())),
            Self::Int => value
                .as_i64()
                .is_some_and(|v| i32::try_from(v).is_ok()),
            Self::Long => value.is_i64() || value.is_u64(),
            Self::Double => value.is_f64(),
            Self::Decimal | Self::Number => value.is_number(),
        }
    }
}

/// Extended-JSON scalar wrappers (`$date`, `$oid`) are not plain objects.
fn is_extended(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|map| map.len() == 1 && (map.contains_key("$date") || map.contains_key("$oid")))
}

/// Parse an extended-JSON date.
pub fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    let inner = value.as_object().filter(|m| m.len() == 1)?.get("$date")?;
    match inner {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

/// Extended-JSON representation of a timestamp.
pub fn date_value(at: DateTime<Utc>) -> Value {
    serde_json::json!({ "$date": at.to_rfc3339() })
}

#[derive(Debug, Clone, Default)]
struct SchemaNode {
    bson_types: Option<Vec<BsonType>>,
    required: Vec<String>,
    properties: Vec<(String, SchemaNode)>,
    additional_properties: Option<bool>,
    enum_values: Option<Vec<Value>>,
    items: Option<Box<SchemaNode>>,
    min_items: Option<usize>,
    max_items: Option<usize>,
    min_length: Option<usize>,
    max_length: Option<usize>,
    minimum: Option<f64>,
    maximum: Option<f64>,
}

fn malformed(path: &str, message: impl std::fmt::Display) -> BootstrapError {
    let at = if path.is_empty() { "$jsonSchema" } else { path };
    BootstrapError::InvalidSpec(format!("malformed validator at {at}: {message}"))
}

fn as_count(path: &str, key: &str, value: &Value) -> Result<usize> {
    value
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| malformed(path, format!("'{key}' must be a non-negative integer")))
}

fn as_bound(path: &str, key: &str, value: &Value) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| malformed(path, format!("'{key}' must be a number")))
}

impl SchemaNode {
    fn compile(schema: &Value, path: &str) -> Result<Self> {
        let map = schema
            .as_object()
            .ok_or_else(|| malformed(path, "schema must be an object"))?;
        let mut node = SchemaNode::default();

        for (key, value) in map {
            match key.as_str() {
                "description" | "title" => {}
                "bsonType" => node.bson_types = Some(compile_types(value, path)?),
                "required" => {
                    let names = value
                        .as_array()
                        .ok_or_else(|| malformed(path, "'required' must be an array"))?;
                    for name in names {
                        let name = name
                            .as_str()
                            .ok_or_else(|| malformed(path, "'required' entries must be strings"))?;
                        node.required.push(name.to_string());
                    }
                }
                "properties" => {
                    let props = value
                        .as_object()
                        .ok_or_else(|| malformed(path, "'properties' must be an object"))?;
                    for (field, sub) in props {
                        let sub_path = join_path(path, field);
                        node.properties
                            .push((field.clone(), SchemaNode::compile(sub, &sub_path)?));
                    }
                }
                "additionalProperties" => {
                    node.additional_properties = Some(value.as_bool().ok_or_else(|| {
                        malformed(path, "'additionalProperties' must be a boolean")
                    })?);
                }
                "enum" => {
                    let values = value
                        .as_array()
                        .filter(|v| !v.is_empty())
                        .ok_or_else(|| malformed(path, "'enum' must be a non-empty array"))?;
                    node.enum_values = Some(values.clone());
                }
                "items" => {
                    node.items = Some(Box::new(SchemaNode::compile(
                        value,
                        &format!("{}[]", if path.is_empty() { "$" } else { path }),
                    )?));
                }
                "minItems" => node.min_items = Some(as_count(path, key, value)?),
                "maxItems" => node.max_items = Some(as_count(path, key, value)?),
                "minLength" => node.min_length = Some(as_count(path, key, value)?),
                "maxLength" => node.max_length = Some(as_count(path, key, value)?),
                "minimum" => node.minimum = Some(as_bound(path, key, value)?),
                "maximum" => node.maximum = Some(as_bound(path, key, value)?),
                other => return Err(malformed(path, format!("unknown keyword '{other}'"))),
            }
        }

        if let (Some(min), Some(max)) = (node.minimum, node.maximum) {
            if min > max {
                return Err(malformed(path, "'minimum' exceeds 'maximum'"));
            }
        }
        Ok(node)
    }

    fn check(&self, value: &Value, path: &str, violations: &mut Vec<String>) {
        let at = if path.is_empty() { "document" } else { path };

        if let Some(types) = &self.bson_types {
            if !types.iter().any(|t| t.matches(value)) {
                let names: Vec<&str> = types.iter().map(|t| t.name()).collect();
                violations.push(format!("{at} must be of bsonType {}", names.join("|")));
                return;
            }
        }

        if let Some(allowed) = &self.enum_values {
            if !allowed.iter().any(|a| json_equivalent(a, value)) {
                violations.push(format!("{at} is not one of the allowed values"));
            }
        }

        if let Some(n) = value.as_f64() {
            if self.minimum.is_some_and(|min| n < min) {
                violations.push(format!("{at} is below the minimum"));
            }
            if self.maximum.is_some_and(|max| n > max) {
                violations.push(format!("{at} is above the maximum"));
            }
        }

        if let Some(text) = value.as_str() {
            let len = text.chars().count();
            if self.min_length.is_some_and(|min| len < min) {
                violations.push(format!("{at} is shorter than minLength"));
            }
            if self.max_length.is_some_and(|max| len > max) {
                violations.push(format!("{at} is longer than maxLength"));
            }
        }

        if let Some(items) = value.as_array() {
            if self.min_items.is_some_and(|min| items.len() < min) {
                violations.push(format!("{at} has fewer than minItems elements"));
            }
            if self.max_items.is_some_and(|max| items.len() > max) {
                violations.push(format!("{at} has more than maxItems elements"));
            }
            if let Some(item_schema) = &self.items {
                for (i, item) in items.iter().enumerate() {
                    item_schema.check(item, &format!("{at}[{i}]"), violations);
                }
            }
        }

        if let Some(object) = value.as_object().filter(|_| !is_extended(value)) {
            self.check_object(object, path, violations);
        }
    }

    fn check_object(&self, object: &Map<String, Value>, path: &str, violations: &mut Vec<String>) {
        for field in &self.required {
            if !object.contains_key(field) {
                violations.push(format!("missing required field '{}'", join_path(path, field)));
            }
        }
        for (field, schema) in &self.properties {
            if let Some(child) = object.get(field) {
                schema.check(child, &join_path(path, field), violations);
            }
        }
        if self.additional_properties == Some(false) {
            for field in object.keys() {
                let declared = self.properties.iter().any(|(name, _)| name == field);
                if !declared && field != "_id" {
                    violations.push(format!(
                        "field '{}' is not allowed",
                        join_path(path, field)
                    ));
                }
            }
        }
    }
}

fn compile_types(value: &Value, path: &str) -> Result<Vec<BsonType>> {
    let parse = |name: &Value| {
        let name = name
            .as_str()
            .ok_or_else(|| malformed(path, "'bsonType' entries must be strings"))?;
        BsonType::parse(name).ok_or_else(|| malformed(path, format!("unknown bsonType '{name}'")))
    };
    match value {
        Value::Array(names) if !names.is_empty() => names.iter().map(parse).collect(),
        Value::String(_) => Ok(vec![parse(value)?]),
        _ => Err(malformed(path, "'bsonType' must be a string or non-empty array")),
    }
}

fn join_path(path: &str, field: &str) -> String {
    if path.is_empty() {
        field.to_string()
    } else {
        format!("{path}.{field}")
    }
}

/// A compiled collection validator.
#[derive(Debug, Clone)]
pub struct Validator {
    root: SchemaNode,
}

impl Validator {
    /// Compile a validator document of the form `{"$jsonSchema": {...}}`.
    pub fn compile(validator: &Value) -> Result<Self> {
        let map = validator
            .as_object()
            .ok_or_else(|| BootstrapError::InvalidSpec("validator must be a document".into()))?;
        if map.is_empty() {
            return Err(BootstrapError::InvalidSpec("validator document is empty".into()));
        }
        if let Some(op) = map.keys().find(|k| k.as_str() != "$jsonSchema") {
            return Err(BootstrapError::InvalidSpec(format!(
                "unsupported validator operator '{op}', only $jsonSchema is supported"
            )));
        }
        let root = SchemaNode::compile(&map["$jsonSchema"], "")?;
        Ok(Self { root })
    }

    /// Check a document, collecting every violation.
    pub fn validate(&self, document: &Value) -> std::result::Result<(), Vec<String>> {
        let mut violations = Vec::new();
        self.root.check(document, "", &mut violations);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

/// Structural equality where numbers compare by value (`1` == `1.0`) and
/// object key order is ignored.
pub fn json_equivalent(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| json_equivalent(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| json_equivalent(x, y)))
        }
        _ => a == b,
    }
}

/// Look up a dotted path (`metadata.source`) in a document.
pub fn lookup<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(document, |current, segment| current.get(segment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chat_memory_validator() -> Value {
        json!({
            "$jsonSchema": {
                "bsonType": "object",
                "required": ["sessionId", "messageType", "content", "createdAt"],
                "properties": {
                    "sessionId": { "bsonType": "string", "description": "Session identifier" },
                    "messageType": { "bsonType": "string", "enum": ["human", "ai", "system"] },
                    "content": { "bsonType": "string" },
                    "metadata": { "bsonType": "object" },
                    "createdAt": { "bsonType": "date" },
                    "keywords": { "bsonType": "array", "items": { "bsonType": "string" } },
                    "importance": { "bsonType": "number", "minimum": 0, "maximum": 10 }
                }
            }
        })
    }

    #[test]
    fn test_valid_document_passes() {
        let validator = Validator::compile(&chat_memory_validator()).unwrap();
        let doc = json!({
            "sessionId": "s-1",
            "messageType": "human",
            "content": "hello",
            "createdAt": { "$date": "2026-01-05T10:00:00Z" },
            "keywords": ["greeting"],
            "importance": 3
        });
        assert!(validator.validate(&doc).is_ok());
    }

    #[test]
    fn test_violations_are_collected() {
        let validator = Validator::compile(&chat_memory_validator()).unwrap();
        let doc = json!({
            "sessionId": 42,
            "messageType": "robot",
            "createdAt": "yesterday",
            "keywords": ["ok", 7],
            "importance": 11
        });
        let violations = validator.validate(&doc).unwrap_err();

        assert!(violations.iter().any(|v| v.contains("missing required field 'content'")));
        assert!(violations.iter().any(|v| v.starts_with("sessionId must be of bsonType string")));
        assert!(violations.iter().any(|v| v.contains("messageType is not one of")));
        assert!(violations.iter().any(|v| v.starts_with("createdAt must be of bsonType date")));
        assert!(violations.iter().any(|v| v.starts_with("keywords[1]")));
        assert!(violations.iter().any(|v| v.contains("importance is above the maximum")));
    }

    #[test]
    fn test_malformed_validators_are_rejected() {
        let cases = [
            json!("not a document"),
            json!({}),
            json!({ "$where": "true" }),
            json!({ "$jsonSchema": { "bsonType": "text" } }),
            json!({ "$jsonSchema": { "required": "sessionId" } }),
            json!({ "$jsonSchema": { "properties": { "a": { "bsonTyp": "string" } } } }),
            json!({ "$jsonSchema": { "minimum": 5, "maximum": 1 } }),
        ];
        for case in cases {
            let err = Validator::compile(&case).unwrap_err();
            assert!(matches!(err, BootstrapError::InvalidSpec(_)), "{case}");
        }
    }

    #[test]
    fn test_additional_properties_false_allows_id() {
        let validator = Validator::compile(&json!({
            "$jsonSchema": {
                "bsonType": "object",
                "additionalProperties": false,
                "properties": { "type": { "bsonType": "string" } }
            }
        }))
        .unwrap();
        assert!(validator.validate(&json!({ "_id": "x", "type": "a" })).is_ok());
        assert!(validator.validate(&json!({ "type": "a", "extra": 1 })).is_err());
    }

    #[test]
    fn test_dates_and_equivalence() {
        let at = parse_date(&json!({ "$date": "2026-03-01T00:00:00+02:00" })).unwrap();
        assert_eq!(at.to_rfc3339(), "2026-02-28T22:00:00+00:00");
        assert_eq!(parse_date(&date_value(at)), Some(at));
        assert!(parse_date(&json!({ "$date": true })).is_none());

        assert!(json_equivalent(&json!({ "a": 1, "b": [1.0] }), &json!({ "b": [1], "a": 1.0 })));
        assert!(!json_equivalent(&json!({ "a": 1 }), &json!({ "a": 1, "b": 2 })));
        assert_eq!(lookup(&json!({ "m": { "s": 3 } }), "m.s"), Some(&json!(3)));
    }
}
