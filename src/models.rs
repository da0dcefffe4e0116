//! Declarative object specs consumed by the bootstrap engine, plus the
//! per-object results it produces.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BootstrapError;

/// A role granted to a user, scoped to one database.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(deny_unknown_fields)]
pub struct RoleGrant {
    pub role: String,
    pub db: String,
}

impl RoleGrant {
    pub fn new(role: impl Into<String>, db: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            db: db.into(),
        }
    }
}

impl fmt::Display for RoleGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.role, self.db)
    }
}

/// Where a password comes from. Manifests never hold literal passwords.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum PasswordRef {
    /// Environment variable, with an optional development-only fallback.
    Env {
        var: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        insecure_default: Option<String>,
    },
    /// Secret file (e.g. a mounted container secret); trailing newline is stripped.
    File { path: PathBuf },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct UserSpec {
    pub name: String,
    /// Authentication database the user is defined in.
    #[serde(default)]
    pub database: String,
    pub password: PasswordRef,
    #[serde(default)]
    pub roles: Vec<RoleGrant>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ValidationLevel {
    Off,
    #[default]
    Strict,
    Moderate,
}

impl ValidationLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Strict => "strict",
            Self::Moderate => "moderate",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ValidationAction {
    #[default]
    Error,
    Warn,
}

impl ValidationAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CollectionSpec {
    pub name: String,
    #[serde(default)]
    pub database: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator: Option<Value>,
    #[serde(default)]
    pub validation_level: ValidationLevel,
    #[serde(default)]
    pub validation_action: ValidationAction,
}

/// Direction of one key in an index pattern, or an index-type token
/// such as `"text"`, `"hashed"` or `"2dsphere"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexDirection {
    Ascending,
    Descending,
    Kind(String),
}

impl IndexDirection {
    pub fn to_value(&self) -> Value {
        match self {
            Self::Ascending => Value::from(1),
            Self::Descending => Value::from(-1),
            Self::Kind(kind) => Value::from(kind.as_str()),
        }
    }

    /// TTL indexes only make sense on plain ordered keys.
    pub fn is_ordered(&self) -> bool {
        matches!(self, Self::Ascending | Self::Descending)
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Self::Kind(kind) if kind == "text")
    }
}

impl TryFrom<&Value> for IndexDirection {
    type Error = String;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        match value {
            Value::Number(n) => match n.as_f64() {
                Some(v) if v == 1.0 => Ok(Self::Ascending),
                Some(v) if v == -1.0 => Ok(Self::Descending),
                _ => Err(format!("index direction must be 1 or -1, got {n}")),
            },
            Value::String(kind) if !kind.is_empty() => Ok(Self::Kind(kind.clone())),
            other => Err(format!("unsupported index direction {other}")),
        }
    }
}

impl fmt::Display for IndexDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ascending => f.write_str("1"),
            Self::Descending => f.write_str("-1"),
            Self::Kind(kind) => f.write_str(kind),
        }
    }
}

/// Ordered key pattern of an index. Field order is significant.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct IndexKeys(Vec<(String, IndexDirection)>);

impl IndexKeys {
    pub fn new(fields: Vec<(String, IndexDirection)>) -> Result<Self, String> {
        if fields.is_empty() {
            return Err("index key pattern must name at least one field".to_string());
        }
        for (i, (field, _)) in fields.iter().enumerate() {
            if field.is_empty() {
                return Err("index key pattern contains an empty field name".to_string());
            }
            if fields[..i].iter().any(|(other, _)| other == field) {
                return Err(format!("field '{field}' appears twice in index key pattern"));
            }
        }
        Ok(Self(fields))
    }

    /// Shorthand for an all-ascending pattern.
    #[cfg(test)]
    pub(crate) fn ascending(fields: &[&str]) -> Self {
        Self(
            fields
                .iter()
                .map(|f| (f.to_string(), IndexDirection::Ascending))
                .collect(),
        )
    }

    pub fn fields(&self) -> &[(String, IndexDirection)] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Pattern as a server indexes it: all text fields form one group,
    /// ordered by name, at the position of the first text field.
    fn canonical(&self) -> Vec<&(String, IndexDirection)> {
        let mut text: Vec<_> = self.0.iter().filter(|(_, dir)| dir.is_text()).collect();
        text.sort_by(|a, b| a.0.cmp(&b.0));
        let mut text = Some(text);
        let mut canonical = Vec::with_capacity(self.0.len());
        for entry in &self.0 {
            if !entry.1.is_text() {
                canonical.push(entry);
            } else if let Some(group) = text.take() {
                canonical.extend(group);
            }
        }
        canonical
    }

    /// Whether both patterns build the same index. Plain keys compare in
    /// order; the fields of a text index compare as a set.
    pub fn same_pattern(&self, other: &IndexKeys) -> bool {
        self.canonical() == other.canonical()
    }

    /// Conventional generated name: `sessionId_1_createdAt_-1`.
    pub fn default_name(&self) -> String {
        self.0
            .iter()
            .map(|(field, dir)| format!("{field}_{dir}"))
            .collect::<Vec<_>>()
            .join("_")
    }
}

impl TryFrom<Map<String, Value>> for IndexKeys {
    type Error = String;

    fn try_from(map: Map<String, Value>) -> Result<Self, Self::Error> {
        let fields = map
            .iter()
            .map(|(field, dir)| Ok((field.clone(), IndexDirection::try_from(dir)?)))
            .collect::<Result<Vec<_>, String>>()?;
        Self::new(fields)
    }
}

impl From<IndexKeys> for Map<String, Value> {
    fn from(keys: IndexKeys) -> Self {
        keys.0
            .into_iter()
            .map(|(field, dir)| (field, dir.to_value()))
            .collect()
    }
}

impl fmt::Display for IndexKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, d)| format!("{k}: {d}")).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct IndexOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(
        default,
        alias = "expireAfterSeconds",
        alias = "expiresAfterSeconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub expire_after_seconds: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct IndexSpec {
    #[serde(default)]
    pub database: String,
    pub collection: String,
    pub keys: IndexKeys,
    #[serde(default)]
    pub options: IndexOptions,
    /// Allow dropping and recreating a same-named index whose definition differs.
    #[serde(default)]
    pub replace: bool,
}

impl IndexSpec {
    pub fn new(database: &str, collection: &str, keys: IndexKeys) -> Self {
        Self {
            database: database.to_string(),
            collection: collection.to_string(),
            keys,
            options: IndexOptions::default(),
            replace: false,
        }
    }

    pub fn effective_name(&self) -> String {
        self.options
            .name
            .clone()
            .unwrap_or_else(|| self.keys.default_name())
    }
}

/// Any declared object, tagged by kind so manifests can mix them freely.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjectSpec {
    User(UserSpec),
    Collection(CollectionSpec),
    Index(IndexSpec),
}

impl ObjectSpec {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::User(_) => ObjectKind::User,
            Self::Collection(_) => ObjectKind::Collection,
            Self::Index(_) => ObjectKind::Index,
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            Self::User(user) => format!("{}@{}", user.name, user.database),
            Self::Collection(col) => format!("{}.{}", col.database, col.name),
            Self::Index(index) => format!(
                "{}.{}.{}",
                index.database,
                index.collection,
                index.effective_name()
            ),
        }
    }

    pub(crate) fn database_mut(&mut self) -> &mut String {
        match self {
            Self::User(user) => &mut user.database,
            Self::Collection(col) => &mut col.database,
            Self::Index(index) => &mut index.database,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    User,
    Collection,
    Index,
}

impl ObjectKind {
    /// Application order: users, then collections, then indexes.
    pub fn rank(self) -> u8 {
        match self {
            Self::User => 0,
            Self::Collection => 1,
            Self::Index => 2,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::User => "user",
            Self::Collection => "collection",
            Self::Index => "index",
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Malformed spec or a spec the database refused as invalid.
    Validation,
    Timeout,
    Secret,
    Database,
}

impl FailureKind {
    pub fn from_error(err: &BootstrapError) -> Self {
        match err {
            BootstrapError::InvalidSpec(_) | BootstrapError::DocumentRejected(_) => {
                Self::Validation
            }
            BootstrapError::Secret(_) | BootstrapError::InsecureDefault(_) => Self::Secret,
            BootstrapError::ConnectTimeout(_) => Self::Timeout,
            _ => Self::Database,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Validation => "validation error",
            Self::Timeout => "timeout",
            Self::Secret => "secret error",
            Self::Database => "database error",
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Created,
    AlreadyExists,
    Conflict,
    Failed(FailureKind),
}

impl Outcome {
    /// Outcomes that leave the database in the declared state.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Created | Self::AlreadyExists)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::AlreadyExists => f.write_str("already-exists"),
            Self::Conflict => f.write_str("conflict"),
            Self::Failed(kind) => write!(f, "failed ({kind})"),
        }
    }
}

/// Result of applying one declared object.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ApplyResult {
    pub kind: ObjectKind,
    pub name: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ApplyResult {
    pub fn new(kind: ObjectKind, name: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            kind,
            name: name.into(),
            outcome,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn failed(kind: ObjectKind, name: impl Into<String>, err: &BootstrapError) -> Self {
        Self::new(kind, name, Outcome::Failed(FailureKind::from_error(err)))
            .with_detail(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_index_keys_keep_declared_order() {
        let spec: IndexSpec = serde_json::from_value(json!({
            "collection": "chat_memory",
            "keys": { "sessionId": 1, "createdAt": -1 }
        }))
        .unwrap();

        assert_eq!(
            spec.keys.fields(),
            &[
                ("sessionId".to_string(), IndexDirection::Ascending),
                ("createdAt".to_string(), IndexDirection::Descending),
            ]
        );
        assert_eq!(spec.effective_name(), "sessionId_1_createdAt_-1");
        assert!(!spec.replace);
    }

    #[test]
    fn test_explicit_index_name_wins() {
        let spec: IndexSpec = serde_json::from_value(json!({
            "collection": "ai_sessions",
            "keys": { "expiresAt": 1 },
            "options": { "name": "session_ttl", "expireAfterSeconds": 0 }
        }))
        .unwrap();

        assert_eq!(spec.effective_name(), "session_ttl");
        assert_eq!(spec.options.expire_after_seconds, Some(0));
    }

    #[test]
    fn test_index_keys_reject_bad_patterns() {
        let empty: Result<IndexSpec, _> =
            serde_json::from_value(json!({ "collection": "c", "keys": {} }));
        assert!(empty.is_err());

        let bad_direction: Result<IndexSpec, _> =
            serde_json::from_value(json!({ "collection": "c", "keys": { "a": 2 } }));
        assert!(bad_direction.is_err());

        let token: IndexSpec =
            serde_json::from_value(json!({ "collection": "c", "keys": { "body": "text" } }))
                .unwrap();
        assert_eq!(token.effective_name(), "body_text");
    }

    #[test]
    fn test_text_fields_compare_as_a_group() {
        let text = |fields: &[&str]| {
            IndexKeys::new(
                fields
                    .iter()
                    .map(|f| (f.to_string(), IndexDirection::Kind("text".into())))
                    .collect(),
            )
            .unwrap()
        };
        assert!(text(&["title", "body"]).same_pattern(&text(&["body", "title"])));
        assert!(!text(&["title"]).same_pattern(&text(&["body"])));

        let plain = |fields: &[&str]| IndexKeys::ascending(fields);
        assert!(plain(&["a", "b"]).same_pattern(&plain(&["a", "b"])));
        assert!(!plain(&["a", "b"]).same_pattern(&plain(&["b", "a"])));
    }

    #[test]
    fn test_object_spec_is_tagged_by_kind() {
        let spec: ObjectSpec = serde_json::from_value(json!({
            "kind": "user",
            "name": "svc",
            "database": "admin",
            "password": { "env": { "var": "SVC_PASSWORD" } },
            "roles": [{ "role": "readWrite", "db": "app_db" }]
        }))
        .unwrap();

        assert_eq!(spec.kind(), ObjectKind::User);
        assert_eq!(spec.display_name(), "svc@admin");
    }

    #[test]
    fn test_outcome_success_classes() {
        assert!(Outcome::Created.is_success());
        assert!(Outcome::AlreadyExists.is_success());
        assert!(!Outcome::Conflict.is_success());
        assert!(!Outcome::Failed(FailureKind::Timeout).is_success());
        assert_eq!(
            Outcome::Failed(FailureKind::Validation).to_string(),
            "failed (validation error)"
        );
    }
}
