//! MongoDB backend for the admin seam, driven entirely through database
//! commands (`usersInfo`, `createUser`, `listCollections`, `create`,
//! `listIndexes`, `createIndexes`, `dropIndexes`, `insert`).

use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::error::{Error as MongoError, ErrorKind};
use mongodb::options::{ClientOptions, Credential};
use mongodb::Client;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::admin::{CollectionInfo, DocumentAdmin, IndexInfo, UserInfo};
use crate::auth::Secret;
use crate::error::{BootstrapError, Result};
use crate::models::{
    CollectionSpec, IndexDirection, IndexKeys, IndexSpec, RoleGrant, UserSpec, ValidationAction,
    ValidationLevel,
};

const APP_NAME: &str = "doc-bootstrap";

/// Large enough that metadata listings fit in the first batch.
const LISTING_BATCH_SIZE: i32 = 10_000;

pub struct MongoAdmin {
    client: Client,
}

impl MongoAdmin {
    pub async fn connect(
        uri: &str,
        credentials: Option<(String, Secret)>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut options = ClientOptions::parse(uri)
            .await
            .map_err(|e| BootstrapError::Connection(e.to_string()))?;
        options.connect_timeout = Some(timeout);
        options.server_selection_timeout = Some(timeout);
        options.app_name = Some(APP_NAME.to_string());
        if let Some((username, password)) = credentials {
            let mut credential = Credential::default();
            credential.username = Some(username);
            credential.password = Some(password.expose().to_string());
            credential.source = Some("admin".to_string());
            options.credential = Some(credential);
        }

        let client =
            Client::with_options(options).map_err(|e| BootstrapError::Connection(e.to_string()))?;
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| BootstrapError::Connection(e.to_string()))?;
        info!("MongoDB connection established");
        Ok(Self { client })
    }

    async fn command(&self, database: &str, command: Document) -> Result<Value> {
        debug!(database, command = ?command.keys().next(), "running admin command");
        let reply = self.client.database(database).run_command(command).await?;
        Ok(Bson::Document(reply).into_relaxed_extjson())
    }
}

impl From<MongoError> for BootstrapError {
    fn from(err: MongoError) -> Self {
        match err.kind.as_ref() {
            ErrorKind::Command(command) => classify_code(command.code, err.to_string()),
            ErrorKind::ServerSelection { .. }
            | ErrorKind::DnsResolve { .. }
            | ErrorKind::Authentication { .. }
            | ErrorKind::Io { .. } => Self::Connection(err.to_string()),
            _ => Self::Database(err.to_string()),
        }
    }
}

/// Map server error codes onto the bootstrap error taxonomy.
fn classify_code(code: i32, message: String) -> BootstrapError {
    match code {
        121 => BootstrapError::DocumentRejected(message),
        11000 | 11001 => BootstrapError::DuplicateKey(message),
        // NamespaceExists, IndexOptionsConflict, IndexKeySpecsConflict, user exists
        48 | 85 | 86 | 51003 => BootstrapError::AlreadyExists(message),
        // NamespaceNotFound, IndexNotFound
        26 | 27 => BootstrapError::NotFound(message),
        // BadValue, FailedToParse, TypeMismatch, CannotCreateIndex, InvalidOptions,
        // InvalidIndexSpecificationOption
        2 | 9 | 14 | 67 | 72 | 197 => BootstrapError::InvalidSpec(message),
        18 => BootstrapError::Connection(message),
        _ => BootstrapError::Database(message),
    }
}

fn malformed_reply(what: &str) -> BootstrapError {
    BootstrapError::Database(format!("unexpected {what} reply shape"))
}

fn first_batch<'a>(reply: &'a Value, what: &str) -> Result<&'a Vec<Value>> {
    let cursor = reply.get("cursor").ok_or_else(|| malformed_reply(what))?;
    if cursor.get("id").and_then(Value::as_i64).is_some_and(|id| id != 0) {
        warn!("{} listing did not fit in one batch, results are truncated", what);
    }
    cursor
        .get("firstBatch")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed_reply(what))
}

fn str_field<'a>(entry: &'a Value, field: &str, what: &str) -> Result<&'a str> {
    entry
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| malformed_reply(what))
}

fn parse_users(reply: &Value) -> Result<Vec<UserInfo>> {
    let users = reply
        .get("users")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed_reply("usersInfo"))?;
    users
        .iter()
        .map(|user| {
            let roles = user
                .get("roles")
                .and_then(Value::as_array)
                .map(|roles| {
                    roles
                        .iter()
                        .map(|r| {
                            Ok(RoleGrant::new(
                                str_field(r, "role", "usersInfo")?,
                                str_field(r, "db", "usersInfo")?,
                            ))
                        })
                        .collect::<Result<Vec<_>>>()
                })
                .transpose()?
                .unwrap_or_default();
            Ok(UserInfo {
                name: str_field(user, "user", "usersInfo")?.to_string(),
                database: str_field(user, "db", "usersInfo")?.to_string(),
                roles,
            })
        })
        .collect()
}

fn parse_level(value: Option<&Value>) -> Option<ValidationLevel> {
    match value?.as_str()? {
        "off" => Some(ValidationLevel::Off),
        "strict" => Some(ValidationLevel::Strict),
        "moderate" => Some(ValidationLevel::Moderate),
        _ => None,
    }
}

fn parse_action(value: Option<&Value>) -> Option<ValidationAction> {
    match value?.as_str()? {
        "error" => Some(ValidationAction::Error),
        "warn" => Some(ValidationAction::Warn),
        _ => None,
    }
}

fn parse_collections(reply: &Value) -> Result<Vec<CollectionInfo>> {
    first_batch(reply, "listCollections")?
        .iter()
        .filter(|entry| entry.get("type").and_then(Value::as_str).unwrap_or("collection") == "collection")
        .map(|entry| {
            let options = entry.get("options");
            Ok(CollectionInfo {
                name: str_field(entry, "name", "listCollections")?.to_string(),
                validator: options.and_then(|o| o.get("validator")).cloned(),
                validation_level: parse_level(options.and_then(|o| o.get("validationLevel"))),
                validation_action: parse_action(options.and_then(|o| o.get("validationAction"))),
            })
        })
        .collect()
}

/// Key pattern of a listed index. Text indexes are listed as
/// `{_fts: "text", _ftsx: 1}` with their fields under `weights`.
fn listed_keys(entry: &Value) -> Result<IndexKeys> {
    let key = entry
        .get("key")
        .and_then(Value::as_object)
        .ok_or_else(|| malformed_reply("listIndexes"))?;
    let mut fields = Vec::with_capacity(key.len());
    for (field, direction) in key {
        match field.as_str() {
            "_fts" => {
                let weights = entry
                    .get("weights")
                    .and_then(Value::as_object)
                    .ok_or_else(|| malformed_reply("listIndexes"))?;
                fields.extend(
                    weights
                        .keys()
                        .map(|f| (f.clone(), IndexDirection::Kind("text".to_string()))),
                );
            }
            "_ftsx" => {}
            _ => fields.push((
                field.clone(),
                IndexDirection::try_from(direction).map_err(BootstrapError::Database)?,
            )),
        }
    }
    IndexKeys::new(fields).map_err(BootstrapError::Database)
}

pub(crate) fn parse_indexes(reply: &Value) -> Result<Vec<IndexInfo>> {
    first_batch(reply, "listIndexes")?
        .iter()
        .map(|entry| {
            let keys = listed_keys(entry)?;
            Ok(IndexInfo {
                name: str_field(entry, "name", "listIndexes")?.to_string(),
                keys,
                unique: entry.get("unique").and_then(Value::as_bool).unwrap_or(false),
                expire_after_seconds: entry
                    .get("expireAfterSeconds")
                    .and_then(Value::as_f64)
                    .filter(|secs| *secs >= 0.0)
                    .map(|secs| secs as u64),
            })
        })
        .collect()
}

fn create_user_command(spec: &UserSpec, password: &Secret) -> Document {
    let roles: Vec<Bson> = spec
        .roles
        .iter()
        .map(|grant| Bson::Document(doc! { "role": grant.role.as_str(), "db": grant.db.as_str() }))
        .collect();
    doc! {
        "createUser": spec.name.as_str(),
        "pwd": password.expose(),
        "roles": roles,
    }
}

fn create_collection_command(spec: &CollectionSpec) -> Result<Document> {
    let mut command = doc! { "create": spec.name.as_str() };
    if let Some(validator) = &spec.validator {
        let validator = bson::to_document(validator)
            .map_err(|e| BootstrapError::InvalidSpec(format!("validator: {e}")))?;
        command.insert("validator", validator);
        command.insert("validationLevel", spec.validation_level.as_str());
        command.insert("validationAction", spec.validation_action.as_str());
    }
    Ok(command)
}

fn key_document(keys: &IndexKeys) -> Document {
    let mut key = Document::new();
    for (field, direction) in keys.fields() {
        let value = match direction {
            IndexDirection::Ascending => Bson::Int32(1),
            IndexDirection::Descending => Bson::Int32(-1),
            IndexDirection::Kind(kind) => Bson::String(kind.clone()),
        };
        key.insert(field.as_str(), value);
    }
    key
}

fn create_index_command(spec: &IndexSpec) -> Document {
    let mut index = doc! {
        "key": key_document(&spec.keys),
        "name": spec.effective_name(),
    };
    if spec.options.unique {
        index.insert("unique", true);
    }
    if let Some(secs) = spec.options.expire_after_seconds {
        index.insert("expireAfterSeconds", i64::try_from(secs).unwrap_or(i64::MAX));
    }
    doc! {
        "createIndexes": spec.collection.as_str(),
        "indexes": [index],
    }
}

/// Surface the first write error of an `insert` reply.
fn check_write_errors(reply: &Value) -> Result<()> {
    let Some(first) = reply
        .get("writeErrors")
        .and_then(Value::as_array)
        .and_then(|errors| errors.first())
    else {
        return Ok(());
    };
    let code = first
        .get("code")
        .and_then(Value::as_i64)
        .and_then(|c| i32::try_from(c).ok())
        .unwrap_or_default();
    let mut message = first
        .get("errmsg")
        .and_then(Value::as_str)
        .unwrap_or("write error")
        .to_string();
    if let Some(info) = first.get("errInfo") {
        message = format!("{message}: {info}");
    }
    Err(classify_code(code, message))
}

#[async_trait]
impl DocumentAdmin for MongoAdmin {
    fn backend_name(&self) -> &'static str {
        "mongodb"
    }

    async fn list_users(&self, database: &str) -> Result<Vec<UserInfo>> {
        let reply = self.command(database, doc! { "usersInfo": 1 }).await?;
        parse_users(&reply)
    }

    async fn create_user(&self, spec: &UserSpec, password: &Secret) -> Result<()> {
        self.command(&spec.database, create_user_command(spec, password))
            .await
            .map(|_| ())
    }

    async fn list_collections(&self, database: &str) -> Result<Vec<CollectionInfo>> {
        let command = doc! {
            "listCollections": 1,
            "cursor": { "batchSize": LISTING_BATCH_SIZE },
        };
        let reply = self.command(database, command).await?;
        parse_collections(&reply)
    }

    async fn create_collection(&self, spec: &CollectionSpec) -> Result<()> {
        let command = create_collection_command(spec)?;
        self.command(&spec.database, command).await.map(|_| ())
    }

    async fn list_indexes(&self, database: &str, collection: &str) -> Result<Vec<IndexInfo>> {
        let command = doc! {
            "listIndexes": collection,
            "cursor": { "batchSize": LISTING_BATCH_SIZE },
        };
        match self.command(database, command).await {
            Ok(reply) => parse_indexes(&reply),
            Err(BootstrapError::NotFound(_)) => Ok(vec![]),
            Err(e) => Err(e),
        }
    }

    async fn create_index(&self, spec: &IndexSpec) -> Result<()> {
        self.command(&spec.database, create_index_command(spec))
            .await
            .map(|_| ())
    }

    async fn drop_index(&self, database: &str, collection: &str, name: &str) -> Result<()> {
        let command = doc! { "dropIndexes": collection, "index": name };
        self.command(database, command).await.map(|_| ())
    }

    async fn insert_document(
        &self,
        database: &str,
        collection: &str,
        mut document: Value,
    ) -> Result<String> {
        let object = document.as_object_mut().ok_or_else(|| {
            BootstrapError::InvalidSpec("document must be a JSON object".to_string())
        })?;
        let id = match object.get("_id") {
            Some(Value::String(id)) => id.clone(),
            Some(other) => other.to_string(),
            None => {
                let id = Uuid::new_v4().to_string();
                object.insert("_id".to_string(), Value::String(id.clone()));
                id
            }
        };

        let document = Bson::try_from(document)
            .map_err(|e| BootstrapError::InvalidSpec(format!("document: {e}")))?;
        let command = doc! { "insert": collection, "documents": [document] };
        let reply = self.command(database, command).await?;
        check_write_errors(&reply)?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PasswordRef;
    use serde_json::json;

    #[test]
    fn test_index_command_carries_ttl_and_uniqueness() {
        let mut spec = IndexSpec::new(
            "n8n_ai_memory",
            "ai_sessions",
            IndexKeys::ascending(&["expiresAt"]),
        );
        spec.options.expire_after_seconds = Some(0);
        spec.options.unique = true;

        let command = create_index_command(&spec);
        assert_eq!(
            command,
            doc! {
                "createIndexes": "ai_sessions",
                "indexes": [{
                    "key": { "expiresAt": 1 },
                    "name": "expiresAt_1",
                    "unique": true,
                    "expireAfterSeconds": 0_i64,
                }],
            }
        );
    }

    #[test]
    fn test_create_user_command_lists_roles() {
        let spec = UserSpec {
            name: "n8n_admin".into(),
            database: "n8n_ai_memory".into(),
            password: PasswordRef::Env {
                var: "X".into(),
                insecure_default: None,
            },
            roles: vec![
                RoleGrant::new("readWrite", "n8n_ai_memory"),
                RoleGrant::new("dbAdmin", "n8n_ai_memory"),
            ],
        };
        let command = create_user_command(&spec, &Secret::new("pw"));
        assert_eq!(command.get_str("createUser").unwrap(), "n8n_admin");
        assert_eq!(command.get_array("roles").unwrap().len(), 2);
    }

    #[test]
    fn test_collection_command_without_validator() {
        let spec = CollectionSpec {
            name: "plain".into(),
            database: "db".into(),
            validator: None,
            validation_level: ValidationLevel::Strict,
            validation_action: ValidationAction::Error,
        };
        assert_eq!(create_collection_command(&spec).unwrap(), doc! { "create": "plain" });
    }

    #[test]
    fn test_parse_index_listing() {
        let reply = json!({
            "cursor": {
                "id": 0,
                "firstBatch": [
                    { "v": 2, "key": { "_id": 1 }, "name": "_id_" },
                    { "v": 2, "key": { "sessionId": 1, "createdAt": -1 }, "name": "sessionId_1_createdAt_-1" },
                    { "v": 2, "key": { "expiresAt": 1 }, "name": "expiresAt_1", "expireAfterSeconds": 0 }
                ]
            },
            "ok": 1.0
        });
        let indexes = parse_indexes(&reply).unwrap();
        assert_eq!(indexes.len(), 3);
        assert_eq!(indexes[1].keys.default_name(), "sessionId_1_createdAt_-1");
        assert_eq!(indexes[2].expire_after_seconds, Some(0));
        assert!(!indexes[2].unique);
    }

    #[test]
    fn test_parse_text_index_listing() {
        let reply = json!({
            "cursor": {
                "id": 0,
                "firstBatch": [{
                    "v": 2,
                    "key": { "sessionId": 1, "_fts": "text", "_ftsx": 1 },
                    "name": "sessionId_1_summary_text_keywords_text",
                    "weights": { "keywords": 1, "summary": 1 },
                    "default_language": "english",
                    "language_override": "language",
                    "textIndexVersion": 3
                }]
            },
            "ok": 1.0
        });
        let listed = parse_indexes(&reply).unwrap();
        let declared = IndexKeys::new(vec![
            ("sessionId".into(), IndexDirection::Ascending),
            ("summary".into(), IndexDirection::Kind("text".into())),
            ("keywords".into(), IndexDirection::Kind("text".into())),
        ])
        .unwrap();
        assert!(listed[0].keys.same_pattern(&declared));
        assert_eq!(listed[0].keys.len(), 3);
    }

    #[test]
    fn test_parse_collections_skips_views() {
        let reply = json!({
            "cursor": {
                "id": 0,
                "firstBatch": [
                    {
                        "name": "chat_memory",
                        "type": "collection",
                        "options": {
                            "validator": { "$jsonSchema": { "bsonType": "object" } },
                            "validationLevel": "strict",
                            "validationAction": "error"
                        }
                    },
                    { "name": "recent", "type": "view", "options": {} }
                ]
            }
        });
        let collections = parse_collections(&reply).unwrap();
        assert_eq!(collections.len(), 1);
        assert_eq!(collections[0].validation_level, Some(ValidationLevel::Strict));
        assert!(collections[0].validator.is_some());
    }

    #[test]
    fn test_parse_users_info() {
        let reply = json!({
            "users": [{
                "_id": "admin.n8n_admin",
                "user": "n8n_admin",
                "db": "admin",
                "roles": [{ "role": "userAdminAnyDatabase", "db": "admin" }]
            }],
            "ok": 1
        });
        let users = parse_users(&reply).unwrap();
        assert_eq!(users[0].name, "n8n_admin");
        assert_eq!(users[0].roles, vec![RoleGrant::new("userAdminAnyDatabase", "admin")]);
    }

    #[test]
    fn test_write_errors_are_classified() {
        let reply = json!({
            "n": 0,
            "writeErrors": [{ "index": 0, "code": 121, "errmsg": "Document failed validation" }],
            "ok": 1
        });
        assert!(matches!(
            check_write_errors(&reply).unwrap_err(),
            BootstrapError::DocumentRejected(_)
        ));
        assert!(check_write_errors(&json!({ "n": 1, "ok": 1 })).is_ok());
        assert!(matches!(classify_code(86, "x".into()), BootstrapError::AlreadyExists(_)));
        assert!(matches!(classify_code(2, "x".into()), BootstrapError::InvalidSpec(_)));
    }
}
