use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sled::Db;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::admin::{CollectionInfo, DocumentAdmin, IndexInfo, UserInfo};
use crate::auth::{hash_password_with_cost, verify_password, Secret};
use crate::error::{BootstrapError, Result};
use crate::models::{
    CollectionSpec, IndexKeys, IndexSpec, RoleGrant, UserSpec, ValidationAction, ValidationLevel,
};
use crate::validation::{json_equivalent, lookup, parse_date, Validator};

/// User record as persisted by the embedded store (password is a bcrypt hash).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StoredUser {
    pub name: String,
    pub database: String,
    pub password_hash: String,
    pub roles: Vec<RoleGrant>,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CollectionMeta {
    pub database: String,
    pub name: String,
    pub validator: Option<Value>,
    pub validation_level: ValidationLevel,
    pub validation_action: ValidationAction,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IndexMeta {
    pub database: String,
    pub collection: String,
    pub name: String,
    pub keys: IndexKeys,
    pub unique: bool,
    pub expire_after_seconds: Option<u64>,
}

/// Embedded document store on sled.
///
/// Metadata lives in three trees (`users`, `collections`, `indexes`) keyed by
/// NUL-separated scope parts; each collection's documents live in their own
/// tree named by the scoped key `docs\0<database>\0<collection>`, keyed by `_id`.
#[derive(Clone)]
pub struct Storage {
    db: Db,
    users_tree: sled::Tree,
    collections_tree: sled::Tree,
    indexes_tree: sled::Tree,
    hash_cost: u32,
}

fn scoped_key(parts: &[&str]) -> Vec<u8> {
    parts.join("\0").into_bytes()
}

fn scope_prefix(parts: &[&str]) -> Vec<u8> {
    let mut prefix = scoped_key(parts);
    prefix.push(0);
    prefix
}

fn require_name(what: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.contains('\0') {
        return Err(BootstrapError::InvalidSpec(format!("{what} name must be non-empty")));
    }
    Ok(())
}

fn check_collection_name(name: &str) -> Result<()> {
    require_name("collection", name)?;
    if name.contains('$') || name.starts_with("system.") {
        return Err(BootstrapError::InvalidSpec(format!(
            "invalid collection name '{name}'"
        )));
    }
    Ok(())
}

/// Values of the indexed fields, missing fields counting as null.
fn index_tuple(document: &Value, keys: &IndexKeys) -> Vec<Value> {
    keys.fields()
        .iter()
        .map(|(field, _)| lookup(document, field).cloned().unwrap_or(Value::Null))
        .collect()
}

fn same_tuple(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| json_equivalent(x, y))
}

/// Earliest date held by a TTL field (arrays expire on their earliest element).
fn ttl_anchor(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Array(items) => items.iter().filter_map(parse_date).min(),
        other => parse_date(other),
    }
}

impl Storage {
    /// Open or create the sled database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        let users_tree = db.open_tree("users")?;
        let collections_tree = db.open_tree("collections")?;
        let indexes_tree = db.open_tree("indexes")?;
        Ok(Self {
            db,
            users_tree,
            collections_tree,
            indexes_tree,
            hash_cost: bcrypt::DEFAULT_COST,
        })
    }

    /// Override the bcrypt cost used for new users.
    pub fn with_hash_cost(mut self, cost: u32) -> Self {
        self.hash_cost = cost;
        self
    }

    /// Run store work on the blocking pool so callers can bound it with a
    /// timeout. Work already started still completes after the caller gives up.
    async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Storage) -> Result<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || work(store))
            .await
            .map_err(|e| BootstrapError::Database(format!("storage task failed: {e}")))?
    }

    fn docs_tree(&self, database: &str, collection: &str) -> Result<sled::Tree> {
        Ok(self.db.open_tree(scoped_key(&["docs", database, collection]))?)
    }

    // --- users ---

    pub fn users(&self, database: &str) -> Result<Vec<StoredUser>> {
        let mut users = vec![];
        for item in self.users_tree.scan_prefix(scope_prefix(&[database])) {
            let (_, v) = item?;
            users.push(serde_json::from_slice(&v)?);
        }
        Ok(users)
    }

    pub fn get_user(&self, database: &str, name: &str) -> Result<Option<StoredUser>> {
        match self.users_tree.get(scoped_key(&[database, name]))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn insert_user(&self, spec: &UserSpec, password: &Secret) -> Result<()> {
        require_name("user", &spec.name)?;
        require_name("database", &spec.database)?;
        if let Some(grant) = spec.roles.iter().find(|g| g.role.is_empty() || g.db.is_empty()) {
            return Err(BootstrapError::InvalidSpec(format!(
                "role grant '{grant}' needs both a role and a database"
            )));
        }

        let record = StoredUser {
            name: spec.name.clone(),
            database: spec.database.clone(),
            password_hash: hash_password_with_cost(password, self.hash_cost)?,
            roles: spec.roles.clone(),
            created_at: Utc::now(),
        };
        let key = scoped_key(&[&spec.database, &spec.name]);
        let bytes = serde_json::to_vec(&record)?;
        self.users_tree
            .compare_and_swap(key, None::<&[u8]>, Some(bytes))?
            .map_err(|_| {
                BootstrapError::AlreadyExists(format!("user {}@{}", spec.name, spec.database))
            })?;
        debug!(user = %spec.name, database = %spec.database, "user stored");
        Ok(())
    }

    /// Check a login against the stored bcrypt hash.
    pub fn verify_user_password(&self, database: &str, name: &str, password: &str) -> Result<bool> {
        match self.get_user(database, name)? {
            Some(user) => verify_password(password, &user.password_hash),
            None => Ok(false),
        }
    }

    // --- collections ---

    pub fn collections(&self, database: &str) -> Result<Vec<CollectionMeta>> {
        let mut collections = vec![];
        for item in self.collections_tree.scan_prefix(scope_prefix(&[database])) {
            let (_, v) = item?;
            collections.push(serde_json::from_slice(&v)?);
        }
        Ok(collections)
    }

    pub fn get_collection(&self, database: &str, name: &str) -> Result<Option<CollectionMeta>> {
        match self.collections_tree.get(scoped_key(&[database, name]))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn insert_collection(&self, spec: &CollectionSpec) -> Result<CollectionMeta> {
        require_name("database", &spec.database)?;
        check_collection_name(&spec.name)?;
        if let Some(validator) = &spec.validator {
            Validator::compile(validator)?;
        }

        let meta = CollectionMeta {
            database: spec.database.clone(),
            name: spec.name.clone(),
            validator: spec.validator.clone(),
            validation_level: spec.validation_level,
            validation_action: spec.validation_action,
            created_at: Utc::now(),
        };
        let key = scoped_key(&[&spec.database, &spec.name]);
        self.collections_tree
            .compare_and_swap(key, None::<&[u8]>, Some(serde_json::to_vec(&meta)?))?
            .map_err(|_| {
                BootstrapError::AlreadyExists(format!("collection {}.{}", spec.database, spec.name))
            })?;
        Ok(meta)
    }

    /// Collections spring into existence on first write, without a validator.
    fn ensure_collection(&self, database: &str, name: &str) -> Result<CollectionMeta> {
        if let Some(meta) = self.get_collection(database, name)? {
            return Ok(meta);
        }
        debug!(database, collection = name, "creating collection implicitly");
        self.insert_collection(&CollectionSpec {
            name: name.to_string(),
            database: database.to_string(),
            validator: None,
            validation_level: ValidationLevel::default(),
            validation_action: ValidationAction::default(),
        })
    }

    // --- indexes ---

    pub fn indexes(&self, database: &str, collection: &str) -> Result<Vec<IndexMeta>> {
        let mut indexes = vec![];
        for item in self
            .indexes_tree
            .scan_prefix(scope_prefix(&[database, collection]))
        {
            let (_, v) = item?;
            indexes.push(serde_json::from_slice(&v)?);
        }
        Ok(indexes)
    }

    pub fn insert_index(&self, spec: &IndexSpec) -> Result<IndexMeta> {
        require_name("database", &spec.database)?;
        check_collection_name(&spec.collection)?;
        let name = spec.effective_name();

        if spec.options.expire_after_seconds.is_some()
            && (spec.keys.len() != 1 || !spec.keys.fields()[0].1.is_ordered())
        {
            return Err(BootstrapError::InvalidSpec(format!(
                "TTL index '{name}' must be a single ascending or descending field"
            )));
        }

        self.ensure_collection(&spec.database, &spec.collection)?;
        let existing = self.indexes(&spec.database, &spec.collection)?;
        if let Some(other) = existing.iter().find(|i| i.keys.same_pattern(&spec.keys)) {
            return Err(BootstrapError::AlreadyExists(format!(
                "index with key pattern {} already exists as '{}'",
                spec.keys, other.name
            )));
        }

        if spec.options.unique {
            let tree = self.docs_tree(&spec.database, &spec.collection)?;
            let mut seen: Vec<Vec<Value>> = vec![];
            for item in tree.iter() {
                let (_, v) = item?;
                let doc: Value = serde_json::from_slice(&v)?;
                let tuple = index_tuple(&doc, &spec.keys);
                if seen.iter().any(|s| same_tuple(s, &tuple)) {
                    return Err(BootstrapError::DuplicateKey(format!(
                        "cannot build unique index '{name}': duplicate {}",
                        Value::Array(tuple)
                    )));
                }
                seen.push(tuple);
            }
        }

        let meta = IndexMeta {
            database: spec.database.clone(),
            collection: spec.collection.clone(),
            name: name.clone(),
            keys: spec.keys.clone(),
            unique: spec.options.unique,
            expire_after_seconds: spec.options.expire_after_seconds,
        };
        let key = scoped_key(&[&spec.database, &spec.collection, &name]);
        self.indexes_tree
            .compare_and_swap(key, None::<&[u8]>, Some(serde_json::to_vec(&meta)?))?
            .map_err(|_| BootstrapError::AlreadyExists(format!("index '{name}'")))?;
        Ok(meta)
    }

    pub fn remove_index(&self, database: &str, collection: &str, name: &str) -> Result<()> {
        match self
            .indexes_tree
            .remove(scoped_key(&[database, collection, name]))?
        {
            Some(_) => Ok(()),
            None => Err(BootstrapError::NotFound(format!(
                "index '{name}' on {database}.{collection}"
            ))),
        }
    }

    // --- documents ---

    /// Insert a JSON document, enforcing the collection validator and unique indexes.
    pub fn insert_doc(&self, database: &str, collection: &str, mut document: Value) -> Result<String> {
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

        let meta = self.ensure_collection(database, collection)?;
        if let (Some(validator), true) = (
            &meta.validator,
            meta.validation_level != ValidationLevel::Off,
        ) {
            if let Err(violations) = Validator::compile(validator)?.validate(&document) {
                let message = violations.join("; ");
                match meta.validation_action {
                    ValidationAction::Error => {
                        return Err(BootstrapError::DocumentRejected(message))
                    }
                    ValidationAction::Warn => {
                        warn!(database, collection, "document failed validation: {}", message)
                    }
                }
            }
        }

        let tree = self.docs_tree(database, collection)?;
        for index in self
            .indexes(database, collection)?
            .iter()
            .filter(|i| i.unique)
        {
            let tuple = index_tuple(&document, &index.keys);
            for item in tree.iter() {
                let (_, v) = item?;
                let existing: Value = serde_json::from_slice(&v)?;
                if same_tuple(&index_tuple(&existing, &index.keys), &tuple) {
                    return Err(BootstrapError::DuplicateKey(format!(
                        "index '{}' already holds {}",
                        index.name,
                        Value::Array(tuple)
                    )));
                }
            }
        }

        tree.compare_and_swap(id.as_bytes(), None::<&[u8]>, Some(serde_json::to_vec(&document)?))?
            .map_err(|_| BootstrapError::DuplicateKey(format!("_id {id}")))?;
        Ok(id)
    }

    pub fn get_doc(&self, database: &str, collection: &str, id: &str) -> Result<Option<Value>> {
        match self.docs_tree(database, collection)?.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn count_docs(&self, database: &str, collection: &str) -> Result<usize> {
        Ok(self.docs_tree(database, collection)?.len())
    }

    /// Remove documents whose TTL field has passed its expiry at `now`.
    /// Returns how many documents were deleted.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        for item in self.indexes_tree.iter() {
            let (_, v) = item?;
            let index: IndexMeta = serde_json::from_slice(&v)?;
            let Some(ttl) = index
                .expire_after_seconds
                .and_then(|secs| i64::try_from(secs).ok())
                .and_then(TimeDelta::try_seconds)
            else {
                continue;
            };
            let field = &index.keys.fields()[0].0;
            let tree = self.docs_tree(&index.database, &index.collection)?;
            for doc in tree.iter() {
                let (key, bytes) = doc?;
                let document: Value = serde_json::from_slice(&bytes)?;
                let expired = lookup(&document, field)
                    .and_then(ttl_anchor)
                    .and_then(|anchor| anchor.checked_add_signed(ttl))
                    .is_some_and(|expiry| expiry <= now);
                if expired && tree.remove(key)?.is_some() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(removed, "purged expired documents");
        }
        Ok(removed)
    }
}

#[async_trait]
impl DocumentAdmin for Storage {
    fn backend_name(&self) -> &'static str {
        "embedded"
    }

    async fn list_users(&self, database: &str) -> Result<Vec<UserInfo>> {
        let database = database.to_string();
        let users = self.blocking(move |store| store.users(&database)).await?;
        Ok(users
            .into_iter()
            .map(|u| UserInfo {
                name: u.name,
                database: u.database,
                roles: u.roles,
            })
            .collect())
    }

    async fn create_user(&self, spec: &UserSpec, password: &Secret) -> Result<()> {
        let (spec, password) = (spec.clone(), password.clone());
        self.blocking(move |store| store.insert_user(&spec, &password))
            .await
    }

    async fn list_collections(&self, database: &str) -> Result<Vec<CollectionInfo>> {
        let database = database.to_string();
        let collections = self
            .blocking(move |store| store.collections(&database))
            .await?;
        Ok(collections
            .into_iter()
            .map(|c| CollectionInfo {
                name: c.name,
                validator: c.validator,
                validation_level: Some(c.validation_level),
                validation_action: Some(c.validation_action),
            })
            .collect())
    }

    async fn create_collection(&self, spec: &CollectionSpec) -> Result<()> {
        let spec = spec.clone();
        self.blocking(move |store| store.insert_collection(&spec).map(|_| ()))
            .await
    }

    async fn list_indexes(&self, database: &str, collection: &str) -> Result<Vec<IndexInfo>> {
        let (database, collection) = (database.to_string(), collection.to_string());
        let indexes = self
            .blocking(move |store| store.indexes(&database, &collection))
            .await?;
        Ok(indexes
            .into_iter()
            .map(|i| IndexInfo {
                name: i.name,
                keys: i.keys,
                unique: i.unique,
                expire_after_seconds: i.expire_after_seconds,
            })
            .collect())
    }

    async fn create_index(&self, spec: &IndexSpec) -> Result<()> {
        let spec = spec.clone();
        self.blocking(move |store| store.insert_index(&spec).map(|_| ()))
            .await
    }

    async fn drop_index(&self, database: &str, collection: &str, name: &str) -> Result<()> {
        let (database, collection, name) =
            (database.to_string(), collection.to_string(), name.to_string());
        self.blocking(move |store| store.remove_index(&database, &collection, &name))
            .await
    }

    async fn insert_document(
        &self,
        database: &str,
        collection: &str,
        document: Value,
    ) -> Result<String> {
        let (database, collection) = (database.to_string(), collection.to_string());
        self.blocking(move |store| store.insert_doc(&database, &collection, document))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IndexOptions, PasswordRef};
    use crate::validation::date_value;
    use serde_json::json;

    fn open_temp() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().expect("temp dir");
        let storage = Storage::open(dir.path().join("store"))
            .expect("Failed to open storage")
            .with_hash_cost(crate::auth::TEST_HASH_COST);
        (dir, storage)
    }

    fn events_spec() -> CollectionSpec {
        CollectionSpec {
            name: "events".into(),
            database: "app_db".into(),
            validator: Some(json!({
                "$jsonSchema": {
                    "bsonType": "object",
                    "required": ["type"],
                    "properties": { "type": { "bsonType": "string" } }
                }
            })),
            validation_level: ValidationLevel::Strict,
            validation_action: ValidationAction::Error,
        }
    }

    #[test]
    fn test_users_are_scoped_and_hashed() {
        let (_dir, storage) = open_temp();
        let spec = UserSpec {
            name: "svc".into(),
            database: "admin".into(),
            password: PasswordRef::Env {
                var: "UNUSED".into(),
                insecure_default: None,
            },
            roles: vec![RoleGrant::new("readWrite", "app_db")],
        };
        storage.insert_user(&spec, &Secret::new("pw")).unwrap();

        assert_eq!(storage.users("admin").unwrap().len(), 1);
        assert!(storage.users("app_db").unwrap().is_empty());
        assert!(storage.verify_user_password("admin", "svc", "pw").unwrap());
        assert!(!storage.verify_user_password("admin", "svc", "nope").unwrap());

        let stored = storage.get_user("admin", "svc").unwrap().unwrap();
        assert_ne!(stored.password_hash, "pw");

        let again = storage.insert_user(&spec, &Secret::new("pw")).unwrap_err();
        assert!(matches!(again, BootstrapError::AlreadyExists(_)));
    }

    #[test]
    fn test_validator_rejects_missing_field() {
        let (_dir, storage) = open_temp();
        storage.insert_collection(&events_spec()).unwrap();

        let id = storage
            .insert_doc("app_db", "events", json!({ "type": "login" }))
            .unwrap();
        assert!(storage.get_doc("app_db", "events", &id).unwrap().is_some());

        let err = storage
            .insert_doc("app_db", "events", json!({ "kind": "login" }))
            .unwrap_err();
        assert!(matches!(err, BootstrapError::DocumentRejected(ref m) if m.contains("'type'")));
        assert_eq!(storage.count_docs("app_db", "events").unwrap(), 1);
    }

    #[test]
    fn test_warn_action_accepts_invalid_documents() {
        let (_dir, storage) = open_temp();
        let mut spec = events_spec();
        spec.validation_action = ValidationAction::Warn;
        storage.insert_collection(&spec).unwrap();

        storage
            .insert_doc("app_db", "events", json!({ "kind": "login" }))
            .unwrap();
        assert_eq!(storage.count_docs("app_db", "events").unwrap(), 1);
    }

    #[test]
    fn test_malformed_validator_is_invalid_spec() {
        let (_dir, storage) = open_temp();
        let mut spec = events_spec();
        spec.validator = Some(json!({ "$jsonSchema": { "bsonType": 5 } }));
        let err = storage.insert_collection(&spec).unwrap_err();
        assert!(matches!(err, BootstrapError::InvalidSpec(_)));
        assert!(storage.get_collection("app_db", "events").unwrap().is_none());
    }

    #[test]
    fn test_unique_index_rejects_duplicates() {
        let (_dir, storage) = open_temp();
        let mut spec = IndexSpec::new("mem", "ai_sessions", IndexKeys::ascending(&["sessionId"]));
        spec.options.unique = true;
        storage.insert_index(&spec).unwrap();

        storage
            .insert_doc("mem", "ai_sessions", json!({ "sessionId": "a" }))
            .unwrap();
        let err = storage
            .insert_doc("mem", "ai_sessions", json!({ "sessionId": "a" }))
            .unwrap_err();
        assert!(matches!(err, BootstrapError::DuplicateKey(_)));
    }

    #[test]
    fn test_unique_index_build_fails_on_existing_duplicates() {
        let (_dir, storage) = open_temp();
        for _ in 0..2 {
            storage
                .insert_doc("mem", "ai_sessions", json!({ "userId": "u1" }))
                .unwrap();
        }
        let mut spec = IndexSpec::new("mem", "ai_sessions", IndexKeys::ascending(&["userId"]));
        spec.options.unique = true;
        assert!(matches!(
            storage.insert_index(&spec).unwrap_err(),
            BootstrapError::DuplicateKey(_)
        ));
    }

    #[test]
    fn test_ttl_index_must_be_single_field() {
        let (_dir, storage) = open_temp();
        let mut spec = IndexSpec::new("mem", "s", IndexKeys::ascending(&["a", "b"]));
        spec.options.expire_after_seconds = Some(60);
        assert!(matches!(
            storage.insert_index(&spec).unwrap_err(),
            BootstrapError::InvalidSpec(_)
        ));
    }

    #[test]
    fn test_purge_expired_documents() {
        let (_dir, storage) = open_temp();
        let mut spec = IndexSpec::new("mem", "ai_sessions", IndexKeys::ascending(&["expiresAt"]));
        spec.options = IndexOptions {
            name: None,
            unique: false,
            expire_after_seconds: Some(0),
        };
        storage.insert_index(&spec).unwrap();

        let now = Utc::now();
        let past = now - TimeDelta::try_hours(1).unwrap();
        let future = now + TimeDelta::try_hours(1).unwrap();
        storage
            .insert_doc("mem", "ai_sessions", json!({ "_id": "old", "expiresAt": date_value(past) }))
            .unwrap();
        storage
            .insert_doc("mem", "ai_sessions", json!({ "_id": "new", "expiresAt": date_value(future) }))
            .unwrap();
        storage
            .insert_doc("mem", "ai_sessions", json!({ "_id": "none" }))
            .unwrap();

        assert_eq!(storage.purge_expired(now).unwrap(), 1);
        assert!(storage.get_doc("mem", "ai_sessions", "old").unwrap().is_none());
        assert_eq!(storage.count_docs("mem", "ai_sessions").unwrap(), 2);
    }

    #[test]
    fn test_document_trees_do_not_collide_on_slashes() {
        let (_dir, storage) = open_temp();
        storage.insert_doc("a/b", "c", json!({ "n": 1 })).unwrap();
        storage.insert_doc("a", "b/c", json!({ "n": 2 })).unwrap();
        storage.insert_doc("a", "b/c", json!({ "n": 3 })).unwrap();

        assert_eq!(storage.count_docs("a/b", "c").unwrap(), 1);
        assert_eq!(storage.count_docs("a", "b/c").unwrap(), 2);
    }

    #[test]
    fn test_drop_missing_index_is_not_found() {
        let (_dir, storage) = open_temp();
        assert!(matches!(
            storage.remove_index("mem", "c", "x").unwrap_err(),
            BootstrapError::NotFound(_)
        ));
    }
}
