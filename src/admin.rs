//! Administrative seam between the bootstrap engine and a document database.
//!
//! The engine only sees [`DocumentAdmin`]; [`connect`] picks the backend.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, info};

use crate::auth::{Secret, SecretResolver};
use crate::error::{BootstrapError, Result};
use crate::models::{
    CollectionSpec, IndexKeys, IndexSpec, PasswordRef, RoleGrant, UserSpec, ValidationAction,
    ValidationLevel,
};
use crate::mongo::MongoAdmin;
use crate::storage::Storage;

/// A user as reported by the database's own metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct UserInfo {
    pub name: String,
    pub database: String,
    pub roles: Vec<RoleGrant>,
}

/// A collection as reported by the database's own metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionInfo {
    pub name: String,
    pub validator: Option<Value>,
    pub validation_level: Option<ValidationLevel>,
    pub validation_action: Option<ValidationAction>,
}

/// An index as reported by the database's own metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexInfo {
    pub name: String,
    pub keys: IndexKeys,
    pub unique: bool,
    pub expire_after_seconds: Option<u64>,
}

impl IndexInfo {
    /// Same options as declared in `spec`; the key pattern is compared separately.
    pub fn same_options(&self, spec: &IndexSpec) -> bool {
        self.unique == spec.options.unique
            && self.expire_after_seconds == spec.options.expire_after_seconds
    }
}

/// Administrative operations the bootstrap engine needs. Every call is
/// scoped to an explicit database name.
#[async_trait]
pub trait DocumentAdmin: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn list_users(&self, database: &str) -> Result<Vec<UserInfo>>;

    async fn create_user(&self, spec: &UserSpec, password: &Secret) -> Result<()>;

    async fn list_collections(&self, database: &str) -> Result<Vec<CollectionInfo>>;

    async fn create_collection(&self, spec: &CollectionSpec) -> Result<()>;

    /// Indexes of a collection; empty when the collection does not exist.
    async fn list_indexes(&self, database: &str, collection: &str) -> Result<Vec<IndexInfo>>;

    async fn create_index(&self, spec: &IndexSpec) -> Result<()>;

    async fn drop_index(&self, database: &str, collection: &str, name: &str) -> Result<()>;

    /// Insert one document, returning its `_id`. Subject to the collection validator.
    async fn insert_document(&self, database: &str, collection: &str, document: Value)
        -> Result<String>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// sled-backed store in a local directory.
    Embedded { path: PathBuf },
    MongoDb { uri: String },
}

/// Administrative login used for the MongoDB connection.
#[derive(Debug, Clone, PartialEq)]
pub struct AdminCredentials {
    pub username: String,
    pub password: PasswordRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub target: Target,
    pub connect_timeout: Duration,
    pub credentials: Option<AdminCredentials>,
    /// bcrypt cost for the embedded store; `None` uses the bcrypt default.
    pub hash_cost: Option<u32>,
}

impl ConnectionConfig {
    pub fn embedded(path: impl Into<PathBuf>) -> Self {
        Self {
            target: Target::Embedded { path: path.into() },
            connect_timeout: Duration::from_secs(10),
            credentials: None,
            hash_cost: None,
        }
    }
}

/// Establish the administrative connection. The only operation whose
/// failure aborts a whole bootstrap run.
pub async fn connect(
    config: &ConnectionConfig,
    secrets: &SecretResolver,
) -> Result<Box<dyn DocumentAdmin>> {
    let credentials = match &config.credentials {
        Some(creds) => {
            // Refusing an insecure admin password is as fatal as a refused login.
            let password = secrets
                .resolve(&creds.password, &creds.username)
                .map_err(|e| BootstrapError::Connection(e.to_string()))?;
            Some((creds.username.clone(), password))
        }
        None => None,
    };

    let attempt = open_target(config, credentials);

    match tokio::time::timeout(config.connect_timeout, attempt).await {
        Ok(Ok(admin)) => {
            info!(backend = admin.backend_name(), "connected");
            Ok(admin)
        }
        Ok(Err(e)) => {
            error!("Failed to connect: {}", e);
            Err(e)
        }
        Err(_) => {
            error!("Connection attempt timed out after {:?}", config.connect_timeout);
            Err(BootstrapError::ConnectTimeout(config.connect_timeout))
        }
    }
}

async fn open_target(
    config: &ConnectionConfig,
    credentials: Option<(String, Secret)>,
) -> Result<Box<dyn DocumentAdmin>> {
    match &config.target {
        Target::Embedded { path } => {
            let path = path.clone();
            let storage = tokio::task::spawn_blocking(move || Storage::open(&path))
                .await
                .map_err(|e| BootstrapError::Connection(e.to_string()))?
                .map_err(|e| BootstrapError::Connection(e.to_string()))?;
            let storage = match config.hash_cost {
                Some(cost) => storage.with_hash_cost(cost),
                None => storage,
            };
            Ok(Box::new(storage))
        }
        Target::MongoDb { uri } => {
            let admin = MongoAdmin::connect(uri, credentials, config.connect_timeout).await?;
            Ok(Box::new(admin))
        }
    }
}
