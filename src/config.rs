//! Manifest loading and connection settings.
//!
//! A manifest is a JSON document:
//!
//! ```json
//! {
//!   "version": "2026-01",
//!   "database": "n8n_ai_memory",
//!   "users": [ ... ],
//!   "collections": [ ... ],
//!   "indexes": [ ... ],
//!   "objects": [ { "kind": "index", ... } ]
//! }
//! ```
//!
//! Entries without a `database` inherit the top-level one.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, ValueEnum};
use serde::Deserialize;
use tracing::info;

use crate::admin::{AdminCredentials, ConnectionConfig, Target};
use crate::auth::{INSECURE_DEFAULT_PASSWORD, ROOT_PASSWORD_VAR};
use crate::engine::ApplyPolicy;
use crate::error::{BootstrapError, Result};
use crate::models::{CollectionSpec, IndexSpec, ObjectSpec, PasswordRef, UserSpec};

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub version: Option<String>,
    /// Default database for entries that do not name one.
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub users: Vec<UserSpec>,
    #[serde(default)]
    pub collections: Vec<CollectionSpec>,
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
    /// Mixed-kind entries, tagged with `"kind"`.
    #[serde(default)]
    pub objects: Vec<ObjectSpec>,
}

impl Manifest {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| BootstrapError::Manifest(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| BootstrapError::Manifest(format!("{}: {e}", path.display())))?;
        Self::parse(&text)
    }

    /// Flatten into declaration order, filling default databases and
    /// rejecting duplicate declarations.
    pub fn into_specs(self) -> Result<Vec<ObjectSpec>> {
        let mut specs: Vec<ObjectSpec> = self
            .users
            .into_iter()
            .map(ObjectSpec::User)
            .chain(self.collections.into_iter().map(ObjectSpec::Collection))
            .chain(self.indexes.into_iter().map(ObjectSpec::Index))
            .chain(self.objects)
            .collect();

        let mut seen = HashSet::new();
        for spec in &mut specs {
            if spec.database_mut().is_empty() {
                let default = self.database.clone().ok_or_else(|| {
                    BootstrapError::Manifest(format!(
                        "{} '{}' has no database and the manifest declares no default",
                        spec.kind(),
                        spec.display_name()
                    ))
                })?;
                *spec.database_mut() = default;
            }
            if !seen.insert((spec.kind(), spec.display_name())) {
                return Err(BootstrapError::Manifest(format!(
                    "{} '{}' is declared more than once",
                    spec.kind(),
                    spec.display_name()
                )));
            }
        }

        info!(
            version = self.version.as_deref().unwrap_or("unversioned"),
            objects = specs.len(),
            "manifest loaded"
        );
        Ok(specs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Local sled store (development)
    Embedded,
    Mongodb,
}

#[derive(Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// Database backend to bootstrap
    #[arg(long, value_enum, env = "BOOTSTRAP_BACKEND", default_value_t = Backend::Embedded)]
    pub backend: Backend,

    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub uri: String,

    /// Directory of the embedded store
    #[arg(long, env = "BOOTSTRAP_DATA_DIR", default_value = "bootstrap_data")]
    pub data_dir: PathBuf,

    /// Administrative user to authenticate as (MongoDB)
    #[arg(long, env = "BOOTSTRAP_ADMIN_USER")]
    pub admin_user: Option<String>,

    /// Environment variable holding the admin password
    #[arg(long, env = "BOOTSTRAP_ADMIN_PASSWORD_VAR", default_value = ROOT_PASSWORD_VAR)]
    pub admin_password_var: String,

    /// Refuse insecure default passwords
    #[arg(long, env = "BOOTSTRAP_PRODUCTION")]
    pub production: bool,

    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// Bound on each object's apply call
    #[arg(long, default_value_t = 5)]
    pub apply_timeout_secs: u64,
}

impl ConnectionArgs {
    pub fn connection_config(&self) -> ConnectionConfig {
        let target = match self.backend {
            Backend::Embedded => Target::Embedded {
                path: self.data_dir.clone(),
            },
            Backend::Mongodb => Target::MongoDb {
                uri: self.uri.clone(),
            },
        };
        let credentials = self.admin_user.as_ref().map(|username| AdminCredentials {
            username: username.clone(),
            password: PasswordRef::Env {
                var: self.admin_password_var.clone(),
                insecure_default: Some(INSECURE_DEFAULT_PASSWORD.to_string()),
            },
        });
        ConnectionConfig {
            target,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            credentials,
            hash_cost: None,
        }
    }

    pub fn apply_policy(&self) -> ApplyPolicy {
        ApplyPolicy {
            apply_timeout: Duration::from_secs(self.apply_timeout_secs),
            production: self.production,
        }
    }
}
