//! Bootstrap engine: applies declared users, collections and indexes to a
//! connected database, one [`ApplyResult`] per object.
//!
//! Every object goes `pending -> checked -> {created, already-exists,
//! conflict, failed}`. The `checked` step always reads the database's own
//! metadata; create errors are never used to detect existence.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::admin::{CollectionInfo, DocumentAdmin, IndexInfo};
use crate::auth::SecretResolver;
use crate::error::{BootstrapError, Result};
use crate::models::{
    ApplyResult, CollectionSpec, FailureKind, IndexOptions, IndexSpec, ObjectKind, ObjectSpec,
    Outcome, RoleGrant, UserSpec,
};
use crate::validation::json_equivalent;

#[derive(Debug, Clone, Copy)]
pub struct ApplyPolicy {
    /// Bound on each single object's check + create.
    pub apply_timeout: Duration,
    /// Refuse insecure default passwords.
    pub production: bool,
}

impl Default for ApplyPolicy {
    fn default() -> Self {
        Self {
            apply_timeout: Duration::from_secs(5),
            production: false,
        }
    }
}

/// Terminal state reached after the metadata check.
struct Applied {
    outcome: Outcome,
    detail: Option<String>,
}

impl Applied {
    fn created() -> Self {
        Self {
            outcome: Outcome::Created,
            detail: None,
        }
    }

    fn already_exists() -> Self {
        Self {
            outcome: Outcome::AlreadyExists,
            detail: None,
        }
    }

    fn conflict(detail: String) -> Self {
        Self {
            outcome: Outcome::Conflict,
            detail: Some(detail),
        }
    }
}

pub struct Bootstrapper<'a> {
    admin: &'a dyn DocumentAdmin,
    secrets: SecretResolver,
    policy: ApplyPolicy,
}

fn same_roles(existing: &[RoleGrant], declared: &[RoleGrant]) -> bool {
    let mut a = existing.to_vec();
    let mut b = declared.to_vec();
    a.sort();
    a.dedup();
    b.sort();
    b.dedup();
    a == b
}

fn describe_roles(roles: &[RoleGrant]) -> String {
    let names: Vec<String> = roles.iter().map(ToString::to_string).collect();
    format!("[{}]", names.join(", "))
}

/// Why an existing collection does not match its declaration, if it doesn't.
fn collection_mismatch(existing: &CollectionInfo, spec: &CollectionSpec) -> Option<String> {
    let declared = spec.validator.as_ref()?;
    match &existing.validator {
        None => return Some("existing collection has no validator".to_string()),
        Some(current) if !json_equivalent(current, declared) => {
            return Some("existing validator differs from declared validator".to_string())
        }
        Some(_) => {}
    }
    let level = existing.validation_level.unwrap_or_default();
    if level != spec.validation_level {
        return Some(format!(
            "existing validation level '{}' differs from declared '{}'",
            level.as_str(),
            spec.validation_level.as_str()
        ));
    }
    let action = existing.validation_action.unwrap_or_default();
    if action != spec.validation_action {
        return Some(format!(
            "existing validation action '{}' differs from declared '{}'",
            action.as_str(),
            spec.validation_action.as_str()
        ));
    }
    None
}

impl<'a> Bootstrapper<'a> {
    pub fn new(admin: &'a dyn DocumentAdmin, policy: ApplyPolicy) -> Self {
        Self {
            admin,
            secrets: SecretResolver::new(policy.production),
            policy,
        }
    }

    /// Apply every spec: users first, then collections, then indexes, keeping
    /// declaration order within each kind. Failures never stop the run.
    pub async fn run(&self, specs: &[ObjectSpec]) -> Vec<ApplyResult> {
        let run_id = Uuid::new_v4();
        let span = info_span!("bootstrap", %run_id, backend = self.admin.backend_name());
        async {
            let mut ordered: Vec<&ObjectSpec> = specs.iter().collect();
            ordered.sort_by_key(|spec| spec.kind().rank());
            info!(objects = ordered.len(), "applying specs");

            let mut results = Vec::with_capacity(ordered.len());
            for spec in ordered {
                results.push(self.apply(spec).await);
            }
            results
        }
        .instrument(span)
        .await
    }

    pub async fn apply(&self, spec: &ObjectSpec) -> ApplyResult {
        match spec {
            ObjectSpec::User(user) => self.apply_user(user).await,
            ObjectSpec::Collection(collection) => self.apply_collection(collection).await,
            ObjectSpec::Index(index) => self.apply_index(index).await,
        }
    }

    pub async fn apply_user(&self, spec: &UserSpec) -> ApplyResult {
        let name = format!("{}@{}", spec.name, spec.database);
        self.bounded(ObjectKind::User, name, self.ensure_user(spec))
            .await
    }

    pub async fn apply_collection(&self, spec: &CollectionSpec) -> ApplyResult {
        let name = format!("{}.{}", spec.database, spec.name);
        self.bounded(ObjectKind::Collection, name, self.ensure_collection(spec))
            .await
    }

    pub async fn apply_index(&self, spec: &IndexSpec) -> ApplyResult {
        let name = format!(
            "{}.{}.{}",
            spec.database,
            spec.collection,
            spec.effective_name()
        );
        self.bounded(ObjectKind::Index, name, self.ensure_index(spec))
            .await
    }

    async fn bounded(
        &self,
        kind: ObjectKind,
        name: String,
        work: impl Future<Output = Result<Applied>>,
    ) -> ApplyResult {
        debug!(%kind, object = %name, state = "pending");
        let result = match tokio::time::timeout(self.policy.apply_timeout, work).await {
            Ok(Ok(applied)) => {
                let result = ApplyResult::new(kind, name, applied.outcome);
                match applied.detail {
                    Some(detail) => result.with_detail(detail),
                    None => result,
                }
            }
            Ok(Err(err)) => ApplyResult::failed(kind, name, &err),
            Err(_) => ApplyResult::new(kind, name, Outcome::Failed(FailureKind::Timeout))
                .with_detail(format!(
                    "no acknowledgement within {:?}",
                    self.policy.apply_timeout
                )),
        };

        if result.outcome.is_success() {
            info!(%kind, object = %result.name, outcome = %result.outcome, "applied");
        } else {
            warn!(
                %kind,
                object = %result.name,
                outcome = %result.outcome,
                detail = result.detail.as_deref().unwrap_or(""),
                "not applied"
            );
        }
        result
    }

    async fn ensure_user(&self, spec: &UserSpec) -> Result<Applied> {
        if spec.name.is_empty() || spec.database.is_empty() {
            return Err(BootstrapError::InvalidSpec(
                "user needs a name and a database".to_string(),
            ));
        }
        // Resolved even when the user exists, so a broken reference is always reported.
        let password = self.secrets.resolve(&spec.password, &spec.name)?;

        let users = self.admin.list_users(&spec.database).await?;
        debug!(user = %spec.name, state = "checked");
        if let Some(existing) = users.iter().find(|u| u.name == spec.name) {
            if same_roles(&existing.roles, &spec.roles) {
                return Ok(Applied::already_exists());
            }
            return Ok(Applied::conflict(format!(
                "existing roles {} differ from declared {}",
                describe_roles(&existing.roles),
                describe_roles(&spec.roles)
            )));
        }

        self.admin.create_user(spec, &password).await?;
        Ok(Applied::created())
    }

    async fn ensure_collection(&self, spec: &CollectionSpec) -> Result<Applied> {
        if spec.name.is_empty() || spec.database.is_empty() {
            return Err(BootstrapError::InvalidSpec(
                "collection needs a name and a database".to_string(),
            ));
        }
        if let Some(validator) = &spec.validator {
            if !validator.is_object() {
                return Err(BootstrapError::InvalidSpec(
                    "validator must be a document".to_string(),
                ));
            }
        }

        let collections = self.admin.list_collections(&spec.database).await?;
        debug!(collection = %spec.name, state = "checked");
        if let Some(existing) = collections.iter().find(|c| c.name == spec.name) {
            return Ok(match collection_mismatch(existing, spec) {
                Some(reason) => Applied::conflict(reason),
                None => Applied::already_exists(),
            });
        }

        self.admin.create_collection(spec).await?;
        Ok(Applied::created())
    }

    /// Put back a dropped index after its replacement failed to build.
    async fn restore_index(
        &self,
        spec: &IndexSpec,
        previous: &IndexInfo,
        err: BootstrapError,
    ) -> Applied {
        let restore = IndexSpec {
            database: spec.database.clone(),
            collection: spec.collection.clone(),
            keys: previous.keys.clone(),
            options: IndexOptions {
                name: Some(previous.name.clone()),
                unique: previous.unique,
                expire_after_seconds: previous.expire_after_seconds,
            },
            replace: false,
        };
        let detail = match self.admin.create_index(&restore).await {
            Ok(()) => {
                warn!(index = %previous.name, "replacement failed, previous definition restored");
                format!("{err}; previous definition restored")
            }
            Err(restore_err) => {
                warn!(
                    index = %previous.name,
                    error = %restore_err,
                    "replacement failed and index could not be restored"
                );
                format!("{err}; previous definition could not be restored: {restore_err}")
            }
        };
        Applied {
            outcome: Outcome::Failed(FailureKind::from_error(&err)),
            detail: Some(detail),
        }
    }

    async fn ensure_index(&self, spec: &IndexSpec) -> Result<Applied> {
        if spec.collection.is_empty() || spec.database.is_empty() {
            return Err(BootstrapError::InvalidSpec(
                "index needs a collection and a database".to_string(),
            ));
        }
        let name = spec.effective_name();

        let indexes = self
            .admin
            .list_indexes(&spec.database, &spec.collection)
            .await?;
        debug!(index = %name, state = "checked");

        if let Some(existing) = indexes.iter().find(|i| i.name == name) {
            if existing.keys.same_pattern(&spec.keys) && existing.same_options(spec) {
                return Ok(Applied::already_exists());
            }
            if !spec.replace {
                return Ok(Applied::conflict(format!(
                    "index '{name}' exists with key pattern {} (unique: {}, ttl: {:?}), declared {} (unique: {}, ttl: {:?})",
                    existing.keys,
                    existing.unique,
                    existing.expire_after_seconds,
                    spec.keys,
                    spec.options.unique,
                    spec.options.expire_after_seconds
                )));
            }
            info!(index = %name, "replacing index with differing definition");
            self.admin
                .drop_index(&spec.database, &spec.collection, &name)
                .await?;
            if let Err(err) = self.admin.create_index(spec).await {
                return Ok(self.restore_index(spec, existing, err).await);
            }
            return Ok(Applied {
                outcome: Outcome::Created,
                detail: Some("replaced existing index".to_string()),
            });
        }

        if let Some(existing) = indexes.iter().find(|i| i.keys.same_pattern(&spec.keys)) {
            if existing.same_options(spec) {
                return Ok(Applied {
                    outcome: Outcome::AlreadyExists,
                    detail: Some(format!("present as '{}'", existing.name)),
                });
            }
            return Ok(Applied::conflict(format!(
                "key pattern {} already indexed as '{}' with different options",
                spec.keys, existing.name
            )));
        }

        self.admin.create_index(spec).await?;
        Ok(Applied::created())
    }
}
