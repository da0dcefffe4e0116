use std::fmt;

use bcrypt::{hash, verify};
use tracing::warn;

use crate::error::{BootstrapError, Result};
use crate::models::PasswordRef;

/// Fallback used by development setups when the root password variable is unset.
/// Never accepted in production mode.
pub const INSECURE_DEFAULT_PASSWORD: &str = "change-me";

/// Environment variable the root/admin password is read from.
pub const ROOT_PASSWORD_VAR: &str = "MONGO_INITDB_ROOT_PASSWORD";

/// Cheapest bcrypt cost, for tests that hash passwords.
#[cfg(test)]
pub(crate) const TEST_HASH_COST: u32 = 4;

/// A resolved password. Debug output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Resolves password references at apply time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecretResolver {
    production: bool,
}

impl SecretResolver {
    pub fn new(production: bool) -> Self {
        Self { production }
    }

    /// `owner` names the account the password belongs to, for messages only.
    pub fn resolve(&self, reference: &PasswordRef, owner: &str) -> Result<Secret> {
        match reference {
            PasswordRef::Env {
                var,
                insecure_default,
            } => match std::env::var(var) {
                Ok(value) if !value.is_empty() => Ok(Secret(value)),
                _ => match insecure_default {
                    Some(_) if self.production => {
                        Err(BootstrapError::InsecureDefault(owner.to_string()))
                    }
                    Some(fallback) => {
                        warn!(
                            owner,
                            var = var.as_str(),
                            "password variable unset, using insecure default (development only)"
                        );
                        Ok(Secret(fallback.clone()))
                    }
                    None => Err(BootstrapError::Secret(format!(
                        "environment variable {var} is not set for {owner}"
                    ))),
                },
            },
            PasswordRef::File { path } => {
                let contents = std::fs::read_to_string(path).map_err(|e| {
                    BootstrapError::Secret(format!(
                        "cannot read secret file {} for {owner}: {e}",
                        path.display()
                    ))
                })?;
                let value = contents.trim_end_matches(['\r', '\n']);
                if value.is_empty() {
                    return Err(BootstrapError::Secret(format!(
                        "secret file {} for {owner} is empty",
                        path.display()
                    )));
                }
                Ok(Secret(value.to_string()))
            }
        }
    }
}

pub fn hash_password_with_cost(password: &Secret, cost: u32) -> Result<String> {
    Ok(hash(password.expose(), cost)?)
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    Ok(verify(password, hash)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_env_reference_resolves() {
        std::env::set_var("DOC_BOOTSTRAP_TEST_PW_SET", "s3cret");
        let reference = PasswordRef::Env {
            var: "DOC_BOOTSTRAP_TEST_PW_SET".into(),
            insecure_default: Some("change-me".into()),
        };
        let secret = SecretResolver::new(true).resolve(&reference, "svc").unwrap();
        assert_eq!(secret.expose(), "s3cret");
        assert_eq!(format!("{secret:?}"), "Secret(***)");
    }

    #[test]
    fn test_insecure_default_only_outside_production() {
        let reference = PasswordRef::Env {
            var: "DOC_BOOTSTRAP_TEST_PW_UNSET".into(),
            insecure_default: Some(INSECURE_DEFAULT_PASSWORD.into()),
        };

        let dev = SecretResolver::new(false).resolve(&reference, "n8n_admin").unwrap();
        assert_eq!(dev.expose(), INSECURE_DEFAULT_PASSWORD);

        let err = SecretResolver::new(true)
            .resolve(&reference, "n8n_admin")
            .unwrap_err();
        assert!(matches!(err, BootstrapError::InsecureDefault(owner) if owner == "n8n_admin"));
    }

    #[test]
    fn test_missing_env_without_default_fails() {
        let reference = PasswordRef::Env {
            var: "DOC_BOOTSTRAP_TEST_PW_MISSING".into(),
            insecure_default: None,
        };
        let err = SecretResolver::default().resolve(&reference, "svc").unwrap_err();
        assert!(matches!(err, BootstrapError::Secret(_)));
    }

    #[test]
    fn test_file_reference_strips_newline() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "from-file").unwrap();
        let reference = PasswordRef::File {
            path: file.path().to_path_buf(),
        };
        let secret = SecretResolver::default().resolve(&reference, "svc").unwrap();
        assert_eq!(secret.expose(), "from-file");
    }

    #[test]
    fn test_hash_and_verify() {
        let secret = Secret::new("pw");
        let hashed = hash_password_with_cost(&secret, TEST_HASH_COST).unwrap();
        assert!(verify_password("pw", &hashed).unwrap());
        assert!(!verify_password("other", &hashed).unwrap());
    }
}
