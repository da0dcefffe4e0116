use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Invalid specification: {0}")]
    InvalidSpec(String),

    #[error("Document rejected by validator: {0}")]
    DocumentRejected(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Secret error: {0}")]
    Secret(String),

    #[error("Refusing insecure default password for {0} in production mode")]
    InsecureDefault(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Password hashing error: {0}")]
    Hash(#[from] bcrypt::BcryptError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BootstrapError {
    /// Errors that make the whole run pointless rather than one object.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::ConnectTimeout(_))
    }
}

pub type Result<T> = std::result::Result<T, BootstrapError>;
