use super::{ContextId, SchemaVersion, Version};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    /// Invalid or contradictory open options, or process-wide state changed too late.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Handle for '{}' belongs to {owner} but was used from {current}", .path.display())]
    ThreadConfinement {
        path: PathBuf,
        owner: ContextId,
        current: ContextId,
    },

    #[error("Transaction state error on '{}': {message}", .path.display())]
    TransactionState { path: PathBuf, message: String },

    #[error(
        "Migration of '{}' declared schema version {declared} which does not move forward from {on_disk} (expected {expected})",
        .path.display()
    )]
    MigrationOrder {
        path: PathBuf,
        on_disk: SchemaVersion,
        declared: SchemaVersion,
        expected: SchemaVersion,
    },

    #[error(
        "Schema integrity error on '{}' (on disk {on_disk:?}, expected {expected}): {message}",
        .path.display()
    )]
    SchemaIntegrity {
        path: PathBuf,
        on_disk: Option<SchemaVersion>,
        expected: SchemaVersion,
        message: String,
    },

    #[error("Integrity error on '{}' reaching {attempted}: {message}", .path.display())]
    Integrity {
        path: PathBuf,
        attempted: Version,
        message: String,
    },

    #[error("Object {class}#{id} not found at {version}")]
    ObjectNotFound {
        class: String,
        id: u64,
        version: Version,
    },

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

impl DbError {
    pub(crate) fn transaction_state(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::TransactionState {
            path: path.into(),
            message: message.into(),
        }
    }

    pub(crate) fn integrity(
        path: impl Into<PathBuf>,
        attempted: Version,
        message: impl Into<String>,
    ) -> Self {
        Self::Integrity {
            path: path.into(),
            attempted,
            message: message.into(),
        }
    }

    /// Whether retrying the operation on the same handle can succeed.
    ///
    /// Integrity failures describe the file itself and are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Integrity { .. })
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for DbError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for DbError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
