use thiserror::Error;
use uuid::Uuid;

use common::Version;
use domain::{ErrorKind, StepError};

/// Errors that can occur when interacting with the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The version-conditioned update matched no row although the
    /// aggregate exists: a concurrent writer got there first.
    #[error("version conflict on {aggregate} {id}: expected version {expected}")]
    VersionConflict {
        aggregate: &'static str,
        id: Uuid,
        expected: Version,
    },

    /// The referenced aggregate does not exist.
    #[error("{aggregate} {id} not found")]
    NotFound { aggregate: &'static str, id: Uuid },

    /// A database error occurred.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value failed a domain invariant when loaded.
    #[error("corrupt stored record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Classifies the error for the saga's retry and compensation
    /// decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::VersionConflict { .. } => ErrorKind::Conflict,
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::Database(_) | StoreError::Migration(_) => ErrorKind::Transient,
            StoreError::Serialization(_) | StoreError::Corrupt(_) => ErrorKind::Fatal,
        }
    }
}

impl From<StoreError> for StepError {
    fn from(err: StoreError) -> Self {
        StepError::new(err.kind(), err.to_string())
    }
}

impl From<domain::DomainError> for StoreError {
    fn from(err: domain::DomainError) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
