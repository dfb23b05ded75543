/*
    errors.rs - Error types for the database engine

    Version races are not errors: the losing writer gets `Ok(false)`.
    Everything here is either a programmer error (schema misuse, kind
    mismatch), a disabled rollout gate, or a failure from the storage
    layer underneath.
*/

use crate::core_crdt::errors::CrdtError;
use thiserror::Error;

/// Errors that can occur in the database engine
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// A write named a schema hash the registry has never seen
    #[error("no schema registered for hash '{0}'")]
    NoSuchSchema(String),

    /// A field value's shape disagrees with the schema declaration
    #[error("field '{field}' expects {expected}, got {actual}")]
    FieldMismatch {
        field: String,
        expected: String,
        actual: String,
    },

    /// A write carried a field the schema does not declare
    #[error("schema does not declare field '{0}'")]
    UnknownField(String),

    /// A typed read found data of a different kind at the key
    #[error("data at '{key}' is {actual}, expected {expected}")]
    UnexpectedKind {
        key: String,
        expected: String,
        actual: String,
    },

    /// The operation is behind a disabled feature flag
    #[error("feature '{0}' is disabled")]
    FeatureDisabled(String),

    /// The operation is not legal for this key
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// A malformed storage key
    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    /// SQLite failure
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Connection pool failure
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Version map (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Divergent CRDT state surfaced by the storage layer
    #[error("CRDT error: {0}")]
    Crdt(#[from] CrdtError),

    /// Invariant violation inside the engine
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<crate::core_data::storage_key::StorageKeyError> for DatabaseError {
    fn from(err: crate::core_data::storage_key::StorageKeyError) -> Self {
        DatabaseError::InvalidKey(err.to_string())
    }
}

/// Result alias for database operations
pub type DatabaseResult<T> = Result<T, DatabaseError>;
