//! Storage layer error types

use std::path::PathBuf;

use thiserror::Error;

use crate::storage::types::{InvalidNameError, RowKey, TableName};

/// the main error type for document store operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// the requested row was not found
    #[error("row not found: table={table}, key={key}")]
    RowNotFound { table: TableName, key: RowKey },

    /// the row already exists (duplicate primary key)
    #[error("row already exists: table={table}, key={key}")]
    RowAlreadyExists { table: TableName, key: RowKey },

    /// rows written by another transaction since this one started
    #[error("write conflict on: {}", paths_display(.paths))]
    Conflict { paths: Vec<String> },

    /// invalid table name or row key
    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// the persisted snapshot could not be read back
    #[error("corrupted data at {path}: {reason}")]
    CorruptedData { path: PathBuf, reason: String },

    /// I/O error (filesystem level)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn paths_display(paths: &[String]) -> String {
    paths.join(", ")
}

impl StorageError {
    /// check if this error indicates the resource doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::RowNotFound { .. })
    }

    /// check if this error is a commit-time conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict { .. })
    }

    /// check if this error is a duplicate key
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StorageError::RowAlreadyExists { .. })
    }
}

/// result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
