//! Transaction error types.

use thiserror::Error;

use crate::storage::StorageError;
use crate::transaction::handle::BackendKind;

/// Result type for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// SQLSTATE reported by relational engines for a serialization failure.
pub const SERIALIZATION_FAILURE_SQLSTATE: &str = "40001";

/// Errors that can occur during transaction operations.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// A `Mandatory` scope was entered with no transaction in context.
    #[error("illegal transaction state: {0}")]
    IllegalTransactionState(String),

    /// A propagation level that is not one of the supported ones.
    #[error("unknown propagation level: {0}")]
    UnknownPropagationLevel(String),

    /// A caller-supplied transaction belongs to a different backend.
    #[error("foreign transaction: expected a {expected} transaction, got a {found} transaction")]
    ForeignTransaction {
        expected: BackendKind,
        found: BackendKind,
    },

    /// Context query with no open scope for the manager.
    #[error("no active transaction for manager \"{manager}\"")]
    NoActiveTransaction { manager: String },

    /// No manager registered under the requested name.
    #[error("no transaction manager registered as \"{0}\"")]
    ManagerNotRegistered(String),

    /// Transaction was already committed or rolled back.
    #[error("transaction {tx_id} is no longer active (state: {state})")]
    NotActive { tx_id: String, state: String },

    /// Serialization failure - the transaction lost a race and may be retried.
    #[error("serialization failure in transaction {tx_id}, conflicting rows: {}", conflicts_display(.conflicts))]
    SerializationFailure {
        tx_id: String,
        conflicts: Vec<String>,
    },

    /// Error reported by an external database adapter.
    #[error("database error{}: {message}", sqlstate_display(.sqlstate))]
    Database {
        sqlstate: Option<String>,
        message: String,
    },

    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Invalid manager or registry configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

fn conflicts_display(conflicts: &[String]) -> String {
    conflicts.join(", ")
}

fn sqlstate_display(sqlstate: &Option<String>) -> String {
    match sqlstate {
        Some(code) => format!(" [{}]", code),
        None => String::new(),
    }
}

impl TransactionError {
    /// SQLSTATE code carried by (or implied by) this error.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            TransactionError::SerializationFailure { .. } => Some(SERIALIZATION_FAILURE_SQLSTATE),
            TransactionError::Database { sqlstate, .. } => sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Only serialization failures are: everything else would fail the same
    /// way on a fresh attempt.
    pub fn is_retryable(&self) -> bool {
        self.sqlstate() == Some(SERIALIZATION_FAILURE_SQLSTATE)
    }

    /// Create a database error from an adapter.
    pub fn database(sqlstate: Option<&str>, message: impl Into<String>) -> Self {
        Self::Database {
            sqlstate: sqlstate.map(str::to_string),
            message: message.into(),
        }
    }
}

/// Error type a unit of work may fail with.
///
/// The manager returns the unit of work's error unchanged; it only needs a
/// way to build one from its own failures and to look inside one when
/// deciding whether to retry.
pub trait ScopeError: From<TransactionError> {
    /// The transaction error carried by this value, if any.
    fn transaction_error(&self) -> Option<&TransactionError>;
}

impl ScopeError for TransactionError {
    fn transaction_error(&self) -> Option<&TransactionError> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let conflict = TransactionError::SerializationFailure {
            tx_id: "tx001".to_string(),
            conflicts: vec!["users/123".to_string()],
        };
        assert!(conflict.is_retryable());
        assert_eq!(conflict.sqlstate(), Some("40001"));

        let not_active = TransactionError::NotActive {
            tx_id: "tx001".to_string(),
            state: "committed".to_string(),
        };
        assert!(!not_active.is_retryable());

        assert!(TransactionError::database(Some("40001"), "could not serialize access").is_retryable());
        assert!(!TransactionError::database(Some("23505"), "duplicate key").is_retryable());
        assert!(!TransactionError::database(None, "connection reset").is_retryable());
    }

    #[test]
    fn test_error_messages() {
        let err = TransactionError::database(Some("40001"), "could not serialize access");
        assert_eq!(err.to_string(), "database error [40001]: could not serialize access");

        let err = TransactionError::ForeignTransaction {
            expected: BackendKind::Document,
            found: BackendKind::Noop,
        };
        assert_eq!(
            err.to_string(),
            "foreign transaction: expected a document transaction, got a noop transaction"
        );
    }
}
