//! txscope - declarative transaction scopes for async Rust
//!
//! Units of work declare how they relate to transactions (`Required`,
//! `Mandatory`, `RequiresNew`) and the crate decides whether to open a new
//! transaction or join the one already active in the current call chain.
//! New transactions are committed on success, rolled back on failure, and
//! retried on serialization conflicts.
//!
//! # Example
//!
//! ```ignore
//! use txscope::backend::DocumentBackend;
//! use txscope::storage::{DocumentStore, RowKey, TableName};
//! use txscope::transaction::{ManagerConfig, ManagerRegistry, TransactionManager, Transactional};
//!
//! let mut registry = ManagerRegistry::new();
//! registry.register(TransactionManager::new(
//!     "default",
//!     DocumentBackend::new(DocumentStore::open("./data.json")?),
//!     ManagerConfig::new().retries(3),
//! ));
//!
//! let users = TableName::new("users")?;
//! Transactional::required()
//!     .run(&registry, |tx| {
//!         let users = users.clone();
//!         async move {
//!             tx.document()?.insert(&users, RowKey::generate(), row)?;
//!             Ok::<_, txscope::TransactionError>(())
//!         }
//!     })
//!     .await?;
//! ```

pub mod backend;
pub mod storage;
pub mod transaction;

pub use transaction::{
    get_current_transaction, get_current_transaction_for, ManagerRegistry, Propagation,
    ScopeError, Transaction, TransactionError, TransactionManager, TransactionResult,
    Transactional,
};
