//! Embedded document store used by the document backend.
//!
//! Tables are named collections of JSON documents keyed by [`RowKey`].
//! The store itself knows nothing about transactions: it keeps versioned,
//! immutable snapshots of committed state and applies validated change sets.
//! Buffering, isolation and commit validation policy live in
//! [`DocumentTransaction`](crate::backend::DocumentTransaction).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      DocumentStore                          │
//! │   (latest Snapshot, commit lock, optional JSON file)        │
//! └─────────────────────────────────────────────────────────────┘
//!                │                               │
//!                ▼                               ▼
//!         ┌─────────────┐                 ┌─────────────┐
//!         │  Snapshot   │                 │  ChangeSet  │
//!         │ (versioned  │                 │  (writes +  │
//!         │   tables)   │                 │ validation) │
//!         └─────────────┘                 └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use txscope::storage::{ChangeSet, DocumentStore, RowKey, RowPath, TableName};
//!
//! let store = DocumentStore::open("./accounts.json")?;
//!
//! let mut changes = ChangeSet::new(store.version());
//! let path = RowPath::new(TableName::new("accounts")?, RowKey::generate());
//! changes.writes.insert(path, Some(document));
//! store.apply(changes)?;
//! ```

mod error;
mod store;
mod types;

pub use error::{StorageError, StorageResult};
pub use store::{ChangeSet, DocumentStore, RowExpectation, Snapshot};
pub use types::{Document, InvalidNameError, RowKey, RowPath, TableName};
