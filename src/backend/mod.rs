//! Backend adapters.
//!
//! Each backend implements [`TransactionBackend`](crate::transaction::TransactionBackend)
//! and opens handles of its own [`BackendKind`](crate::transaction::BackendKind),
//! whose transactions implement
//! [`BackendTransaction`](crate::transaction::BackendTransaction). Backends
//! defined in other crates follow the same contract and wrap their
//! transactions in [`BackendHandle::External`](crate::transaction::BackendHandle::External).

mod document;
mod noop;

pub use document::{DocumentBackend, DocumentTransaction};
pub use noop::{NoopBackend, NoopStats, NoopTransaction};
