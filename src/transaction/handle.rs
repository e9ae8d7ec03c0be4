//! The transaction handle passed to units of work.
//!
//! A [`Transaction`] is a cheap, clonable reference to one in-flight backend
//! transaction. Clones share identity: two handles are equal exactly when
//! they refer to the same transaction, which is what context discovery and
//! the propagation rules compare.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::backend::{DocumentTransaction, NoopTransaction};
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::isolation::IsolationLevel;
use crate::transaction::options::UserParams;

/// Which backend a transaction belongs to.
///
/// Backends outside this crate tag their handles with
/// `External(name)`; two external kinds are the same backend exactly when
/// their names are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Noop,
    Document,
    External(&'static str),
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Noop => write!(f, "noop"),
            BackendKind::Document => write!(f, "document"),
            BackendKind::External(name) => write!(f, "{}", name),
        }
    }
}

/// Backend half of an open transaction: what the manager needs to finish it.
///
/// Commit and rollback should be best effort on a transaction that is
/// already closed. `release` is called synchronously from a destructor when
/// the unit of work is abandoned mid-flight and must not block.
#[async_trait]
pub trait BackendTransaction: fmt::Debug + Send + Sync + 'static {
    async fn commit(&self) -> TransactionResult<()>;

    async fn rollback(&self) -> TransactionResult<()>;

    fn release(&self);

    /// Concrete type access for [`Transaction::external`].
    fn as_any(&self) -> &dyn Any;
}

/// Backend-specific part of a transaction, tagged by backend.
#[derive(Debug)]
pub enum BackendHandle {
    Noop(NoopTransaction),
    Document(DocumentTransaction),
    External {
        kind: &'static str,
        tx: Box<dyn BackendTransaction>,
    },
}

impl BackendHandle {
    /// Wrap a transaction of a backend defined outside this crate.
    pub fn external(kind: &'static str, tx: impl BackendTransaction) -> Self {
        BackendHandle::External {
            kind,
            tx: Box::new(tx),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            BackendHandle::Noop(_) => BackendKind::Noop,
            BackendHandle::Document(_) => BackendKind::Document,
            BackendHandle::External { kind, .. } => BackendKind::External(*kind),
        }
    }

    /// The transaction behind the tag.
    pub fn transaction(&self) -> &dyn BackendTransaction {
        match self {
            BackendHandle::Noop(tx) => tx,
            BackendHandle::Document(tx) => tx,
            BackendHandle::External { tx, .. } => &**tx,
        }
    }
}

/// Transaction metadata recorded when the manager opens a transaction.
#[derive(Debug, Clone)]
pub struct TransactionMetadata {
    /// Unique transaction ID.
    pub tx_id: String,
    /// Name of the manager that opened the transaction.
    pub manager: String,
    /// Requested isolation level, `None` for the backend default.
    pub isolation: Option<IsolationLevel>,
    /// Backend-specific user parameters.
    pub user_params: UserParams,
    /// When the transaction started.
    pub started_at: DateTime<Utc>,
}

struct TransactionInner {
    metadata: TransactionMetadata,
    handle: BackendHandle,
}

/// Handle to an in-flight transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl Transaction {
    pub(crate) fn new(metadata: TransactionMetadata, handle: BackendHandle) -> Self {
        Self {
            inner: Arc::new(TransactionInner { metadata, handle }),
        }
    }

    /// Get the transaction ID.
    pub fn id(&self) -> &str {
        &self.inner.metadata.tx_id
    }

    /// Name of the manager that opened this transaction.
    pub fn manager(&self) -> &str {
        &self.inner.metadata.manager
    }

    pub fn kind(&self) -> BackendKind {
        self.inner.handle.kind()
    }

    /// Requested isolation level.
    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.inner.metadata.isolation
    }

    pub fn user_params(&self) -> &UserParams {
        &self.inner.metadata.user_params
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.metadata.started_at
    }

    pub fn metadata(&self) -> &TransactionMetadata {
        &self.inner.metadata
    }

    pub fn handle(&self) -> &BackendHandle {
        &self.inner.handle
    }

    /// Check whether both handles refer to the same transaction.
    pub fn ptr_eq(a: &Transaction, b: &Transaction) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Access the document store transaction.
    pub fn document(&self) -> TransactionResult<&DocumentTransaction> {
        match &self.inner.handle {
            BackendHandle::Document(tx) => Ok(tx),
            other => Err(TransactionError::ForeignTransaction {
                expected: BackendKind::Document,
                found: other.kind(),
            }),
        }
    }

    /// Access the no-op transaction.
    pub fn noop(&self) -> TransactionResult<&NoopTransaction> {
        match &self.inner.handle {
            BackendHandle::Noop(tx) => Ok(tx),
            other => Err(TransactionError::ForeignTransaction {
                expected: BackendKind::Noop,
                found: other.kind(),
            }),
        }
    }

    /// Access the transaction of an external backend registered as `kind`.
    pub fn external<T: BackendTransaction>(&self, kind: &'static str) -> TransactionResult<&T> {
        let expected = BackendKind::External(kind);
        let foreign = || TransactionError::ForeignTransaction {
            expected,
            found: self.kind(),
        };
        match &self.inner.handle {
            BackendHandle::External { kind: found, tx } if *found == kind => {
                tx.as_any().downcast_ref::<T>().ok_or_else(foreign)
            }
            _ => Err(foreign()),
        }
    }

    /// Commit the transaction.
    ///
    /// Transactions opened by a manager are committed by that manager when
    /// the unit of work succeeds; call this only on transactions obtained
    /// from [`TransactionManager::begin`](crate::transaction::TransactionManager::begin).
    pub async fn commit(&self) -> TransactionResult<()> {
        self.inner.handle.transaction().commit().await
    }

    /// Roll the transaction back. A no-op on a transaction that is already
    /// closed.
    pub async fn rollback(&self) -> TransactionResult<()> {
        self.inner.handle.transaction().rollback().await
    }

    /// Synchronous best-effort rollback for transactions abandoned mid-flight.
    pub(crate) fn release(&self) {
        self.inner.handle.transaction().release()
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        Transaction::ptr_eq(self, other)
    }
}

impl Eq for Transaction {}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("manager", &self.manager())
            .field("kind", &self.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NoopBackend;

    fn metadata(tx_id: &str) -> TransactionMetadata {
        TransactionMetadata {
            tx_id: tx_id.to_string(),
            manager: "default".to_string(),
            isolation: None,
            user_params: UserParams::new(),
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_identity_equality() {
        let backend = NoopBackend::new();
        let tx = Transaction::new(metadata("tx001"), BackendHandle::Noop(backend.transaction()));
        let same = tx.clone();
        let other = Transaction::new(metadata("tx001"), BackendHandle::Noop(backend.transaction()));

        assert_eq!(tx, same);
        assert!(Transaction::ptr_eq(&tx, &same));
        assert_ne!(tx, other);
    }

    #[test]
    fn test_backend_access_checks_kind() {
        let backend = NoopBackend::new();
        let tx = Transaction::new(metadata("tx001"), BackendHandle::Noop(backend.transaction()));

        assert!(tx.noop().is_ok());
        assert!(matches!(
            tx.document(),
            Err(TransactionError::ForeignTransaction {
                expected: BackendKind::Document,
                found: BackendKind::Noop,
            })
        ));
    }

    #[derive(Debug, Default)]
    struct Recording {
        committed: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl BackendTransaction for Recording {
        async fn commit(&self) -> TransactionResult<()> {
            self.committed.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        async fn rollback(&self) -> TransactionResult<()> {
            Ok(())
        }

        fn release(&self) {}

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[tokio::test]
    async fn test_external_handle_dispatch() {
        let tx = Transaction::new(
            metadata("tx001"),
            BackendHandle::external("recording", Recording::default()),
        );
        assert_eq!(tx.kind(), BackendKind::External("recording"));
        assert_eq!(tx.kind().to_string(), "recording");

        tx.commit().await.unwrap();
        let recording = tx.external::<Recording>("recording").unwrap();
        assert!(recording.committed.load(std::sync::atomic::Ordering::SeqCst));

        assert!(matches!(
            tx.external::<Recording>("ledger"),
            Err(TransactionError::ForeignTransaction {
                expected: BackendKind::External("ledger"),
                found: BackendKind::External("recording"),
            })
        ));
        assert!(matches!(
            tx.document(),
            Err(TransactionError::ForeignTransaction {
                expected: BackendKind::Document,
                found: BackendKind::External("recording"),
            })
        ));
    }
}
