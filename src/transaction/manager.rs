//! Transaction manager - runs units of work inside backend transactions.
//!
//! The TransactionManager is the only place transactions are opened,
//! committed and rolled back. It handles:
//! - Opening a transaction with the effective isolation level and parameters
//! - Committing on success and rolling back on failure
//! - Retrying the whole unit of work on a retriable conflict
//! - Releasing transactions whose future is dropped mid-flight

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use ulid::Ulid;

use crate::transaction::error::{ScopeError, TransactionError, TransactionResult};
use crate::transaction::handle::{
    BackendHandle, BackendKind, BackendTransaction, Transaction, TransactionMetadata,
};
use crate::transaction::isolation::IsolationLevel;
use crate::transaction::options::{ManagerConfig, TransactionOptions};

/// Adapter contract a database backend implements.
///
/// `open` returns a [`BackendHandle`] whose transaction implements
/// [`BackendTransaction`](crate::transaction::BackendTransaction); the manager
/// commits and rolls back through that trait. Backends outside this crate
/// return [`BackendHandle::External`] tagged with their
/// [`BackendKind::External`] name.
#[async_trait]
pub trait TransactionBackend: Send + Sync + 'static {
    /// Tag carried by every handle this backend opens.
    fn kind(&self) -> BackendKind;

    /// Start a backend transaction.
    async fn open(
        &self,
        tx_id: &str,
        isolation: Option<IsolationLevel>,
    ) -> TransactionResult<BackendHandle>;

    /// Whether a failure may succeed if the transaction is retried from scratch.
    fn is_retriable(&self, error: &TransactionError) -> bool {
        error.is_retryable()
    }
}

/// Rolls back a transaction whose unit of work never reached an outcome,
/// e.g. because the surrounding future was dropped.
struct ReleaseOnDrop {
    tx: Option<Transaction>,
}

impl ReleaseOnDrop {
    fn new(tx: Transaction) -> Self {
        Self { tx: Some(tx) }
    }

    fn disarm(&mut self) {
        self.tx = None;
    }
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            log::warn!(
                "manager '{}': transaction {} abandoned while open, rolling back",
                tx.manager(),
                tx.id()
            );
            tx.release();
        }
    }
}

struct TransactionManagerInner {
    /// Name the manager is registered under.
    name: String,
    backend: Arc<dyn TransactionBackend>,
    config: ManagerConfig,
}

/// Transaction manager for one backend.
///
/// Thread-safe: can be shared across threads via Clone (uses Arc internally).
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<TransactionManagerInner>,
}

impl TransactionManager {
    /// Create a manager over the given backend.
    pub fn new(
        name: impl Into<String>,
        backend: impl TransactionBackend,
        config: ManagerConfig,
    ) -> Self {
        Self::from_arc(name, Arc::new(backend), config)
    }

    /// Create a manager over a shared backend.
    pub fn from_arc(
        name: impl Into<String>,
        backend: Arc<dyn TransactionBackend>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(TransactionManagerInner {
                name: name.into(),
                backend,
                config,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Backend kind this manager opens transactions for.
    pub fn kind(&self) -> BackendKind {
        self.inner.backend.kind()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Fail with `ForeignTransaction` unless `tx` belongs to this manager's backend.
    pub fn check_kind(&self, tx: &Transaction) -> TransactionResult<()> {
        let expected = self.kind();
        if tx.kind() != expected {
            return Err(TransactionError::ForeignTransaction {
                expected,
                found: tx.kind(),
            });
        }
        Ok(())
    }

    /// Open a new transaction. The caller owns its commit or rollback.
    pub async fn begin(&self, options: &TransactionOptions) -> TransactionResult<Transaction> {
        let config = &self.inner.config;
        let isolation = options.effective_isolation(config);
        let tx_id = Ulid::new().to_string().to_lowercase();

        let handle = self.inner.backend.open(&tx_id, isolation).await?;
        if handle.kind() != self.kind() {
            handle.transaction().release();
            return Err(TransactionError::ForeignTransaction {
                expected: self.kind(),
                found: handle.kind(),
            });
        }
        log::debug!(
            "manager '{}': opened transaction {} ({})",
            self.inner.name,
            tx_id,
            isolation.map_or("backend default", |level| level.as_str())
        );

        let metadata = TransactionMetadata {
            tx_id,
            manager: self.inner.name.clone(),
            isolation,
            user_params: options.effective_user_params(config),
            started_at: Utc::now(),
        };
        Ok(Transaction::new(metadata, handle))
    }

    /// Execute a unit of work within a transaction, committing on success and
    /// rolling back on failure.
    pub async fn with_transaction<T, E, F, Fut>(&self, work: F) -> Result<T, E>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ScopeError,
    {
        self.with_transaction_options(&TransactionOptions::default(), work)
            .await
    }

    /// Execute a unit of work with explicit options.
    ///
    /// With `options.active_transaction` set, the work runs directly against
    /// that transaction and its commit or rollback stays with the caller.
    /// Otherwise each attempt opens a fresh transaction; a failure the backend
    /// classifies as retriable restarts the work while retries remain. The
    /// error of the final attempt is returned as is.
    ///
    /// Retries re-run `work` from the start. Side effects it performs outside
    /// the transaction are not undone.
    pub async fn with_transaction_options<T, E, F, Fut>(
        &self,
        options: &TransactionOptions,
        mut work: F,
    ) -> Result<T, E>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ScopeError,
    {
        if let Some(active) = &options.active_transaction {
            self.check_kind(active)?;
            log::debug!(
                "manager '{}': running in caller-supplied transaction {}",
                self.inner.name,
                active.id()
            );
            return work(active.clone()).await;
        }

        let max_retries = options.effective_retries(&self.inner.config);
        let mut attempt: u32 = 0;
        loop {
            let err = match self.run_once(options, &mut work).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if attempt < max_retries && self.is_retriable(&err) {
                attempt += 1;
                log::warn!(
                    "manager '{}': retriable conflict, retrying (attempt {} of {})",
                    self.inner.name,
                    attempt + 1,
                    max_retries + 1
                );
                continue;
            }
            return Err(err);
        }
    }

    /// One open -> work -> commit/rollback cycle.
    async fn run_once<T, E, F, Fut>(
        &self,
        options: &TransactionOptions,
        work: &mut F,
    ) -> Result<T, E>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ScopeError,
    {
        let tx = self.begin(options).await?;
        let mut guard = ReleaseOnDrop::new(tx.clone());

        let outcome = work(tx.clone()).await;
        let result = match outcome {
            Ok(value) => match tx.commit().await {
                Ok(()) => {
                    log::debug!("manager '{}': committed {}", self.inner.name, tx.id());
                    Ok(value)
                }
                Err(e) => Err(E::from(e)),
            },
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    log::warn!(
                        "manager '{}': rollback of {} failed: {}",
                        self.inner.name,
                        tx.id(),
                        rollback_err
                    );
                } else {
                    log::debug!("manager '{}': rolled back {}", self.inner.name, tx.id());
                }
                Err(err)
            }
        };

        guard.disarm();
        result
    }

    fn is_retriable<E: ScopeError>(&self, err: &E) -> bool {
        err.transaction_error()
            .is_some_and(|e| self.inner.backend.is_retriable(e))
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("name", &self.inner.name)
            .field("kind", &self.kind())
            .field("config", &self.inner.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::Value;

    use crate::backend::{DocumentBackend, NoopBackend, NoopStats};
    use crate::storage::{Document, DocumentStore, RowKey, TableName};

    fn setup(config: ManagerConfig) -> (NoopBackend, TransactionManager) {
        let backend = NoopBackend::new();
        let manager = TransactionManager::new("default", backend.clone(), config);
        (backend, manager)
    }

    fn conflict() -> TransactionError {
        TransactionError::SerializationFailure {
            tx_id: "tx".to_string(),
            conflicts: vec!["accounts/a".to_string()],
        }
    }

    #[tokio::test]
    async fn test_commit_on_success() {
        let (backend, manager) = setup(ManagerConfig::default());

        let result: TransactionResult<u32> = manager.with_transaction(|_tx| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(
            backend.stats(),
            NoopStats {
                opened: 1,
                committed: 1,
                rolled_back: 0,
                released: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_rollback_on_error_preserves_error() {
        let (backend, manager) = setup(ManagerConfig::default());

        let result: TransactionResult<()> = manager
            .with_transaction(|_tx| async {
                Err(TransactionError::InvalidConfig("boom".to_string()))
            })
            .await;

        assert!(matches!(result, Err(TransactionError::InvalidConfig(ref m)) if m == "boom"));
        assert_eq!(backend.stats().committed, 0);
        assert_eq!(backend.stats().rolled_back, 1);
    }

    #[tokio::test]
    async fn test_retry_bound() {
        let (backend, manager) = setup(ManagerConfig::new().retries(3));
        let calls = AtomicUsize::new(0);

        let result: TransactionResult<()> = manager
            .with_transaction(|_tx| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    Err(TransactionError::SerializationFailure {
                        tx_id: format!("attempt-{}", n),
                        conflicts: Vec::new(),
                    })
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(backend.stats().opened, 4);
        assert_eq!(backend.stats().rolled_back, 4);
        match result {
            Err(TransactionError::SerializationFailure { tx_id, .. }) => {
                assert_eq!(tx_id, "attempt-3")
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_retries_by_default() {
        let (backend, manager) = setup(ManagerConfig::default());

        let result: TransactionResult<()> = manager.with_transaction(|_tx| async { Err(conflict()) }).await;

        assert!(result.unwrap_err().is_retryable());
        assert_eq!(backend.stats().opened, 1);
    }

    #[tokio::test]
    async fn test_options_override_retries() {
        let (backend, manager) = setup(ManagerConfig::new().retries(5));
        let options = TransactionOptions::new().retries(1);

        let result: TransactionResult<()> = manager
            .with_transaction_options(&options, |_tx| async { Err(conflict()) })
            .await;

        assert!(result.is_err());
        assert_eq!(backend.stats().opened, 2);
    }

    #[tokio::test]
    async fn test_retry_then_succeed_uses_fresh_transaction() {
        let (backend, manager) = setup(ManagerConfig::new().retries(2));
        let seen = parking_lot::Mutex::new(Vec::new());

        let result: TransactionResult<usize> = manager
            .with_transaction(|tx| {
                let mut seen = seen.lock();
                seen.push(tx.id().to_string());
                let attempt = seen.len();
                async move {
                    if attempt < 2 {
                        Err(conflict())
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        let seen = seen.into_inner();
        assert_ne!(seen[0], seen[1]);
        assert_eq!(backend.stats().committed, 1);
        assert_eq!(backend.stats().rolled_back, 1);
    }

    #[tokio::test]
    async fn test_non_retriable_error_is_not_retried() {
        let (backend, manager) = setup(ManagerConfig::new().retries(3));

        let result: TransactionResult<()> = manager
            .with_transaction(|_tx| async { Err(TransactionError::database(Some("23505"), "duplicate key")) })
            .await;

        assert!(result.is_err());
        assert_eq!(backend.stats().opened, 1);
    }

    #[tokio::test]
    async fn test_active_transaction_is_reused() {
        let (backend, manager) = setup(ManagerConfig::default());
        let outer = manager.begin(&TransactionOptions::default()).await.unwrap();
        let options = TransactionOptions::new().active_transaction(outer.clone());

        let inner: TransactionResult<Transaction> = manager
            .with_transaction_options(&options, |tx| async move { Ok(tx) })
            .await;

        assert_eq!(inner.unwrap(), outer);
        assert_eq!(
            backend.stats(),
            NoopStats {
                opened: 1,
                committed: 0,
                rolled_back: 0,
                released: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_foreign_active_transaction_rejected() {
        let (_backend, noop) = setup(ManagerConfig::default());
        let documents = TransactionManager::new(
            "documents",
            DocumentBackend::new(DocumentStore::in_memory()),
            ManagerConfig::default(),
        );
        let foreign = documents.begin(&TransactionOptions::default()).await.unwrap();
        let options = TransactionOptions::new().active_transaction(foreign);
        let ran = AtomicUsize::new(0);

        let result: TransactionResult<()> = noop
            .with_transaction_options(&options, |_tx| {
                ran.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(
            result,
            Err(TransactionError::ForeignTransaction {
                expected: BackendKind::Noop,
                found: BackendKind::Document,
            })
        ));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dropped_future_releases_transaction() {
        let (backend, manager) = setup(ManagerConfig::default());

        let fut = manager.with_transaction(|_tx| async {
            std::future::pending::<()>().await;
            Ok::<_, TransactionError>(())
        });
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(10), fut).await;

        assert!(timed_out.is_err());
        assert_eq!(
            backend.stats(),
            NoopStats {
                opened: 1,
                committed: 0,
                rolled_back: 0,
                released: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_metadata_and_params() {
        let (_backend, manager) = setup(
            ManagerConfig::new()
                .isolation_level(IsolationLevel::RepeatableRead)
                .user_param("tenant", "acme"),
        );
        let options = TransactionOptions::new().user_param("request", 7);

        let tx: TransactionResult<Transaction> = manager
            .with_transaction_options(&options, |tx| async move { Ok(tx) })
            .await;
        let tx = tx.unwrap();

        assert_eq!(tx.manager(), "default");
        assert_eq!(tx.isolation(), Some(IsolationLevel::RepeatableRead));
        assert_eq!(tx.user_params().get("tenant"), Some(&Value::from("acme")));
        assert_eq!(tx.user_params().get("request"), Some(&Value::from(7)));
        assert_eq!(tx.id().len(), 26);
    }

    /// Claims to be a noop backend but opens document handles.
    struct Mislabelled(DocumentBackend);

    #[async_trait]
    impl TransactionBackend for Mislabelled {
        fn kind(&self) -> BackendKind {
            BackendKind::Noop
        }

        async fn open(
            &self,
            tx_id: &str,
            isolation: Option<IsolationLevel>,
        ) -> TransactionResult<BackendHandle> {
            self.0.open(tx_id, isolation).await
        }
    }

    #[tokio::test]
    async fn test_handle_of_wrong_kind_rejected() {
        let manager = TransactionManager::new(
            "mislabelled",
            Mislabelled(DocumentBackend::new(DocumentStore::in_memory())),
            ManagerConfig::default(),
        );

        let err = manager.begin(&TransactionOptions::default()).await.unwrap_err();
        assert!(matches!(
            err,
            TransactionError::ForeignTransaction {
                expected: BackendKind::Noop,
                found: BackendKind::Document,
            }
        ));
    }

    #[tokio::test]
    async fn test_commit_conflict_is_retried() {
        let store = DocumentStore::in_memory();
        let manager = TransactionManager::new(
            "documents",
            DocumentBackend::new(store.clone()),
            ManagerConfig::new()
                .retries(1)
                .isolation_level(IsolationLevel::RepeatableRead),
        );
        let table = TableName::new("counters").unwrap();
        let key = RowKey::new("hits").unwrap();
        let attempts = AtomicUsize::new(0);

        let result: TransactionResult<()> = manager
            .with_transaction(|tx| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                let store = store.clone();
                let table = table.clone();
                let key = key.clone();
                async move {
                    let doc = tx.document()?;
                    let mut data = Document::new();
                    data.insert("attempt".to_string(), Value::from(attempt));
                    doc.upsert(&table, key.clone(), data)?;

                    if attempt == 0 {
                        // A concurrent writer commits the same row first.
                        let other = DocumentBackend::new(store);
                        let handle = other.open("intruder", None).await?;
                        if let BackendHandle::Document(intruder) = handle {
                            intruder.upsert(&table, key, Document::new())?;
                            intruder.commit().await?;
                        }
                    }
                    Ok(())
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        let row = store
            .get(&TableName::new("counters").unwrap(), &RowKey::new("hits").unwrap())
            .unwrap();
        assert_eq!(row.get("attempt"), Some(&Value::from(1)));
    }
}
