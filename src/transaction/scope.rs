//! Transactional scopes.
//!
//! A [`Transactional`] declares how a unit of work relates to transactions:
//! which manager it uses, its propagation level, and per-call options.
//! Applying it to a unit of work:
//!
//! 1. reads the context stack of the current call chain (empty if none),
//! 2. takes the caller-supplied transaction, or else the latest one for the
//!    manager, as the existing transaction,
//! 3. resolves the propagation level against it,
//! 4. either delegates to [`TransactionManager::with_transaction_options`]
//!    or reuses the existing transaction as is,
//! 5. runs the unit of work with its transaction on top of the stack.
//!
//! The unit of work's result or error is returned unchanged.
//!
//! # Example
//!
//! ```ignore
//! let scope = Transactional::required();
//! scope
//!     .run(&registry, |tx| async move {
//!         let doc = tx.document()?;
//!         doc.insert(&users, key, row)?;
//!         audit(&registry).await
//!     })
//!     .await?;
//! ```

use std::future::Future;

use crate::transaction::context;
use crate::transaction::error::ScopeError;
use crate::transaction::handle::Transaction;
use crate::transaction::manager::TransactionManager;
use crate::transaction::options::TransactionOptions;
use crate::transaction::propagation::{resolve, Command, Propagation};
use crate::transaction::registry::{ManagerRegistry, DEFAULT_MANAGER_NAME};

/// Scope declaration for a unit of work.
#[derive(Debug, Clone, Default)]
pub struct Transactional {
    propagation: Propagation,
    manager: Option<String>,
    options: TransactionOptions,
}

impl Transactional {
    pub fn new(propagation: Propagation) -> Self {
        Self {
            propagation,
            ..Self::default()
        }
    }

    pub fn required() -> Self {
        Self::new(Propagation::Required)
    }

    pub fn mandatory() -> Self {
        Self::new(Propagation::Mandatory)
    }

    pub fn requires_new() -> Self {
        Self::new(Propagation::RequiresNew)
    }

    pub fn propagation(mut self, propagation: Propagation) -> Self {
        self.propagation = propagation;
        self
    }

    /// Use the manager registered as `name` instead of the default one.
    pub fn manager(mut self, name: impl Into<String>) -> Self {
        self.manager = Some(name.into());
        self
    }

    pub fn options(mut self, options: TransactionOptions) -> Self {
        self.options = options;
        self
    }

    /// Name of the manager this scope resolves through the registry.
    pub fn manager_name(&self) -> &str {
        self.manager.as_deref().unwrap_or(DEFAULT_MANAGER_NAME)
    }

    pub fn propagation_level(&self) -> Propagation {
        self.propagation
    }

    /// Run `work` in this scope, looking its manager up in `registry`.
    pub async fn run<T, E, F, Fut>(&self, registry: &ManagerRegistry, work: F) -> Result<T, E>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ScopeError,
    {
        let manager = registry.get(self.manager_name())?;
        self.run_with(manager, work).await
    }

    /// Run `work` in this scope against `manager`.
    ///
    /// The scope's frame is keyed by the manager's own name, so
    /// `get_current_transaction_for(manager.name())` sees it inside `work`,
    /// both in the closure body and in the future it returns.
    pub async fn run_with<T, E, F, Fut>(
        &self,
        manager: &TransactionManager,
        mut work: F,
    ) -> Result<T, E>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ScopeError,
    {
        let name = manager.name();
        let stack = context::current_stack().unwrap_or_default();

        let supplied = self.options.active_transaction.as_ref();
        if let Some(tx) = supplied {
            manager.check_kind(tx)?;
        }
        let existing = supplied.cloned().or_else(|| stack.get_latest(name));

        match resolve(self.propagation, existing.as_ref())? {
            Command::NewTransaction => {
                log::debug!(
                    "scope {} on manager '{}': starting new transaction",
                    self.propagation,
                    name
                );
                let mut options = self.options.clone();
                options.active_transaction = None;
                manager
                    .with_transaction_options(&options, |tx| {
                        context::enter(stack.clone(), name, tx, &mut work)
                    })
                    .await
            }
            Command::ReuseTransaction(tx) => {
                log::debug!(
                    "scope {} on manager '{}': joining transaction {}",
                    self.propagation,
                    name,
                    tx.id()
                );
                context::enter(stack, name, tx, work).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DocumentBackend, NoopBackend};
    use crate::storage::DocumentStore;
    use crate::transaction::context::{get_current_transaction, try_current_transaction};
    use crate::transaction::error::{TransactionError, TransactionResult};
    use crate::transaction::handle::BackendKind;
    use crate::transaction::options::ManagerConfig;

    fn registry() -> (NoopBackend, ManagerRegistry) {
        let backend = NoopBackend::new();
        let mut registry = ManagerRegistry::new();
        registry.register(TransactionManager::new(
            DEFAULT_MANAGER_NAME,
            backend.clone(),
            ManagerConfig::default(),
        ));
        (backend, registry)
    }

    #[test]
    fn test_declaration_defaults() {
        let scope = Transactional::default();
        assert_eq!(scope.propagation_level(), Propagation::Required);
        assert_eq!(scope.manager_name(), "default");

        let scope = Transactional::requires_new().manager("reports");
        assert_eq!(scope.propagation_level(), Propagation::RequiresNew);
        assert_eq!(scope.manager_name(), "reports");
    }

    #[tokio::test]
    async fn test_work_sees_its_transaction() {
        let (backend, registry) = registry();

        let result: TransactionResult<bool> = Transactional::required()
            .run(&registry, |tx| async move {
                let current = get_current_transaction()?;
                Ok(current == tx)
            })
            .await;

        assert!(result.unwrap());
        assert_eq!(backend.stats().committed, 1);
        assert!(try_current_transaction("default").is_none());
    }

    #[tokio::test]
    async fn test_closure_body_runs_inside_scope() {
        let (_backend, registry) = registry();
        let registry = &registry;

        let result = Transactional::required()
            .run(registry, |tx| {
                let seen_new = get_current_transaction();
                async move {
                    let (joined, seen_joined) = Transactional::required()
                        .run(registry, |joined| {
                            let seen = get_current_transaction();
                            async move { Ok::<_, TransactionError>((joined, seen?)) }
                        })
                        .await?;
                    assert_eq!(joined, seen_joined);
                    assert_eq!(joined, tx);
                    let (inner, seen_inner) = Transactional::requires_new()
                        .run(registry, |inner| {
                            let seen = get_current_transaction();
                            async move { Ok::<_, TransactionError>((inner, seen?)) }
                        })
                        .await?;
                    Ok::<_, TransactionError>((tx, seen_new?, inner, seen_inner))
                }
            })
            .await;

        let (tx, seen_new, inner, seen_inner) = result.unwrap();
        assert_eq!(seen_new, tx);
        assert_eq!(seen_inner, inner);
        assert_ne!(inner, tx);
    }

    #[tokio::test]
    async fn test_unregistered_manager() {
        let (backend, registry) = registry();

        let result: TransactionResult<()> = Transactional::required()
            .manager("missing")
            .run(&registry, |_tx| async { Ok(()) })
            .await;

        assert!(matches!(result, Err(TransactionError::ManagerNotRegistered(ref name)) if name == "missing"));
        assert_eq!(backend.stats().opened, 0);
    }

    #[tokio::test]
    async fn test_supplied_transaction_overrides_context() {
        let (backend, registry) = registry();
        let manager = registry.default_manager().unwrap();
        let injected = manager.begin(&TransactionOptions::default()).await.unwrap();
        let scope = Transactional::mandatory()
            .options(TransactionOptions::new().active_transaction(injected.clone()));

        let seen: TransactionResult<Transaction> = scope
            .run(&registry, |_tx| async { get_current_transaction() })
            .await;

        assert_eq!(seen.unwrap(), injected);
        assert_eq!(backend.stats().opened, 1);
        assert_eq!(backend.stats().committed, 0);
    }

    #[tokio::test]
    async fn test_requires_new_ignores_supplied_transaction() {
        let (backend, registry) = registry();
        let manager = registry.default_manager().unwrap();
        let injected = manager.begin(&TransactionOptions::default()).await.unwrap();
        let scope = Transactional::requires_new()
            .options(TransactionOptions::new().active_transaction(injected.clone()));

        let seen: TransactionResult<Transaction> =
            scope.run(&registry, |tx| async move { Ok(tx) }).await;

        assert_ne!(seen.unwrap(), injected);
        assert_eq!(backend.stats().opened, 2);
        assert_eq!(backend.stats().committed, 1);
    }

    #[tokio::test]
    async fn test_foreign_supplied_transaction_rejected_before_resolve() {
        let (backend, registry) = registry();
        let documents = TransactionManager::new(
            "documents",
            DocumentBackend::new(DocumentStore::in_memory()),
            ManagerConfig::default(),
        );
        let foreign = documents.begin(&TransactionOptions::default()).await.unwrap();
        let scope = Transactional::requires_new()
            .options(TransactionOptions::new().active_transaction(foreign));

        let result: TransactionResult<()> = scope.run(&registry, |_tx| async { Ok(()) }).await;

        assert!(matches!(
            result,
            Err(TransactionError::ForeignTransaction {
                expected: BackendKind::Noop,
                found: BackendKind::Document,
            })
        ));
        assert_eq!(backend.stats().opened, 0);
    }
}
