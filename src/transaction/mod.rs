//! Declarative transaction scopes.
//!
//! A unit of work declared [`Transactional`] either joins the transaction
//! already active for its manager in the current call chain or gets a new
//! one, depending on its [`Propagation`] level. New transactions are opened,
//! committed, rolled back and retried by the [`TransactionManager`]; the
//! context stack makes the innermost one discoverable from anywhere inside
//! the unit of work.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Transactional                          │
//! │     (context lookup, propagation decision, push/pop)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │ Transaction │       │ Propagation │       │ Transaction │
//!  │   Stack     │       │  resolve()  │       │   Manager   │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//!                                                     │
//!                                                     ▼
//!                                           ┌──────────────────┐
//!                                           │TransactionBackend│
//!                                           └──────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use txscope::transaction::{get_current_transaction, ManagerRegistry, Transactional};
//!
//! let registry = ManagerRegistry::from_config(&config)?;
//!
//! Transactional::required()
//!     .run(&registry, |tx| async move {
//!         // Nested scopes on the same manager join `tx`.
//!         assert_eq!(get_current_transaction()?, tx);
//!         Ok(())
//!     })
//!     .await?;
//! ```

mod context;
mod error;
mod handle;
mod isolation;
mod manager;
mod options;
mod propagation;
mod registry;
mod scope;

pub use context::{
    current_stack, get_current_transaction, get_current_transaction_for, try_current_transaction,
    TransactionStack,
};
pub use error::{ScopeError, TransactionError, TransactionResult, SERIALIZATION_FAILURE_SQLSTATE};
pub use handle::{
    BackendHandle, BackendKind, BackendTransaction, Transaction, TransactionMetadata,
};
pub use isolation::IsolationLevel;
pub use manager::{TransactionBackend, TransactionManager};
pub use options::{ManagerConfig, TransactionOptions, UserParams};
pub use propagation::{resolve, Command, Propagation};
pub use registry::{
    BackendConfig, ManagerEntry, ManagerRegistry, RegistryConfig, DEFAULT_MANAGER_NAME,
};
pub use scope::Transactional;
