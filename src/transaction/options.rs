//! Manager defaults and per-call transaction options.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transaction::handle::Transaction;
use crate::transaction::isolation::IsolationLevel;

/// Backend-specific parameters attached to every transaction a manager opens.
pub type UserParams = BTreeMap<String, Value>;

/// Per-manager defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Max retries on a retriable conflict. `N` retries allow `N + 1` attempts.
    pub retries: u32,
    /// Isolation level for new transactions; `None` uses the backend default.
    pub isolation_level: Option<IsolationLevel>,
    /// Parameters merged under the per-call ones.
    pub user_params: UserParams,
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retry budget.
    pub fn retries(mut self, value: u32) -> Self {
        self.retries = value;
        self
    }

    /// Set the default isolation level.
    pub fn isolation_level(mut self, value: IsolationLevel) -> Self {
        self.isolation_level = Some(value);
        self
    }

    /// Add a default user parameter.
    pub fn user_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.user_params.insert(key.into(), value.into());
        self
    }
}

/// Options for one `with_transaction` call or one scope declaration.
///
/// Every field left unset falls back to the manager's [`ManagerConfig`].
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    /// Overrides the manager's retry budget.
    pub retries: Option<u32>,
    /// Overrides the manager's isolation level.
    pub isolation_level: Option<IsolationLevel>,
    /// Run against this transaction instead of opening a new one.
    pub active_transaction: Option<Transaction>,
    /// Merged over the manager's default parameters.
    pub user_params: UserParams,
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retry budget.
    pub fn retries(mut self, value: u32) -> Self {
        self.retries = Some(value);
        self
    }

    /// Set the isolation level.
    pub fn isolation_level(mut self, value: IsolationLevel) -> Self {
        self.isolation_level = Some(value);
        self
    }

    /// Force reuse of a caller-supplied transaction.
    pub fn active_transaction(mut self, tx: Transaction) -> Self {
        self.active_transaction = Some(tx);
        self
    }

    /// Add a user parameter.
    pub fn user_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.user_params.insert(key.into(), value.into());
        self
    }

    pub(crate) fn effective_retries(&self, config: &ManagerConfig) -> u32 {
        self.retries.unwrap_or(config.retries)
    }

    pub(crate) fn effective_isolation(&self, config: &ManagerConfig) -> Option<IsolationLevel> {
        self.isolation_level.or(config.isolation_level)
    }

    pub(crate) fn effective_user_params(&self, config: &ManagerConfig) -> UserParams {
        let mut params = config.user_params.clone();
        params.extend(self.user_params.iter().map(|(k, v)| (k.clone(), v.clone())));
        params
    }
}
