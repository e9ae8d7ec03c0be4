//! Propagation levels and the decision they drive.
//!
//! [`resolve`] is a pure function of the declared level and the transaction
//! found in context. It never opens anything.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::handle::Transaction;

/// How a scope relates to a transaction already active in its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Propagation {
    /// Join the active transaction, or start one if there is none.
    #[default]
    Required,
    /// Join the active transaction; fail if there is none.
    Mandatory,
    /// Always start a new transaction. An active one stays open underneath.
    RequiresNew,
}

impl Propagation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Propagation::Required => "REQUIRED",
            Propagation::Mandatory => "MANDATORY",
            Propagation::RequiresNew => "REQUIRES_NEW",
        }
    }
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Propagation {
    type Err = TransactionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "REQUIRED" => Ok(Propagation::Required),
            "MANDATORY" => Ok(Propagation::Mandatory),
            "REQUIRES_NEW" | "REQUIRESNEW" => Ok(Propagation::RequiresNew),
            _ => Err(TransactionError::UnknownPropagationLevel(s.to_string())),
        }
    }
}

impl TryFrom<String> for Propagation {
    type Error = TransactionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Propagation> for String {
    fn from(value: Propagation) -> Self {
        value.as_str().to_string()
    }
}

/// Outcome of the propagation decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Ask the manager for a fresh transaction.
    NewTransaction,
    /// Run inside this already-open transaction.
    ReuseTransaction(Transaction),
}

/// Decide whether a scope starts a new transaction or joins `existing`.
pub fn resolve(level: Propagation, existing: Option<&Transaction>) -> TransactionResult<Command> {
    match (level, existing) {
        (Propagation::Mandatory, None) => Err(TransactionError::IllegalTransactionState(
            "an active transaction was expected in this context".to_string(),
        )),
        (Propagation::Mandatory | Propagation::Required, Some(tx)) => {
            Ok(Command::ReuseTransaction(tx.clone()))
        }
        (Propagation::Required, None) | (Propagation::RequiresNew, _) => {
            Ok(Command::NewTransaction)
        }
    }
}
