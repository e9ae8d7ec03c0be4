//! Per-call-chain discovery of the current transaction.
//!
//! A [`TransactionStack`] maps manager names to the transactions entered in
//! the current logical call chain, most recent first. The stack is bound to
//! the running task with a tokio task-local: every scope binds a copy with
//! its own transaction pushed on top for exactly the duration of its unit of
//! work. Leaving the unit of work in any way (return, error, or the future
//! being dropped) restores the enclosing binding, so frames cannot leak.
//!
//! Chains never see each other's stacks:
//! - a spawned task starts with no binding at all;
//! - futures polled concurrently within one task (`join!`, `select!`) each
//!   carry their own binding, so siblings do not observe one another.
//!
//! The stack is built from persistent maps, which makes the per-scope copy
//! O(1).

use std::fmt;
use std::future::Future;

use im::{HashMap, Vector};
use tokio::task::futures::TaskLocalFuture;

use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::handle::Transaction;
use crate::transaction::registry::DEFAULT_MANAGER_NAME;

tokio::task_local! {
    static TX_CONTEXT: TransactionStack;
}

/// Active transactions of one logical call chain, keyed by manager name.
#[derive(Clone, Default)]
pub struct TransactionStack {
    frames: HashMap<String, Vector<Transaction>>,
}

impl TransactionStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `tx` the latest transaction for `manager`.
    pub fn push(&mut self, manager: &str, tx: Transaction) {
        log::trace!("context: push {} for manager '{}'", tx.id(), manager);
        let mut frames = self.frames.get(manager).cloned().unwrap_or_default();
        frames.push_front(tx);
        self.frames.insert(manager.to_string(), frames);
    }

    /// Latest transaction for `manager`, if any.
    pub fn get_latest(&self, manager: &str) -> Option<Transaction> {
        self.frames.get(manager).and_then(|frames| frames.front().cloned())
    }

    /// Remove the latest transaction for `manager`. A no-op when there is none.
    pub fn pop(&mut self, manager: &str) {
        if let Some(frames) = self.frames.get_mut(manager) {
            if let Some(tx) = frames.pop_front() {
                log::trace!("context: pop {} for manager '{}'", tx.id(), manager);
            }
        }
    }

    /// Number of open transactions for `manager`.
    pub fn depth(&self, manager: &str) -> usize {
        self.frames.get(manager).map_or(0, |frames| frames.len())
    }

    pub fn is_empty(&self) -> bool {
        self.frames.values().all(|frames| frames.is_empty())
    }
}

impl fmt::Debug for TransactionStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (manager, frames) in self.frames.iter() {
            let ids: Vec<&str> = frames.iter().map(|tx| tx.id()).collect();
            map.entry(manager, &ids);
        }
        map.finish()
    }
}

/// The stack bound to the current call chain, if a scope is open in it.
pub fn current_stack() -> Option<TransactionStack> {
    TX_CONTEXT.try_with(|stack| stack.clone()).ok()
}

/// Call `work` with `tx` pushed on top of `stack` for `manager`, and run
/// the future it returns under the same binding.
///
/// `work` itself is called inside the binding, so code it runs before
/// returning its future sees `tx` as well. The binding is dropped, and with
/// it the frame, when the future completes or is dropped.
pub(crate) fn enter<F, Fut>(
    mut stack: TransactionStack,
    manager: &str,
    tx: Transaction,
    work: F,
) -> TaskLocalFuture<TransactionStack, Fut>
where
    F: FnOnce(Transaction) -> Fut,
    Fut: Future,
{
    stack.push(manager, tx.clone());
    let fut = TX_CONTEXT.sync_scope(stack.clone(), || work(tx));
    TX_CONTEXT.scope(stack, fut)
}

/// Latest transaction opened for `manager` in the current call chain.
pub fn try_current_transaction(manager: &str) -> Option<Transaction> {
    TX_CONTEXT
        .try_with(|stack| stack.get_latest(manager))
        .ok()
        .flatten()
}

/// Transaction of the innermost open scope of the default manager.
pub fn get_current_transaction() -> TransactionResult<Transaction> {
    get_current_transaction_for(DEFAULT_MANAGER_NAME)
}

/// Transaction of the innermost open scope of `manager`.
pub fn get_current_transaction_for(manager: &str) -> TransactionResult<Transaction> {
    try_current_transaction(manager).ok_or_else(|| TransactionError::NoActiveTransaction {
        manager: manager.to_string(),
    })
}
