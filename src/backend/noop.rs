//! Backend whose transactions do nothing but get counted.
//!
//! Useful where code is written against the scope API but no database is
//! wired in, and in tests that assert how many transactions were opened,
//! committed or rolled back.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::transaction::{
    BackendHandle, BackendKind, BackendTransaction, IsolationLevel, TransactionBackend,
    TransactionResult,
};

#[derive(Debug, Default)]
struct Counters {
    opened: AtomicUsize,
    committed: AtomicUsize,
    rolled_back: AtomicUsize,
    released: AtomicUsize,
}

/// Point-in-time copy of a [`NoopBackend`]'s counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoopStats {
    pub opened: usize,
    pub committed: usize,
    pub rolled_back: usize,
    /// Transactions abandoned while still open (dropped futures).
    pub released: usize,
}

/// No-op backend.
#[derive(Debug, Clone, Default)]
pub struct NoopBackend {
    counters: Arc<Counters>,
}

impl NoopBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> NoopStats {
        NoopStats {
            opened: self.counters.opened.load(Ordering::SeqCst),
            committed: self.counters.committed.load(Ordering::SeqCst),
            rolled_back: self.counters.rolled_back.load(Ordering::SeqCst),
            released: self.counters.released.load(Ordering::SeqCst),
        }
    }

    pub(crate) fn transaction(&self) -> NoopTransaction {
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        NoopTransaction {
            counters: self.counters.clone(),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl TransactionBackend for NoopBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Noop
    }

    async fn open(
        &self,
        tx_id: &str,
        _isolation: Option<IsolationLevel>,
    ) -> TransactionResult<BackendHandle> {
        log::trace!("noop backend: open {}", tx_id);
        Ok(BackendHandle::Noop(self.transaction()))
    }
}

/// A transaction of the no-op backend. Only the first commit, rollback or
/// release is counted.
#[derive(Debug)]
pub struct NoopTransaction {
    counters: Arc<Counters>,
    closed: AtomicBool,
}

impl NoopTransaction {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self, counter: &AtomicUsize) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl BackendTransaction for NoopTransaction {
    async fn commit(&self) -> TransactionResult<()> {
        self.close(&self.counters.committed);
        Ok(())
    }

    async fn rollback(&self) -> TransactionResult<()> {
        self.close(&self.counters.rolled_back);
        Ok(())
    }

    fn release(&self) {
        self.close(&self.counters.released);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
