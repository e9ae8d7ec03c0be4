//! Document store backend.
//!
//! Each transaction buffers its writes and remembers what it read. Nothing
//! reaches the store before commit, so a rollback is just dropping the
//! buffer. At commit the buffer is validated against the store according to
//! the isolation level; a failed validation is reported as a serialization
//! failure (SQLSTATE 40001) and is therefore retried by the manager.
//!
//! Insert, update and delete also carry an existence expectation that is
//! checked against the latest committed state at every isolation level, so
//! a duplicate insert or a write to a concurrently deleted row fails at
//! commit instead of silently overwriting.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::storage::{
    ChangeSet, Document, DocumentStore, RowExpectation, RowKey, RowPath, Snapshot, StorageError,
    StorageResult, TableName,
};
use crate::transaction::{
    BackendHandle, BackendKind, BackendTransaction, IsolationLevel, TransactionBackend,
    TransactionError, TransactionResult,
};

/// Backend adapter over a [`DocumentStore`].
#[derive(Debug, Clone)]
pub struct DocumentBackend {
    store: DocumentStore,
    default_isolation: IsolationLevel,
}

impl DocumentBackend {
    pub fn new(store: DocumentStore) -> Self {
        Self {
            store,
            default_isolation: IsolationLevel::default(),
        }
    }

    /// Isolation level used when neither the manager nor the call picks one.
    pub fn with_default_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.default_isolation = isolation;
        self
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }
}

#[async_trait]
impl TransactionBackend for DocumentBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Document
    }

    async fn open(
        &self,
        tx_id: &str,
        isolation: Option<IsolationLevel>,
    ) -> TransactionResult<BackendHandle> {
        let isolation = isolation.unwrap_or(self.default_isolation);
        let tx = DocumentTransaction::begin(self.store.clone(), tx_id.to_string(), isolation);
        Ok(BackendHandle::Document(tx))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxStatus {
    Active,
    /// Change set handed to the store, outcome pending.
    Committing,
    Committed,
    RolledBack,
}

impl TxStatus {
    fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Active => "active",
            TxStatus::Committing => "committing",
            TxStatus::Committed => "committed",
            TxStatus::RolledBack => "rolled back",
        }
    }
}

#[derive(Debug)]
struct TxState {
    status: TxStatus,
    writes: BTreeMap<RowPath, Option<Document>>,
    expectations: BTreeMap<RowPath, RowExpectation>,
    reads: BTreeSet<RowPath>,
    scanned: BTreeSet<TableName>,
}

impl TxState {
    /// Buffer a write. The expectation is only recorded for the first write
    /// to a row; later ones build on the buffered value.
    fn buffer(&mut self, path: RowPath, data: Option<Document>, expect: Option<RowExpectation>) {
        if let Some(expect) = expect {
            if !self.writes.contains_key(&path) {
                self.expectations.insert(path.clone(), expect);
            }
        }
        self.writes.insert(path, data);
    }
}

/// A transaction against the document store.
#[derive(Debug)]
pub struct DocumentTransaction {
    tx_id: String,
    store: DocumentStore,
    isolation: IsolationLevel,
    /// Committed state at open; the read view for snapshot isolation levels.
    snapshot: Snapshot,
    state: Mutex<TxState>,
}

impl DocumentTransaction {
    pub(crate) fn begin(store: DocumentStore, tx_id: String, isolation: IsolationLevel) -> Self {
        let snapshot = store.snapshot();
        log::debug!(
            "document tx {}: begin at version {} ({})",
            tx_id,
            snapshot.version(),
            isolation
        );
        Self {
            tx_id,
            store,
            isolation,
            snapshot,
            state: Mutex::new(TxState {
                status: TxStatus::Active,
                writes: BTreeMap::new(),
                expectations: BTreeMap::new(),
                reads: BTreeSet::new(),
                scanned: BTreeSet::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.tx_id
    }

    /// Isolation level actually in effect.
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Store version this transaction started from.
    pub fn base_version(&self) -> u64 {
        self.snapshot.version()
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().status == TxStatus::Active
    }

    fn read_view(&self) -> Snapshot {
        if self.isolation.uses_snapshot() {
            self.snapshot.clone()
        } else {
            self.store.snapshot()
        }
    }

    fn check_active(&self, state: &TxState) -> TransactionResult<()> {
        if state.status != TxStatus::Active {
            return Err(TransactionError::NotActive {
                tx_id: self.tx_id.clone(),
                state: state.status.as_str().to_string(),
            });
        }
        Ok(())
    }

    /// Read a row as this transaction sees it, recording the read.
    fn lookup(&self, state: &mut TxState, path: &RowPath) -> Option<Document> {
        if let Some(buffered) = state.writes.get(path) {
            return buffered.clone();
        }
        state.reads.insert(path.clone());
        self.read_view().get(&path.table, &path.key)
    }

    // ==================== Row Operations ====================

    /// Read a single row.
    pub fn get(&self, table: &TableName, key: &RowKey) -> TransactionResult<Option<Document>> {
        let mut state = self.state.lock();
        self.check_active(&state)?;
        let path = RowPath::new(table.clone(), key.clone());
        Ok(self.lookup(&mut state, &path))
    }

    /// Insert a new row. Fails if the key already exists.
    pub fn insert(&self, table: &TableName, key: RowKey, data: Document) -> TransactionResult<()> {
        let mut state = self.state.lock();
        self.check_active(&state)?;
        let path = RowPath::new(table.clone(), key);
        if self.lookup(&mut state, &path).is_some() {
            return Err(StorageError::RowAlreadyExists {
                table: path.table,
                key: path.key,
            }
            .into());
        }
        state.buffer(path, Some(data), Some(RowExpectation::Absent));
        Ok(())
    }

    /// Replace an existing row. Fails if the key does not exist.
    pub fn update(&self, table: &TableName, key: RowKey, data: Document) -> TransactionResult<()> {
        let mut state = self.state.lock();
        self.check_active(&state)?;
        let path = RowPath::new(table.clone(), key);
        if self.lookup(&mut state, &path).is_none() {
            return Err(StorageError::RowNotFound {
                table: path.table,
                key: path.key,
            }
            .into());
        }
        state.buffer(path, Some(data), Some(RowExpectation::Present));
        Ok(())
    }

    /// Insert or update a row (upsert).
    pub fn upsert(&self, table: &TableName, key: RowKey, data: Document) -> TransactionResult<()> {
        let mut state = self.state.lock();
        self.check_active(&state)?;
        state.buffer(RowPath::new(table.clone(), key), Some(data), None);
        Ok(())
    }

    /// Delete a row. Fails if the key does not exist.
    pub fn delete(&self, table: &TableName, key: &RowKey) -> TransactionResult<()> {
        let mut state = self.state.lock();
        self.check_active(&state)?;
        let path = RowPath::new(table.clone(), key.clone());
        if self.lookup(&mut state, &path).is_none() {
            return Err(StorageError::RowNotFound {
                table: path.table,
                key: path.key,
            }
            .into());
        }
        state.buffer(path, None, Some(RowExpectation::Present));
        Ok(())
    }

    /// Scan all rows in a table, including this transaction's own writes.
    pub fn scan(&self, table: &TableName) -> TransactionResult<Vec<(RowKey, Document)>> {
        let mut state = self.state.lock();
        self.check_active(&state)?;
        state.scanned.insert(table.clone());

        let mut rows: BTreeMap<RowKey, Document> =
            self.read_view().scan(table).into_iter().collect();
        for (path, data) in state.writes.iter().filter(|(p, _)| &p.table == table) {
            match data {
                Some(doc) => rows.insert(path.key.clone(), doc.clone()),
                None => rows.remove(&path.key),
            };
        }
        Ok(rows.into_iter().collect())
    }

    /// Number of rows in a table.
    pub fn count(&self, table: &TableName) -> TransactionResult<usize> {
        Ok(self.scan(table)?.len())
    }

    // ==================== Transaction Control ====================

    /// Move the buffer into a change set and mark the transaction as
    /// committing. `None` if it was already committed.
    fn prepare_commit(&self) -> TransactionResult<Option<ChangeSet>> {
        let mut state = self.state.lock();
        match state.status {
            TxStatus::Committed => return Ok(None),
            TxStatus::Active => {}
            TxStatus::Committing | TxStatus::RolledBack => self.check_active(&state)?,
        }

        let mut changes = ChangeSet::new(self.base_version());
        if self.isolation.validates_writes() {
            changes.validate_rows.extend(state.writes.keys().cloned());
        }
        if self.isolation.validates_reads() {
            changes.validate_rows.extend(state.reads.iter().cloned());
            changes.validate_tables.extend(state.scanned.iter().cloned());
        }
        changes.writes = std::mem::take(&mut state.writes);
        changes.expectations = std::mem::take(&mut state.expectations);
        state.status = TxStatus::Committing;
        Ok(Some(changes))
    }

    fn finish_commit(
        &self,
        result: StorageResult<u64>,
        write_count: usize,
    ) -> TransactionResult<()> {
        let mut state = self.state.lock();
        match result {
            Ok(version) => {
                state.status = TxStatus::Committed;
                log::debug!(
                    "document tx {}: committed {} write(s) at version {}",
                    self.tx_id,
                    write_count,
                    version
                );
                Ok(())
            }
            Err(StorageError::Conflict { paths }) => {
                state.status = TxStatus::RolledBack;
                log::debug!("document tx {}: conflict on {:?}", self.tx_id, paths);
                Err(TransactionError::SerializationFailure {
                    tx_id: self.tx_id.clone(),
                    conflicts: paths,
                })
            }
            Err(e) => {
                state.status = TxStatus::RolledBack;
                log::debug!("document tx {}: commit rejected: {}", self.tx_id, e);
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl BackendTransaction for DocumentTransaction {
    /// Validate and apply the buffered writes.
    ///
    /// Committing an already committed transaction is a no-op; committing
    /// a rolled back one fails with `NotActive`. A file-backed store is
    /// written from the blocking thread pool.
    async fn commit(&self) -> TransactionResult<()> {
        let changes = match self.prepare_commit()? {
            Some(changes) => changes,
            None => return Ok(()),
        };
        let write_count = changes.writes.len();

        let result = if self.store.path().is_some() {
            let store = self.store.clone();
            tokio::task::spawn_blocking(move || store.apply(changes))
                .await
                .unwrap_or_else(|e| Err(StorageError::Io(std::io::Error::other(e.to_string()))))
        } else {
            self.store.apply(changes)
        };
        self.finish_commit(result, write_count)
    }

    /// Discard the buffered writes. A no-op once the transaction is closed.
    async fn rollback(&self) -> TransactionResult<()> {
        self.release();
        Ok(())
    }

    fn release(&self) {
        let mut state = self.state.lock();
        if state.status == TxStatus::Active {
            state.writes.clear();
            state.expectations.clear();
            state.status = TxStatus::RolledBack;
            log::debug!("document tx {}: rolled back", self.tx_id);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
