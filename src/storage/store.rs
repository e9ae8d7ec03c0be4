//! Versioned document store.
//!
//! Committed state is an immutable [`Snapshot`] built from persistent maps,
//! so taking a snapshot for a reader is O(1). Writers hand a [`ChangeSet`]
//! to [`DocumentStore::apply`], which validates it against the current state
//! and installs a new snapshot under a single commit lock.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use im::OrdMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{Document, RowKey, RowPath, TableName};

/// A row together with the version of the commit that last touched it.
///
/// Deleted rows are kept as tombstones so that validation can still see
/// that they changed.
#[derive(Debug, Clone)]
struct VersionedRow {
    version: u64,
    data: Option<Arc<Document>>,
}

#[derive(Debug, Clone, Default)]
struct Table {
    version: u64,
    rows: OrdMap<RowKey, VersionedRow>,
}

/// An immutable view of the committed state at one version.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    version: u64,
    tables: OrdMap<TableName, Table>,
}

impl Snapshot {
    /// Version of the last commit included in this snapshot.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Read a single row.
    pub fn get(&self, table: &TableName, key: &RowKey) -> Option<Document> {
        self.tables
            .get(table)
            .and_then(|t| t.rows.get(key))
            .and_then(|row| row.data.as_deref().cloned())
    }

    /// All live rows of a table, ordered by key.
    pub fn scan(&self, table: &TableName) -> Vec<(RowKey, Document)> {
        match self.tables.get(table) {
            Some(t) => t
                .rows
                .iter()
                .filter_map(|(key, row)| row.data.as_deref().map(|d| (key.clone(), d.clone())))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Names of tables that hold at least one live row.
    pub fn table_names(&self) -> Vec<TableName> {
        self.tables
            .iter()
            .filter(|(_, t)| t.rows.values().any(|row| row.data.is_some()))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Version of the last commit that wrote the row, 0 if it never existed.
    pub fn row_version(&self, path: &RowPath) -> u64 {
        self.tables
            .get(&path.table)
            .and_then(|t| t.rows.get(&path.key))
            .map_or(0, |row| row.version)
    }

    /// Version of the last commit that wrote any row of the table.
    pub fn table_version(&self, table: &TableName) -> u64 {
        self.tables.get(table).map_or(0, |t| t.version)
    }

    fn write(&mut self, path: &RowPath, data: Option<Document>, version: u64) {
        let mut table = self.tables.get(&path.table).cloned().unwrap_or_default();
        table.version = version;
        table.rows.insert(
            path.key.clone(),
            VersionedRow {
                version,
                data: data.map(Arc::new),
            },
        );
        self.tables.insert(path.table.clone(), table);
    }

    fn to_persisted(&self) -> PersistedSnapshot {
        let mut tables = BTreeMap::new();
        for name in self.tables.keys() {
            let rows: BTreeMap<RowKey, Document> = self.scan(name).into_iter().collect();
            if !rows.is_empty() {
                tables.insert(name.clone(), rows);
            }
        }
        PersistedSnapshot {
            version: self.version,
            tables,
        }
    }

    fn from_persisted(persisted: PersistedSnapshot) -> Self {
        let version = persisted.version;
        let tables = persisted
            .tables
            .into_iter()
            .map(|(name, rows)| {
                let rows = rows
                    .into_iter()
                    .map(|(key, data)| {
                        let row = VersionedRow {
                            version,
                            data: Some(Arc::new(data)),
                        };
                        (key, row)
                    })
                    .collect();
                (name, Table { version, rows })
            })
            .collect();
        Self { version, tables }
    }
}

/// On-disk format of a snapshot.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedSnapshot {
    version: u64,
    tables: BTreeMap<TableName, BTreeMap<RowKey, Document>>,
}

/// State a row must be in when a change set is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowExpectation {
    /// The row must not exist (insert).
    Absent,
    /// The row must exist (update, delete).
    Present,
}

/// Buffered writes of one transaction plus what has to be validated before
/// they may be applied.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    /// Snapshot version the transaction started from.
    pub base_version: u64,
    /// Row writes; `None` deletes the row.
    pub writes: BTreeMap<RowPath, Option<Document>>,
    /// Rows that must not have been written since `base_version`.
    pub validate_rows: BTreeSet<RowPath>,
    /// Tables that must not have been written since `base_version`.
    pub validate_tables: BTreeSet<TableName>,
    /// Existence checks against the latest committed state, independent of
    /// `base_version`.
    pub expectations: BTreeMap<RowPath, RowExpectation>,
}

impl ChangeSet {
    pub fn new(base_version: u64) -> Self {
        Self {
            base_version,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

struct StoreInner {
    /// Latest committed state.
    state: RwLock<Snapshot>,
    /// File the state is persisted to after every commit.
    path: Option<PathBuf>,
    /// Mutex for serializing commits.
    commit_lock: Mutex<()>,
}

/// Embedded document store.
///
/// Thread-safe: can be shared across threads via Clone (uses Arc internally).
#[derive(Clone)]
pub struct DocumentStore {
    inner: Arc<StoreInner>,
}

impl DocumentStore {
    /// Create an empty store that lives only in memory.
    pub fn in_memory() -> Self {
        Self::with_state(Snapshot::default(), None)
    }

    /// Open a store persisted at `path`, creating it on first commit if the
    /// file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        let snapshot = if path.exists() {
            let bytes = fs::read(&path)?;
            let persisted: PersistedSnapshot =
                serde_json::from_slice(&bytes).map_err(|e| StorageError::CorruptedData {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            Snapshot::from_persisted(persisted)
        } else {
            Snapshot::default()
        };
        log::debug!(
            "opened document store at {} (version {})",
            path.display(),
            snapshot.version
        );
        Ok(Self::with_state(snapshot, Some(path)))
    }

    fn with_state(snapshot: Snapshot, path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: RwLock::new(snapshot),
                path,
                commit_lock: Mutex::new(()),
            }),
        }
    }

    /// File backing this store, if any.
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// The latest committed state.
    pub fn snapshot(&self) -> Snapshot {
        self.inner.state.read().clone()
    }

    /// Version of the latest commit.
    pub fn version(&self) -> u64 {
        self.inner.state.read().version
    }

    /// Read a committed row.
    pub fn get(&self, table: &TableName, key: &RowKey) -> Option<Document> {
        self.inner.state.read().get(table, key)
    }

    /// Read all committed rows of a table.
    pub fn scan(&self, table: &TableName) -> Vec<(RowKey, Document)> {
        self.inner.state.read().scan(table)
    }

    /// Validate and apply a change set, returning the new version.
    ///
    /// Fails with [`StorageError::Conflict`] if any row or table named for
    /// validation was written after the change set's base version, and with
    /// [`StorageError::RowAlreadyExists`] or [`StorageError::RowNotFound`]
    /// if an expectation does not hold. Nothing is applied in either case.
    ///
    /// For a file-backed store this blocks on the file write and `fsync`
    /// while holding the commit lock. Async callers should run it on a
    /// blocking thread.
    pub fn apply(&self, changes: ChangeSet) -> StorageResult<u64> {
        let _guard = self.inner.commit_lock.lock();

        let mut next = self.snapshot();
        let conflicts = Self::detect_conflicts(&next, &changes);
        if !conflicts.is_empty() {
            return Err(StorageError::Conflict { paths: conflicts });
        }
        Self::check_expectations(&next, &changes)?;

        if changes.is_empty() {
            return Ok(next.version);
        }

        next.version += 1;
        let version = next.version;
        for (path, data) in changes.writes {
            next.write(&path, data, version);
        }

        if let Some(path) = &self.inner.path {
            Self::persist(path, &next)?;
        }

        *self.inner.state.write() = next;
        Ok(version)
    }

    fn detect_conflicts(current: &Snapshot, changes: &ChangeSet) -> Vec<String> {
        let base = changes.base_version;
        let rows = changes
            .validate_rows
            .iter()
            .filter(|path| current.row_version(path) > base)
            .map(|path| path.to_string());
        let tables = changes
            .validate_tables
            .iter()
            .filter(|table| current.table_version(table) > base)
            .map(|table| format!("{}/*", table));
        rows.chain(tables).collect()
    }

    fn check_expectations(current: &Snapshot, changes: &ChangeSet) -> StorageResult<()> {
        for (path, expectation) in &changes.expectations {
            let exists = current.get(&path.table, &path.key).is_some();
            match (expectation, exists) {
                (RowExpectation::Absent, true) => {
                    return Err(StorageError::RowAlreadyExists {
                        table: path.table.clone(),
                        key: path.key.clone(),
                    })
                }
                (RowExpectation::Present, false) => {
                    return Err(StorageError::RowNotFound {
                        table: path.table.clone(),
                        key: path.key.clone(),
                    })
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Write the snapshot next to its destination and rename it into place.
    fn persist(path: &Path, snapshot: &Snapshot) -> StorageResult<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut file = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut file, &snapshot.to_persisted())?;
        file.flush()?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("path", &self.inner.path)
            .field("version", &self.version())
            .finish()
    }
}
