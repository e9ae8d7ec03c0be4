//! Manager registry and its configuration.
//!
//! Every named manager is constructed explicitly and registered here; scopes
//! resolve their manager by name through the registry they are given.
//!
//! # Configuration file
//!
//! ```json
//! {
//!   "managers": {
//!     "default": { "backend": { "kind": "noop" } },
//!     "documents": {
//!       "backend": { "kind": "document", "path": "data/documents.json" },
//!       "retries": 3,
//!       "isolation_level": "SERIALIZABLE",
//!       "user_params": { "tenant": "acme" }
//!     }
//!   }
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backend::{DocumentBackend, NoopBackend};
use crate::storage::DocumentStore;
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::manager::TransactionManager;
use crate::transaction::options::ManagerConfig;

/// Name of the manager used when a scope names none.
pub const DEFAULT_MANAGER_NAME: &str = "default";

/// Backend selection for one configured manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Noop,
    /// Document store, in memory unless `path` is given.
    Document {
        #[serde(default)]
        path: Option<PathBuf>,
    },
}

/// One manager in a [`RegistryConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerEntry {
    pub backend: BackendConfig,
    #[serde(flatten)]
    pub config: ManagerConfig,
}

/// Registry configuration, usually loaded from a JSON file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub managers: BTreeMap<String, ManagerEntry>,
}

impl RegistryConfig {
    pub fn from_json(json: &str) -> TransactionResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| TransactionError::InvalidConfig(format!("registry config: {}", e)))
    }

    pub fn from_path(path: impl AsRef<Path>) -> TransactionResult<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| {
            TransactionError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }
}

/// Managers by name.
#[derive(Debug, Clone, Default)]
pub struct ManagerRegistry {
    managers: HashMap<String, TransactionManager>,
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one manager per configured entry.
    ///
    /// Document stores with a `path` are opened (and their existing
    /// contents loaded) here. Entries naming the same file share one store,
    /// so their commits are serialized and validated against each other.
    pub fn from_config(config: &RegistryConfig) -> TransactionResult<Self> {
        let mut registry = Self::new();
        let mut stores: HashMap<PathBuf, DocumentStore> = HashMap::new();
        for (name, entry) in &config.managers {
            let manager = match &entry.backend {
                BackendConfig::Noop => {
                    TransactionManager::new(name.as_str(), NoopBackend::new(), entry.config.clone())
                }
                BackendConfig::Document { path } => {
                    let store = match path {
                        Some(path) => Self::shared_store(&mut stores, path)?,
                        None => DocumentStore::in_memory(),
                    };
                    TransactionManager::new(
                        name.as_str(),
                        DocumentBackend::new(store),
                        entry.config.clone(),
                    )
                }
            };
            log::debug!("registry: configured manager '{}' ({})", name, manager.kind());
            registry.register(manager);
        }
        Ok(registry)
    }

    fn shared_store(
        stores: &mut HashMap<PathBuf, DocumentStore>,
        path: &Path,
    ) -> TransactionResult<DocumentStore> {
        // The file may not exist before the first commit; resolve its directory instead.
        let key = fs::canonicalize(path)
            .or_else(|_| {
                let dir = match path.parent() {
                    Some(parent) if !parent.as_os_str().is_empty() => parent,
                    _ => Path::new("."),
                };
                fs::canonicalize(dir).map(|dir| dir.join(path.file_name().unwrap_or_default()))
            })
            .unwrap_or_else(|_| path.to_path_buf());
        if let Some(store) = stores.get(&key) {
            log::debug!("registry: sharing document store at {}", path.display());
            return Ok(store.clone());
        }
        let store = DocumentStore::open(path)?;
        stores.insert(key, store.clone());
        Ok(store)
    }

    /// Register `manager` under its own name, returning the manager it replaces.
    pub fn register(&mut self, manager: TransactionManager) -> Option<TransactionManager> {
        let previous = self.managers.insert(manager.name().to_string(), manager);
        if let Some(previous) = &previous {
            log::warn!("registry: manager '{}' replaced", previous.name());
        }
        previous
    }

    pub fn get(&self, name: &str) -> TransactionResult<&TransactionManager> {
        self.managers
            .get(name)
            .ok_or_else(|| TransactionError::ManagerNotRegistered(name.to_string()))
    }

    /// The manager registered as [`DEFAULT_MANAGER_NAME`].
    pub fn default_manager(&self) -> TransactionResult<&TransactionManager> {
        self.get(DEFAULT_MANAGER_NAME)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.managers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.managers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }
}
