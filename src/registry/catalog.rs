//! Durable store catalog backends.
//!
//! The registry treats the catalog as a simple document store: load
//! everything at startup, upsert one store after each mutation. There are no
//! transactional guarantees beyond a single writer doing read-modify-write.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::error::RegistryError;

use super::store::Store;

/// Name of the catalog JSON file.
const CATALOG_FILENAME: &str = "stores.json";

/// Persistence backend for store documents.
pub trait StoreCatalog: Send + Sync {
    /// Loads every stored document.
    fn load_all(&self) -> Result<Vec<Store>, RegistryError>;

    /// Inserts or replaces one store document.
    fn upsert(&self, store: &Store) -> Result<(), RegistryError>;
}

/// Catalog stored as a single JSON array on disk.
pub struct JsonFileCatalog {
    /// Directory holding the catalog file.
    catalog_path: PathBuf,
    /// Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl JsonFileCatalog {
    /// Create a catalog stored under the given directory.
    pub fn new(catalog_path: impl Into<PathBuf>) -> Self {
        Self {
            catalog_path: catalog_path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Path to the catalog file.
    pub fn file_path(&self) -> PathBuf {
        self.catalog_path.join(CATALOG_FILENAME)
    }

    fn read_file(path: &Path) -> Result<Vec<Store>, RegistryError> {
        if !path.exists() {
            return Ok(Vec::new());
        }

        let contents = fs::read_to_string(path)?;
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }

        Ok(serde_json::from_str(&contents)?)
    }
}

impl StoreCatalog for JsonFileCatalog {
    fn load_all(&self) -> Result<Vec<Store>, RegistryError> {
        Self::read_file(&self.file_path())
    }

    fn upsert(&self, store: &Store) -> Result<(), RegistryError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if !self.catalog_path.exists() {
            fs::create_dir_all(&self.catalog_path)?;
        }

        let path = self.file_path();
        let mut stores = Self::read_file(&path)?;
        match stores.iter_mut().find(|s| s.id == store.id) {
            Some(existing) => *existing = store.clone(),
            None => stores.push(store.clone()),
        }
        stores.sort_by(|a, b| a.id.cmp(&b.id));

        // Write-then-rename: readers never observe a partial file.
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_string_pretty(&stores)?)?;
        fs::rename(&tmp_path, &path)?;

        tracing::debug!(store_id = %store.id, path = %path.display(), "Persisted store");
        Ok(())
    }
}

/// Catalog kept only in memory; useful for tests and ephemeral runs.
#[derive(Default)]
pub struct InMemoryCatalog {
    stores: Mutex<HashMap<String, Store>>,
}

impl InMemoryCatalog {
    /// Creates an empty in-memory catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a catalog pre-populated with the given stores.
    pub fn with_stores(stores: impl IntoIterator<Item = Store>) -> Self {
        Self {
            stores: Mutex::new(stores.into_iter().map(|s| (s.id.clone(), s)).collect()),
        }
    }
}

impl StoreCatalog for InMemoryCatalog {
    fn load_all(&self) -> Result<Vec<Store>, RegistryError> {
        let stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(stores.values().cloned().collect())
    }

    fn upsert(&self, store: &Store) -> Result<(), RegistryError> {
        let mut stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        stores.insert(store.id.clone(), store.clone());
        Ok(())
    }
}
