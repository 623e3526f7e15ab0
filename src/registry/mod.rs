//! Store registry module.
//!
//! This module provides:
//! - The `Store` model and its scheduling metadata
//! - Processing windows restricting when a store may run
//! - Durable catalog backends (JSON file, in-memory)
//! - The quarantine state machine
//!
//! # States
//!
//! ```text
//!   enable/disable            increment_failure_count ≥ threshold
//! Active ◄──────► Inactive    Active ─────────────────────────────► Quarantined
//!                                         quarantine_store
//!                             Quarantined ─────────────────────────► Active
//!                                       release_from_quarantine
//! ```
//!
//! `Active`/`Inactive` are administrator controlled. `Quarantined` is entered
//! by the orchestrator and left only through `release_from_quarantine`, which
//! also resets the failure count.

pub mod catalog;
pub mod store;
pub mod window;

pub use catalog::{InMemoryCatalog, JsonFileCatalog, StoreCatalog};
pub use store::{Priority, Store, StoreMetadata, StoreState};
pub use window::ProcessingWindow;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::RegistryError;

/// Catalog of stores and their scheduling state.
///
/// The in-memory map is the single source of truth during a run; every
/// mutation is written through to the catalog before it becomes visible.
pub struct StoreRegistry {
    /// Cached store documents keyed by id.
    stores: RwLock<HashMap<String, Store>>,
    /// Durable backend.
    catalog: Arc<dyn StoreCatalog>,
}

impl StoreRegistry {
    /// Opens a registry, loading every store from the catalog.
    ///
    /// A quarantined store is always inactive; documents that disagree are
    /// corrected and written back.
    pub fn open(catalog: Arc<dyn StoreCatalog>) -> Result<Self, RegistryError> {
        let mut stores = catalog.load_all()?;
        for store in stores.iter_mut() {
            if store.metadata.quarantined && store.active {
                warn!(store_id = %store.id, "Quarantined store was marked active; deactivating");
                store.active = false;
                catalog.upsert(store)?;
            }
        }
        let stores: HashMap<String, Store> =
            stores.into_iter().map(|s| (s.id.clone(), s)).collect();

        info!(count = stores.len(), "Loaded store registry");

        Ok(Self {
            stores: RwLock::new(stores),
            catalog,
        })
    }

    /// Opens a registry backed by a fresh in-memory catalog.
    pub fn in_memory() -> Self {
        Self {
            stores: RwLock::new(HashMap::new()),
            catalog: Arc::new(InMemoryCatalog::new()),
        }
    }

    /// Register a new store.
    ///
    /// # Errors
    /// Returns `DuplicateStore` if the id is taken, `InvalidWindow` if the
    /// processing window does not parse.
    pub fn register(&self, mut store: Store) -> Result<String, RegistryError> {
        validate_window(&store)?;

        let mut stores = self.write();
        if stores.contains_key(&store.id) {
            return Err(RegistryError::DuplicateStore(store.id));
        }

        // Quarantined stores can never be active.
        if store.metadata.quarantined {
            store.active = false;
        }

        self.catalog.upsert(&store)?;
        let id = store.id.clone();
        stores.insert(id.clone(), store);

        Ok(id)
    }

    /// Replace a store's administrative fields (name, priority, config,
    /// window). Scheduling metadata is preserved.
    pub fn update(&self, store: Store) -> Result<(), RegistryError> {
        validate_window(&store)?;

        self.mutate(&store.id, |existing| {
            existing.name = store.name.clone();
            existing.priority = store.priority;
            existing.config = store.config.clone();
            existing.processing_window = store.processing_window.clone();
        })
        .map(|_| ())
    }

    /// Get a snapshot of a store by id.
    pub fn get(&self, store_id: &str) -> Option<Store> {
        self.read().get(store_id).cloned()
    }

    /// Get a snapshot of a store or fail with `NotFound`.
    pub fn require(&self, store_id: &str) -> Result<Store, RegistryError> {
        self.get(store_id)
            .ok_or_else(|| RegistryError::NotFound(store_id.to_string()))
    }

    /// All stores ordered by id.
    pub fn list(&self) -> Vec<Store> {
        let mut stores: Vec<Store> = self.read().values().cloned().collect();
        stores.sort_by(|a, b| a.id.cmp(&b.id));
        stores
    }

    /// Stores currently quarantined, ordered by id.
    pub fn quarantined_stores(&self) -> Vec<Store> {
        self.list()
            .into_iter()
            .filter(|s| s.metadata.quarantined)
            .collect()
    }

    /// Stores that a scheduling pass at `now` may enqueue: active, not
    /// quarantined, and inside their processing window.
    ///
    /// A window in `window_overrides` replaces the store's own window.
    pub fn eligible_stores(
        &self,
        now: DateTime<Utc>,
        window_overrides: &HashMap<String, ProcessingWindow>,
    ) -> Vec<Store> {
        self.list()
            .into_iter()
            .filter(|store| store.is_schedulable())
            .filter(|store| {
                let window = window_overrides
                    .get(&store.id)
                    .or(store.processing_window.as_ref());
                window.map_or(true, |w| w.contains(now))
            })
            .collect()
    }

    /// Get the total number of registered stores.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Administratively activate a store.
    ///
    /// # Errors
    /// Returns `Quarantined` for quarantined stores; use
    /// [`StoreRegistry::release_from_quarantine`] instead.
    pub fn enable(&self, store_id: &str) -> Result<(), RegistryError> {
        self.try_mutate(store_id, |store| {
            if store.metadata.quarantined {
                return Err(RegistryError::Quarantined(store.id.clone()));
            }
            store.active = true;
            Ok(())
        })?;
        info!(store_id = %store_id, "Store enabled");
        Ok(())
    }

    /// Administratively deactivate a store.
    pub fn disable(&self, store_id: &str) -> Result<(), RegistryError> {
        self.mutate(store_id, |store| store.active = false)?;
        info!(store_id = %store_id, "Store disabled");
        Ok(())
    }

    /// Increment a store's failure counter and return the new value.
    pub fn increment_failure_count(&self, store_id: &str) -> Result<u32, RegistryError> {
        let store = self.mutate(store_id, |store| {
            store.metadata.failure_count = store.metadata.failure_count.saturating_add(1);
        })?;
        Ok(store.metadata.failure_count)
    }

    /// Move a store into quarantine.
    pub fn quarantine_store(&self, store_id: &str, reason: &str) -> Result<(), RegistryError> {
        let now = Utc::now();
        let store = self.mutate(store_id, |store| {
            store.active = false;
            store.metadata.quarantined = true;
            store.metadata.quarantined_at = Some(now);
            store.metadata.quarantine_reason = Some(reason.to_string());
        })?;

        warn!(
            store_id = %store_id,
            failure_count = store.metadata.failure_count,
            reason = %reason,
            "Store quarantined"
        );
        Ok(())
    }

    /// Release a store from quarantine, resetting its failure count and
    /// reactivating it.
    pub fn release_from_quarantine(&self, store_id: &str) -> Result<(), RegistryError> {
        self.mutate(store_id, |store| {
            store.active = true;
            store.metadata.quarantined = false;
            store.metadata.quarantined_at = None;
            store.metadata.quarantine_reason = None;
            store.metadata.failure_count = 0;
        })?;

        info!(store_id = %store_id, "Store released from quarantine");
        Ok(())
    }

    /// Record a successful processing run.
    pub fn update_last_processed(
        &self,
        store_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        self.mutate(store_id, |store| store.metadata.last_processed_at = Some(at))
            .map(|_| ())
    }

    fn mutate<F>(&self, store_id: &str, f: F) -> Result<Store, RegistryError>
    where
        F: FnOnce(&mut Store),
    {
        self.try_mutate(store_id, |store| {
            f(store);
            Ok(())
        })
    }

    /// Apply `f` to a copy of the store, persist it, then publish it.
    ///
    /// The write lock is held throughout, so the check inside `f` and the
    /// update are atomic with respect to other registry calls.
    fn try_mutate<F>(&self, store_id: &str, f: F) -> Result<Store, RegistryError>
    where
        F: FnOnce(&mut Store) -> Result<(), RegistryError>,
    {
        let mut stores = self.write();
        let current = stores
            .get(store_id)
            .ok_or_else(|| RegistryError::NotFound(store_id.to_string()))?;

        let mut updated = current.clone();
        f(&mut updated)?;
        updated.metadata.updated_at = Utc::now();

        self.catalog.upsert(&updated)?;
        stores.insert(store_id.to_string(), updated.clone());

        Ok(updated)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Store>> {
        self.stores.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Store>> {
        self.stores.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn validate_window(store: &Store) -> Result<(), RegistryError> {
    match &store.processing_window {
        Some(window) => window
            .validate()
            .map_err(|reason| RegistryError::InvalidWindow {
                store_id: store.id.clone(),
                reason,
            }),
        None => Ok(()),
    }
}
