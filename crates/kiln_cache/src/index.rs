//! Source path -> cache id -> cache record lookups.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::error::CacheError;
use crate::graph;
use crate::record::{CacheId, CacheRecord};
use crate::store::PersistentStore;

/// View over the path -> id and id -> record tables of a store.
///
/// Lock order for operations touching several tables is ids, then records,
/// then dependents.
#[derive(Clone, Copy)]
pub struct CacheIndex<'s> {
    store: &'s PersistentStore,
}

impl<'s> CacheIndex<'s> {
    /// Creates an index view over `store`.
    pub fn new(store: &'s PersistentStore) -> Self {
        Self { store }
    }

    /// Returns the id assigned to `path`, if any.
    pub fn id_of(&self, path: &Path) -> Option<CacheId> {
        self.store.ids().read().get(path).cloned()
    }

    /// Returns the id for `path`, assigning one if it has none yet.
    ///
    /// Fails for paths that are not valid UTF-8, which the id table cannot
    /// store.
    pub fn assign_id(&self, path: &Path) -> Result<CacheId, CacheError> {
        if let Some(id) = self.id_of(path) {
            return Ok(id);
        }
        CacheError::ensure_utf8(path)?;
        Ok(self
            .store
            .ids()
            .write()
            .entry(path.to_path_buf())
            .or_insert_with(|| CacheId::for_path(path))
            .clone())
    }

    /// Returns the cache record for `path`, if one exists.
    pub fn record(&self, path: &Path) -> Option<CacheRecord> {
        let id = self.id_of(path)?;
        self.store.records().get(&id)
    }

    /// Returns `true` if `path` has an id assigned.
    pub fn contains(&self, path: &Path) -> bool {
        self.store.ids().read().contains_key(path)
    }

    /// Returns every tracked source path.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.store.ids().read().keys().cloned().collect()
    }

    /// Returns every assigned id.
    pub fn ids(&self) -> BTreeSet<CacheId> {
        self.store.ids().read().values().cloned().collect()
    }

    /// Returns the number of tracked source paths.
    pub fn len(&self) -> usize {
        self.store.ids().read().len()
    }

    /// Returns `true` if no source path is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces the record for `path` and updates the dependents index to
    /// match its dependencies, as one critical section.
    ///
    /// If the previous record is missing or unreadable, any edges left over
    /// from it are dropped before the new ones are added.
    pub fn commit(&self, path: &Path, record: CacheRecord) -> Result<CacheId, CacheError> {
        for dependency in record.dependency_paths() {
            CacheError::ensure_utf8(dependency)?;
        }
        let id = self.assign_id(path)?;
        let mut records = self.store.records().write();

        let previous: Option<BTreeSet<PathBuf>> = records
            .get(&id)
            .map(|r| r.dependency_paths().cloned().collect());
        let next: BTreeSet<PathBuf> = record.dependency_paths().cloned().collect();
        match previous {
            Some(previous) if previous == next => {}
            Some(previous) => {
                let mut dependents = self.store.dependents().write();
                graph::apply_diff(&mut dependents, path, &previous, &next);
            }
            None => {
                let mut dependents = self.store.dependents().write();
                graph::remove_dependent(&mut dependents, path);
                if !next.is_empty() {
                    graph::apply_diff(&mut dependents, path, &BTreeSet::new(), &next);
                }
            }
        }

        records.insert(id.clone(), record);
        Ok(id)
    }

    /// Evicts `path`: drops its id, record, artifact, and its own entries in
    /// the dependents index.
    ///
    /// Files that depend on `path` are left alone. Returns `false` if `path`
    /// was not tracked.
    pub fn remove_file(&self, path: &Path) -> bool {
        let mut ids = self.store.ids().write();
        let Some(id) = ids.remove(path) else {
            return false;
        };
        let mut records = self.store.records().write();
        drop(ids);

        match records.remove(&id) {
            Some(record) => {
                let previous: BTreeSet<PathBuf> = record.dependency_paths().cloned().collect();
                if !previous.is_empty() {
                    let mut dependents = self.store.dependents().write();
                    graph::apply_diff(&mut dependents, path, &previous, &BTreeSet::new());
                }
            }
            None => graph::remove_dependent(&mut self.store.dependents().write(), path),
        }
        drop(records);

        self.store.artifacts().remove(&id);
        tracing::debug!(
            target = "kiln.cache",
            path = %path.display(),
            id = %id,
            "evicted cache entry"
        );
        true
    }
}
