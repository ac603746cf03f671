//! Reverse dependency index: dependency file -> files that import it.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::error::CacheError;
use crate::hasher::SourceHasher;
use crate::index::CacheIndex;
use crate::store::{DependentsMap, PersistentStore, TableGuard};

/// Applies the change from `previous` to `next` dependencies of `file`.
///
/// Added dependencies gain `file` as a dependent, removed ones lose it, and a
/// dependency left without dependents is dropped from the map.
pub(crate) fn apply_diff(
    map: &mut DependentsMap,
    file: &Path,
    previous: &BTreeSet<PathBuf>,
    next: &BTreeSet<PathBuf>,
) {
    for removed in previous.difference(next) {
        if let Some(dependents) = map.get_mut(removed) {
            dependents.remove(file);
            if dependents.is_empty() {
                map.remove(removed);
            }
        }
    }
    for added in next.difference(previous) {
        map.entry(added.clone())
            .or_default()
            .insert(file.to_path_buf());
    }
}

/// Removes `file` from every dependent set, dropping sets left empty.
///
/// Used when `file` has no readable record, so its recorded edges are
/// unknown. Leaves the map untouched (and clean) if `file` is not listed.
pub(crate) fn remove_dependent(map: &mut TableGuard<'_, DependentsMap>, file: &Path) {
    if !map.values().any(|dependents| dependents.contains(file)) {
        return;
    }
    map.retain(|_, dependents| {
        dependents.remove(file);
        !dependents.is_empty()
    });
}

/// View over the dependents table of a store.
#[derive(Clone, Copy)]
pub struct DependencyGraph<'s> {
    store: &'s PersistentStore,
}

impl<'s> DependencyGraph<'s> {
    /// Creates a graph view over `store`.
    pub fn new(store: &'s PersistentStore) -> Self {
        Self { store }
    }

    /// Replaces the recorded dependency set of `file` with `deps`.
    ///
    /// The dependencies are stamped with their current hash and mtime. The
    /// record update and the dependents update happen under the records lock,
    /// so readers never see one without the other.
    pub fn set_dependencies(&self, file: &Path, deps: BTreeSet<PathBuf>) -> Result<(), CacheError> {
        for dep in &deps {
            CacheError::ensure_utf8(dep)?;
        }
        let index = CacheIndex::new(self.store);
        let id = index.id_of(file).ok_or_else(|| CacheError::NotCached {
            path: file.to_path_buf(),
        })?;

        // Hash outside the locks; this is the slow part.
        let snapshot = SourceHasher::snapshot(&deps);

        let mut records = self.store.records().write();
        let mut record = records
            .get(&id)
            .cloned()
            .ok_or_else(|| CacheError::NotCached {
                path: file.to_path_buf(),
            })?;

        let previous: BTreeSet<PathBuf> = record.dependency_paths().cloned().collect();
        if previous != deps {
            let mut dependents = self.store.dependents().write();
            apply_diff(&mut dependents, file, &previous, &deps);
        }

        record.dependencies = if snapshot.is_empty() {
            None
        } else {
            Some(snapshot)
        };
        records.insert(id, record);
        Ok(())
    }

    /// Returns the files recorded as importing `dependency`.
    pub fn dependents_of(&self, dependency: &Path) -> BTreeSet<PathBuf> {
        self.store
            .dependents()
            .read()
            .get(dependency)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns every path that at least one cached file depends on.
    pub fn dependencies(&self) -> Vec<PathBuf> {
        self.store.dependents().read().keys().cloned().collect()
    }

    /// Evicts `file` from the cache. Its dependents are not touched.
    pub fn remove_file(&self, file: &Path) -> bool {
        CacheIndex::new(self.store).remove_file(file)
    }

    /// Drops `dependency` from the index and evicts every direct dependent.
    ///
    /// One level only; dependents of the evicted files are left for the
    /// caller to cascade. Returns the files actually evicted.
    pub fn cascade_remove(&self, dependency: &Path) -> Vec<PathBuf> {
        let dependents = self.store.dependents().write().remove(dependency);
        let Some(dependents) = dependents else {
            return Vec::new();
        };

        let evicted: Vec<PathBuf> = dependents
            .into_iter()
            .filter(|dependent| self.remove_file(dependent))
            .collect();
        tracing::debug!(
            target = "kiln.cache",
            dependency = %dependency.display(),
            evicted = evicted.len(),
            "cascaded removal of dependency"
        );
        evicted
    }
}
