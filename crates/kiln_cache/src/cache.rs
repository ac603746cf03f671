//! High-level cache orchestrator.
//!
//! The `Cache` type ties the persistent store, the import resolver and the
//! plugin fingerprint into the interface the transform pipeline uses: ask
//! whether a file is stale, commit a freshly compiled artifact together with
//! its imports, and serve cached artifacts back.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use kiln_config::ProjectConfig;
use kiln_resolve::{ResolveError, Resolver};

use crate::artifact::Artifact;
use crate::error::CacheError;
use crate::fingerprint::{CachePlugin, PluginFingerprint};
use crate::graph::DependencyGraph;
use crate::hasher::SourceHasher;
use crate::index::CacheIndex;
use crate::record::{CacheId, CacheRecord};
use crate::staleness::{Staleness, StalenessChecker, SweepReport};
use crate::store::PersistentStore;

/// Version written to the cache's version marker. A cache written by any
/// other version is discarded on open.
pub const CACHE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result of [`Cache::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Opaque id the artifact is stored under.
    pub id: CacheId,
    /// Resolved dependencies, in first-import order.
    pub dependencies: Vec<PathBuf>,
    /// Specifiers that could not be resolved. They are not recorded as
    /// dependencies.
    pub unresolved: Vec<ResolveError>,
}

/// Incremental compilation cache for one project.
///
/// All operations take `&self`; a `Cache` can be shared between threads
/// compiling different files.
pub struct Cache {
    config: ProjectConfig,
    store: PersistentStore,
    fingerprint: PluginFingerprint,
}

impl Cache {
    /// Opens the cache configured for the project with the active plugin set.
    ///
    /// Nothing besides the version marker is read until first use.
    pub fn open(config: ProjectConfig, plugins: &[&dyn CachePlugin]) -> Result<Self, CacheError> {
        Self::open_with_version(config, plugins, CACHE_VERSION)
    }

    /// Like [`open`](Self::open), with an explicit tool version.
    pub fn open_with_version(
        config: ProjectConfig,
        plugins: &[&dyn CachePlugin],
        version: &str,
    ) -> Result<Self, CacheError> {
        let store = PersistentStore::open(&config.cache_dir(), version, config.cache.debug)?;
        let fingerprint = PluginFingerprint::from_plugins(plugins.iter().copied());
        Ok(Self {
            config,
            store,
            fingerprint,
        })
    }

    /// Returns the project configuration.
    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &PersistentStore {
        &self.store
    }

    /// Returns the fingerprint of the plugin set the cache was opened with.
    pub fn fingerprint(&self) -> &PluginFingerprint {
        &self.fingerprint
    }

    /// Path -> id -> record view.
    pub fn index(&self) -> CacheIndex<'_> {
        CacheIndex::new(&self.store)
    }

    /// Reverse dependency view.
    pub fn graph(&self) -> DependencyGraph<'_> {
        DependencyGraph::new(&self.store)
    }

    /// Staleness checks against the active plugin set.
    pub fn checker(&self) -> StalenessChecker<'_> {
        StalenessChecker::new(&self.store, &self.fingerprint)
    }

    /// Resolver using the project's resolution rules.
    pub fn resolver(&self) -> Resolver<'_> {
        Resolver::new(&self.config.root_dir, &self.config.resolve)
    }

    /// Resolves an import specifier written in `importer`.
    pub fn resolve(&self, importer: &Path, specifier: &str) -> Result<PathBuf, ResolveError> {
        self.resolver().resolve(importer, specifier)
    }

    /// Returns `true` if the cached artifact for `file` must be regenerated.
    pub fn is_stale(&self, file: &Path) -> bool {
        self.checker().is_stale(file)
    }

    /// Checks `file` and reports why it is stale, if it is.
    pub fn check(&self, file: &Path) -> Staleness {
        self.checker().check(file)
    }

    /// Returns the stale files among `files`, in input order.
    pub fn stale_files(&self, files: &[PathBuf]) -> Vec<PathBuf> {
        self.checker().stale_files(files)
    }

    /// Records a freshly compiled artifact for `file`.
    ///
    /// Each import specifier found in the source is resolved; duplicates are
    /// resolved once. The file and its dependencies are stamped, the artifact
    /// is written, and the record is replaced together with the dependents
    /// index. Unresolved specifiers are reported in the outcome and never
    /// fail the commit. Paths that are not valid UTF-8 fail it with
    /// [`CacheError::NonUtf8Path`] and leave the cache unchanged.
    pub fn commit<I>(
        &self,
        file: &Path,
        specifiers: I,
        artifact: &Artifact,
    ) -> Result<CommitOutcome, CacheError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let resolver = self.resolver();
        let mut seen = HashSet::new();
        let mut dependencies = Vec::new();
        let mut unresolved = Vec::new();

        for specifier in specifiers {
            let specifier = specifier.as_ref();
            if !seen.insert(specifier.to_string()) {
                continue;
            }
            match resolver.resolve(file, specifier) {
                Ok(path) => {
                    if !dependencies.contains(&path) {
                        dependencies.push(path);
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        target = "kiln.cache",
                        path = %file.display(),
                        specifier,
                        "import could not be resolved; not tracked as a dependency"
                    );
                    unresolved.push(err);
                }
            }
        }

        // The tables are JSON keyed by path; reject what they cannot hold
        // before anything is written.
        CacheError::ensure_utf8(file)?;
        for dependency in &dependencies {
            CacheError::ensure_utf8(dependency)?;
        }

        let stamp = SourceHasher::stamp(file)?;
        let deps: BTreeSet<PathBuf> = dependencies.iter().cloned().collect();
        let snapshot = SourceHasher::snapshot(&deps);

        let index = self.index();
        let id = index.assign_id(file)?;
        self.store.artifacts().write(&id, artifact)?;

        let mut record = CacheRecord::new(stamp, self.fingerprint.as_str());
        if !snapshot.is_empty() {
            record.dependencies = Some(snapshot);
        }
        index.commit(file, record)?;

        tracing::debug!(
            target = "kiln.cache",
            path = %file.display(),
            id = %id,
            dependencies = dependencies.len(),
            "committed artifact"
        );
        Ok(CommitOutcome {
            id,
            dependencies,
            unresolved,
        })
    }

    /// Returns the cached artifact for `file` without checking staleness.
    pub fn load_artifact(&self, file: &Path) -> Option<Artifact> {
        let id = self.index().id_of(file)?;
        self.store.artifacts().read(&id)
    }

    /// Evicts `file`. Files depending on it are left in place.
    pub fn remove_file(&self, file: &Path) -> bool {
        self.index().remove_file(file)
    }

    /// Evicts entries whose source or any transitive dependency is gone, then
    /// saves.
    pub fn verify_and_sweep(&self) -> Result<SweepReport, CacheError> {
        self.checker().verify_and_sweep()
    }

    /// Removes artifact and record files no longer referenced by any tracked
    /// path. Returns the number of files removed.
    pub fn gc(&self) -> Result<usize, CacheError> {
        let live = self.index().ids();
        self.store.artifacts().gc(&live)
    }

    /// Writes every changed table and record to disk.
    pub fn save(&self) -> Result<(), CacheError> {
        self.store.save()
    }
}
