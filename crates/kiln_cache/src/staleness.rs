//! Cache validity checks and the startup verification sweep.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};

use rayon::prelude::*;

use crate::error::CacheError;
use crate::fingerprint::PluginFingerprint;
use crate::graph::DependencyGraph;
use crate::hasher::SourceHasher;
use crate::index::CacheIndex;
use crate::record::DependencyStamp;
use crate::store::PersistentStore;

/// Why a cached artifact can no longer be served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    /// The file has never been committed.
    NotCached,
    /// The active plugin set differs from the one that built the artifact.
    PluginsChanged,
    /// The source file could not be read or stat'ed.
    SourceUnreadable,
    /// The source content or mtime differs from the record.
    SourceChanged,
    /// A recorded dependency is gone or unreadable.
    DependencyMissing(PathBuf),
    /// A recorded dependency has different content.
    DependencyChanged(PathBuf),
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotCached => f.write_str("not cached"),
            Self::PluginsChanged => f.write_str("plugin set changed"),
            Self::SourceUnreadable => f.write_str("source unreadable"),
            Self::SourceChanged => f.write_str("source changed"),
            Self::DependencyMissing(path) => write!(f, "dependency missing: {}", path.display()),
            Self::DependencyChanged(path) => write!(f, "dependency changed: {}", path.display()),
        }
    }
}

/// Result of checking one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    /// The cached artifact can be served.
    Fresh,
    /// The file must be recompiled.
    Stale(StaleReason),
}

impl Staleness {
    /// Returns `true` for [`Staleness::Stale`].
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale(_))
    }
}

/// Outcome of [`StalenessChecker::verify_and_sweep`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Files evicted, in eviction order.
    pub evicted: Vec<PathBuf>,
    /// Number of sweep passes until nothing changed.
    pub passes: usize,
}

/// Decides whether cached artifacts are still valid.
///
/// Checks only take read locks, so distinct files can be checked from many
/// threads at once.
#[derive(Clone, Copy)]
pub struct StalenessChecker<'s> {
    store: &'s PersistentStore,
    fingerprint: &'s PluginFingerprint,
}

impl<'s> StalenessChecker<'s> {
    /// Creates a checker comparing records against `fingerprint`.
    pub fn new(store: &'s PersistentStore, fingerprint: &'s PluginFingerprint) -> Self {
        Self { store, fingerprint }
    }

    /// Checks whether the cached artifact for `file` is still valid.
    ///
    /// The source is compared by mtime and content hash. Dependencies take
    /// the cheap path first: an unchanged mtime passes without hashing, and
    /// a changed mtime with unchanged content (a touch) still passes.
    pub fn check(&self, file: &Path) -> Staleness {
        match self.find_stale_reason(file) {
            Some(reason) => {
                tracing::debug!(
                    target = "kiln.cache",
                    path = %file.display(),
                    reason = %reason,
                    "cached artifact is stale"
                );
                Staleness::Stale(reason)
            }
            None => Staleness::Fresh,
        }
    }

    /// Returns `true` if `file` must be recompiled.
    pub fn is_stale(&self, file: &Path) -> bool {
        self.check(file).is_stale()
    }

    /// Returns the stale files among `files`, checked concurrently, in input
    /// order.
    pub fn stale_files(&self, files: &[PathBuf]) -> Vec<PathBuf> {
        files
            .par_iter()
            .filter(|file| self.is_stale(file))
            .cloned()
            .collect()
    }

    fn find_stale_reason(&self, file: &Path) -> Option<StaleReason> {
        let Some(record) = CacheIndex::new(self.store).record(file) else {
            return Some(StaleReason::NotCached);
        };
        if record.plugin_fingerprint != self.fingerprint.as_str() {
            return Some(StaleReason::PluginsChanged);
        }

        match SourceHasher::mtime(file) {
            Ok(mtime) if mtime != record.mtime => return Some(StaleReason::SourceChanged),
            Ok(_) => {}
            Err(_) => return Some(StaleReason::SourceUnreadable),
        }
        match SourceHasher::hash_file(file) {
            Ok(hash) if hash != record.content_hash => return Some(StaleReason::SourceChanged),
            Ok(_) => {}
            Err(_) => return Some(StaleReason::SourceUnreadable),
        }

        record
            .dependencies
            .as_ref()?
            .par_iter()
            .find_map_any(|(path, stamp)| dependency_change(path, stamp))
    }

    /// Evicts every cached file whose source is gone, then every file that
    /// depends on a missing file, directly or transitively, and saves.
    ///
    /// Runs until a pass changes nothing. Entries that cannot be stat'ed are
    /// logged and skipped.
    pub fn verify_and_sweep(&self) -> Result<SweepReport, CacheError> {
        let index = CacheIndex::new(self.store);
        let graph = DependencyGraph::new(self.store);
        let mut report = SweepReport::default();

        loop {
            report.passes += 1;
            let before = report.evicted.len();

            let mut queue: VecDeque<PathBuf> = VecDeque::new();
            for path in index.paths() {
                if is_missing(&path) && index.remove_file(&path) {
                    queue.push_back(path.clone());
                    report.evicted.push(path);
                }
            }
            queue.extend(graph.dependencies().into_iter().filter(|dep| is_missing(dep)));

            while let Some(dependency) = queue.pop_front() {
                for evicted in graph.cascade_remove(&dependency) {
                    queue.push_back(evicted.clone());
                    report.evicted.push(evicted);
                }
            }

            if report.evicted.len() == before {
                break;
            }
        }

        if !report.evicted.is_empty() {
            tracing::debug!(
                target = "kiln.cache",
                evicted = report.evicted.len(),
                passes = report.passes,
                "verification sweep evicted stale entries"
            );
        }
        self.store.save()?;
        Ok(report)
    }
}

/// Two-tier check of one recorded dependency. `None` means unchanged.
fn dependency_change(path: &Path, stamp: &DependencyStamp) -> Option<StaleReason> {
    let Ok(mtime) = SourceHasher::mtime(path) else {
        return Some(StaleReason::DependencyMissing(path.to_path_buf()));
    };
    if stamp.mtime == Some(mtime) {
        return None;
    }
    match SourceHasher::hash_file(path) {
        Ok(hash) if stamp.hash == Some(hash) => None,
        Ok(_) => Some(StaleReason::DependencyChanged(path.to_path_buf())),
        Err(_) => Some(StaleReason::DependencyMissing(path.to_path_buf())),
    }
}

/// `true` only if `path` is confirmed absent. Stat failures count as present.
fn is_missing(path: &Path) -> bool {
    match path.try_exists() {
        Ok(exists) => !exists,
        Err(err) => {
            tracing::debug!(
                target = "kiln.cache",
                path = %path.display(),
                error = %err,
                "cannot stat cached path; skipping"
            );
            false
        }
    }
}
