//! Compiled artifact storage.
//!
//! Each cached source file owns one compiled artifact and optionally a source
//! map, stored in the cache's `files/` directory under the file's opaque id.
//! In debug mode the artifact gets a `.js` suffix so it can be opened in an
//! editor directly.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::error::CacheError;
use crate::record::CacheId;
use crate::store::{atomic_write, remove_file_best_effort};

/// Compiled output for one source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// The transformed code served to the browser.
    pub code: String,
    /// Source map for `code`, if the pipeline produced one.
    pub source_map: Option<String>,
}

impl Artifact {
    /// Creates an artifact without a source map.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            source_map: None,
        }
    }

    /// Attaches a source map.
    pub fn with_source_map(mut self, source_map: impl Into<String>) -> Self {
        self.source_map = Some(source_map.into());
        self
    }
}

/// Id-addressed store for compiled artifacts.
///
/// Artifacts live at `<files_dir>/<id>[.js]` with the source map next to
/// them at `<files_dir>/<id>[.js].map`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    files_dir: PathBuf,
    debug: bool,
}

impl ArtifactStore {
    /// Creates an artifact store rooted at the given directory.
    pub fn new(files_dir: impl Into<PathBuf>, debug: bool) -> Self {
        Self {
            files_dir: files_dir.into(),
            debug,
        }
    }

    /// Returns the directory holding artifacts.
    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    /// Returns the file path of the artifact for `id`.
    pub fn artifact_path(&self, id: &CacheId) -> PathBuf {
        if self.debug {
            self.files_dir.join(format!("{id}.js"))
        } else {
            self.files_dir.join(id.as_str())
        }
    }

    /// Returns the file path of the source map for `id`.
    pub fn source_map_path(&self, id: &CacheId) -> PathBuf {
        let mut name = self.artifact_path(id).into_os_string();
        name.push(".map");
        PathBuf::from(name)
    }

    /// Writes the artifact for `id`, replacing any previous one.
    ///
    /// A stale source map from an earlier compile is removed when the new
    /// artifact has none.
    pub fn write(&self, id: &CacheId, artifact: &Artifact) -> Result<(), CacheError> {
        atomic_write(&self.artifact_path(id), artifact.code.as_bytes())?;

        let map_path = self.source_map_path(id);
        match &artifact.source_map {
            Some(map) => atomic_write(&map_path, map.as_bytes()),
            None => {
                remove_file_best_effort(&map_path);
                Ok(())
            }
        }
    }

    /// Reads the artifact for `id`.
    ///
    /// Returns `None` if the artifact is missing or unreadable. A missing
    /// source map just leaves `source_map` empty.
    pub fn read(&self, id: &CacheId) -> Option<Artifact> {
        let code = std::fs::read_to_string(self.artifact_path(id)).ok()?;
        let source_map = std::fs::read_to_string(self.source_map_path(id)).ok();
        Some(Artifact { code, source_map })
    }

    /// Deletes the artifact and source map for `id`.
    pub fn remove(&self, id: &CacheId) {
        remove_file_best_effort(&self.artifact_path(id));
        remove_file_best_effort(&self.source_map_path(id));
    }

    /// Removes files whose id is not in the set of live ids.
    ///
    /// Covers artifacts, source maps and records alike, since all of them
    /// are named `<id>` plus suffixes. Returns the number of files removed.
    pub fn gc(&self, live_ids: &BTreeSet<CacheId>) -> Result<usize, CacheError> {
        let dir = &self.files_dir;
        if !dir.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        let entries = std::fs::read_dir(dir).map_err(|e| CacheError::io(dir, e))?;

        for entry in entries {
            let entry = entry.map_err(|e| CacheError::io(dir, e))?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let stem = name.split('.').next().unwrap_or(name);
            let live = CacheId::try_from(stem.to_string())
                .map(|id| live_ids.contains(&id))
                .unwrap_or(false);
            if !live && path.is_file() {
                std::fs::remove_file(&path).map_err(|e| CacheError::io(&path, e))?;
                removed += 1;
            }
        }

        Ok(removed)
    }
}
