//! Source file hashing and stamping.
//!
//! A [`FileStamp`] pairs a file's content hash with its modification time.
//! The mtime is the cheap first check; the hash is only computed when the
//! caller needs to know whether content actually changed.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use kiln_common::ContentHash;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::record::DependencyStamp;

/// Content hash and modification time of a file at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStamp {
    /// Content hash of the file bytes.
    pub hash: ContentHash,
    /// Modification time in whole milliseconds since the Unix epoch.
    pub mtime: u64,
}

/// Utility for computing content hashes and stamps of source files.
pub struct SourceHasher;

impl SourceHasher {
    /// Computes the content hash of a single file.
    pub fn hash_file(path: &Path) -> Result<ContentHash, CacheError> {
        let content = std::fs::read(path).map_err(|e| CacheError::io(path, e))?;
        Ok(ContentHash::from_bytes(&content))
    }

    /// Returns the modification time of a file, truncated to milliseconds.
    pub fn mtime(path: &Path) -> Result<u64, CacheError> {
        let modified = std::fs::metadata(path)
            .and_then(|meta| meta.modified())
            .map_err(|e| CacheError::io(path, e))?;
        Ok(modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0))
    }

    /// Stamps a file with its current content hash and mtime.
    pub fn stamp(path: &Path) -> Result<FileStamp, CacheError> {
        let mtime = Self::mtime(path)?;
        let hash = Self::hash_file(path)?;
        Ok(FileStamp { hash, mtime })
    }

    /// Snapshots a set of dependencies concurrently.
    ///
    /// A dependency that cannot be read gets an empty [`DependencyStamp`], so
    /// it reads as changed once it becomes available.
    pub fn snapshot(paths: &BTreeSet<PathBuf>) -> BTreeMap<PathBuf, DependencyStamp> {
        paths
            .par_iter()
            .map(|path| {
                let stamp = match Self::stamp(path) {
                    Ok(stamp) => stamp.into(),
                    Err(err) => {
                        tracing::debug!(
                            target = "kiln.cache",
                            path = %path.display(),
                            error = %err,
                            "dependency unavailable at snapshot time"
                        );
                        DependencyStamp::default()
                    }
                };
                (path.clone(), stamp)
            })
            .collect()
    }
}
