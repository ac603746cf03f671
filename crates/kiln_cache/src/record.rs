//! Per-file cache records and their opaque identifiers.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use kiln_common::ContentHash;
use serde::{Deserialize, Serialize};

use crate::hasher::FileStamp;

/// Stable, path-independent name for a cached file's on-disk artifacts.
///
/// Derived from the source path when first assigned and then kept in the
/// path -> id table, so artifact filenames never carry path separators or
/// non-portable characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheId(String);

impl CacheId {
    /// Derives the id for a source path.
    pub fn for_path(path: &Path) -> Self {
        Self(ContentHash::from_bytes(path.as_os_str().as_encoded_bytes()).to_string())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CacheId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric()) {
            Ok(Self(value))
        } else {
            Err(format!("invalid cache id '{value}'"))
        }
    }
}

impl From<CacheId> for String {
    fn from(id: CacheId) -> Self {
        id.0
    }
}

impl fmt::Display for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Snapshot of a dependency taken when its dependent was last compiled.
///
/// Both fields are absent when the dependency did not exist at commit time;
/// such a snapshot never matches a file that appears later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DependencyStamp {
    /// Content hash of the dependency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<ContentHash>,
    /// Modification time of the dependency, in whole milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<u64>,
}

impl From<FileStamp> for DependencyStamp {
    fn from(stamp: FileStamp) -> Self {
        Self {
            hash: Some(stamp.hash),
            mtime: Some(stamp.mtime),
        }
    }
}

/// Cached state for a single source file.
///
/// `dependencies` is only meaningful while `content_hash`, `mtime` and
/// `plugin_fingerprint` still match the file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Content hash of the source when it was last compiled.
    pub content_hash: ContentHash,
    /// Modification time of the source, in whole milliseconds.
    pub mtime: u64,
    /// Fingerprint of the plugin set that produced the artifact.
    pub plugin_fingerprint: String,
    /// Resolved imports and their state at compile time. `None` when the file
    /// has no dependencies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<BTreeMap<PathBuf, DependencyStamp>>,
}

impl CacheRecord {
    /// Creates a record without dependencies.
    pub fn new(stamp: FileStamp, plugin_fingerprint: impl Into<String>) -> Self {
        Self {
            content_hash: stamp.hash,
            mtime: stamp.mtime,
            plugin_fingerprint: plugin_fingerprint.into(),
            dependencies: None,
        }
    }

    /// Returns the recorded dependency paths.
    pub fn dependency_paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.dependencies.iter().flat_map(|deps| deps.keys())
    }
}
