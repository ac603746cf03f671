//! Error types for cache operations.

use std::path::{Path, PathBuf};

/// Errors that can occur during cache operations.
///
/// Most cache reads are fail-safe: a missing or corrupt table degrades to an
/// empty one and a cache miss, so these errors mostly surface from writes
/// (`save`, artifact writes) and from stamping the file being committed.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// An I/O error occurred while reading or writing a cache or source file.
    #[error("cache I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A persisted table or record could not be parsed.
    #[error("corrupt cache record {path}: {reason}")]
    CorruptRecord {
        /// The file that failed to parse.
        path: PathBuf,
        /// Description of the parse failure.
        reason: String,
    },

    /// A table could not be serialized.
    #[error("serialization error: {reason}")]
    Serialization {
        /// Description of the serialization failure.
        reason: String,
    },

    /// The operation needs a cache record for a file that has none.
    #[error("no cache record for {path}")]
    NotCached {
        /// The source file without a record.
        path: PathBuf,
    },

    /// A path that cannot be stored in the JSON tables.
    #[error("path is not valid UTF-8: {path}")]
    NonUtf8Path {
        /// The offending source or dependency path.
        path: PathBuf,
    },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Rejects paths the persisted tables cannot represent.
    pub(crate) fn ensure_utf8(path: &Path) -> Result<(), Self> {
        match path.to_str() {
            Some(_) => Ok(()),
            None => Err(Self::NonUtf8Path {
                path: path.to_path_buf(),
            }),
        }
    }
}
