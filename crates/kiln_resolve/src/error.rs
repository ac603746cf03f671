//! Error types for specifier resolution.

use std::path::PathBuf;

/// Errors produced while resolving an import specifier.
///
/// An unresolved import is a diagnostic for the file being compiled, not a
/// fault of the resolver, so callers are expected to recover from it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// No file on disk matches the specifier.
    #[error("unable to resolve '{specifier}' imported from {}", importer.display())]
    NotFound {
        /// The specifier as written in the import statement.
        specifier: String,
        /// The file containing the import.
        importer: PathBuf,
    },
}
