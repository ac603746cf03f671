//! The specifier resolution algorithm.
//!
//! Resolution order for a specifier:
//!
//! 1. Relative (`./x`, `../x`) and absolute specifiers name a path directly.
//! 2. A bare specifier whose leading segments match an alias key is rewritten
//!    and resolved from the rewritten form. It never falls back to the
//!    unaliased module search.
//! 3. Any other bare specifier is searched for in the configured module
//!    directories, from the importer's directory up to the filesystem root.
//!
//! A path is resolved as a file first (as-is, then with each extension), then
//! as a directory (manifest entry fields, then main files).

use std::path::{Path, PathBuf};

use kiln_config::ResolveConfig;

use crate::error::ResolveError;
use crate::path::{normalize, with_suffix};

/// Name of the package manifest consulted for directory entry points.
const PACKAGE_MANIFEST: &str = "package.json";

/// Resolves `specifier` as imported from `importer`.
///
/// `root_dir` is the project root, against which relative alias targets are
/// interpreted.
pub fn resolve(
    importer: &Path,
    specifier: &str,
    root_dir: &Path,
    config: &ResolveConfig,
) -> Result<PathBuf, ResolveError> {
    Resolver::new(root_dir, config).resolve(importer, specifier)
}

/// Specifier resolver bound to a project root and resolution rules.
///
/// Holds no state besides its configuration; every call reads the
/// filesystem afresh, so a `Resolver` can be shared across threads.
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'a> {
    root_dir: &'a Path,
    config: &'a ResolveConfig,
}

impl<'a> Resolver<'a> {
    /// Creates a resolver for the given project root and rules.
    pub fn new(root_dir: &'a Path, config: &'a ResolveConfig) -> Self {
        Self { root_dir, config }
    }

    /// Resolves `specifier` as imported from the file `importer`.
    ///
    /// Returns the absolute, lexically normalized path of the target file, or
    /// [`ResolveError::NotFound`] if nothing on disk matches.
    pub fn resolve(&self, importer: &Path, specifier: &str) -> Result<PathBuf, ResolveError> {
        match self.try_resolve(importer, specifier) {
            Some(path) => Ok(path),
            None => {
                tracing::debug!(
                    target = "kiln.resolve",
                    specifier,
                    importer = %importer.display(),
                    "specifier not found"
                );
                Err(ResolveError::NotFound {
                    specifier: specifier.to_string(),
                    importer: importer.to_path_buf(),
                })
            }
        }
    }

    fn try_resolve(&self, importer: &Path, specifier: &str) -> Option<PathBuf> {
        if is_relative(specifier) {
            let base = importer.parent().unwrap_or(Path::new("/"));
            return self.resolve_path(&normalize(&base.join(specifier)));
        }
        if Path::new(specifier).is_absolute() {
            return self.resolve_path(&normalize(Path::new(specifier)));
        }
        if let Some(target) = self.apply_alias(specifier) {
            return self.resolve_alias_target(importer, &target);
        }
        self.resolve_module(importer, specifier)
    }

    /// Rewrites `specifier` with the longest alias key matching its leading
    /// path segments, appending the unmatched remainder.
    fn apply_alias(&self, specifier: &str) -> Option<String> {
        let segments = split_segments(specifier);
        let (key_len, value) = self
            .config
            .alias
            .iter()
            .filter_map(|(key, value)| {
                let key_segments = split_segments(key);
                let matches = !key_segments.is_empty()
                    && key_segments.len() <= segments.len()
                    && key_segments.iter().zip(&segments).all(|(k, s)| k == s);
                matches.then_some((key_segments.len(), value))
            })
            .max_by_key(|(len, _)| *len)?;

        let rest = &segments[key_len..];
        if rest.is_empty() {
            Some(value.clone())
        } else {
            Some(format!("{}/{}", value.trim_end_matches('/'), rest.join("/")))
        }
    }

    fn resolve_alias_target(&self, importer: &Path, target: &str) -> Option<PathBuf> {
        if Path::new(target).is_absolute() {
            self.resolve_path(&normalize(Path::new(target)))
        } else if is_relative(target) {
            self.resolve_path(&normalize(&self.root_dir.join(target)))
        } else {
            self.resolve_module(importer, target)
        }
    }

    /// Searches the module directories for a bare specifier.
    ///
    /// `@scope/name` counts as one package identifier; whatever follows it is
    /// a subpath inside the package.
    fn resolve_module(&self, importer: &Path, specifier: &str) -> Option<PathBuf> {
        let segments = split_segments(specifier);
        if segments.is_empty() {
            return None;
        }
        let package_len = if segments[0].starts_with('@') && segments.len() > 1 {
            2
        } else {
            1
        };
        let (package, subpath) = segments.split_at(package_len);
        let importer_dir = importer.parent().unwrap_or(Path::new("/"));

        for modules_dir in &self.config.modules {
            let candidates: Vec<PathBuf> = if ResolveConfig::is_absolute_module_dir(modules_dir) {
                vec![PathBuf::from(modules_dir)]
            } else {
                importer_dir
                    .ancestors()
                    .map(|ancestor| ancestor.join(modules_dir))
                    .collect()
            };

            for candidate in candidates {
                if !candidate.is_dir() {
                    continue;
                }
                let mut target = candidate;
                target.extend(package.iter().chain(subpath));
                if let Some(found) = self.resolve_path(&normalize(&target)) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Resolves a concrete path as a file, falling back to directory lookup.
    fn resolve_path(&self, path: &Path) -> Option<PathBuf> {
        self.resolve_file(path).or_else(|| {
            if path.is_dir() {
                self.resolve_directory(path)
            } else {
                None
            }
        })
    }

    /// Returns `path` if it is a file, else the first `path + ext` that is.
    fn resolve_file(&self, path: &Path) -> Option<PathBuf> {
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        self.config
            .extensions
            .iter()
            .map(|ext| with_suffix(path, ext))
            .find(|candidate| candidate.is_file())
    }

    /// Resolves a directory to its entry file.
    ///
    /// Manifest entry fields take priority over main-file names.
    fn resolve_directory(&self, dir: &Path) -> Option<PathBuf> {
        self.resolve_manifest_entry(dir)
            .or_else(|| self.resolve_main_file(dir))
    }

    fn resolve_manifest_entry(&self, dir: &Path) -> Option<PathBuf> {
        let manifest_path = dir.join(PACKAGE_MANIFEST);
        if !manifest_path.is_file() {
            return None;
        }
        let manifest = match read_manifest(&manifest_path) {
            Ok(manifest) => manifest,
            Err(reason) => {
                tracing::debug!(
                    target = "kiln.resolve",
                    path = %manifest_path.display(),
                    error = %reason,
                    "ignoring unreadable package manifest"
                );
                return None;
            }
        };

        for field in &self.config.main_fields {
            let Some(entry) = manifest.get(field).and_then(|v| v.as_str()) else {
                continue;
            };
            if entry.is_empty() {
                continue;
            }
            let entry_path = normalize(&dir.join(entry));
            if let Some(found) = self.resolve_file(&entry_path) {
                return Some(found);
            }
            if entry_path.is_dir() {
                if let Some(found) = self.resolve_main_file(&entry_path) {
                    return Some(found);
                }
            }
        }
        None
    }

    fn resolve_main_file(&self, dir: &Path) -> Option<PathBuf> {
        self.config
            .main_files
            .iter()
            .find_map(|main_file| self.resolve_file(&dir.join(main_file)))
    }
}

fn read_manifest(path: &Path) -> Result<serde_json::Value, String> {
    let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&content).map_err(|e| e.to_string())
}

fn is_relative(specifier: &str) -> bool {
    specifier == "."
        || specifier == ".."
        || specifier.starts_with("./")
        || specifier.starts_with("../")
}

fn split_segments(specifier: &str) -> Vec<&str> {
    specifier.split('/').filter(|s| !s.is_empty()).collect()
}
