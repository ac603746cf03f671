//! Configuration types deserialized from `kiln.toml`.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The top-level project configuration parsed from `kiln.toml`.
///
/// Every section is optional; a missing file section falls back to the
/// defaults documented on each type.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    /// Project root directory. Filled in by the loader, never read from TOML.
    #[serde(skip)]
    pub root_dir: PathBuf,
    /// Cache location and persistence settings.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Module resolution rules.
    #[serde(default)]
    pub resolve: ResolveConfig,
}

impl ProjectConfig {
    /// Creates a configuration with all defaults for the given project root.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            cache: CacheConfig::default(),
            resolve: ResolveConfig::default(),
        }
    }

    /// Returns the absolute cache directory.
    ///
    /// A relative `cache.dir` is interpreted against the project root.
    pub fn cache_dir(&self) -> PathBuf {
        if self.cache.dir.is_absolute() {
            self.cache.dir.clone()
        } else {
            self.root_dir.join(&self.cache.dir)
        }
    }
}

/// Cache persistence settings (`[cache]`).
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Directory holding all cache tables and artifacts.
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    /// Write pretty-printed tables and `.js`-suffixed artifacts for inspection.
    #[serde(default)]
    pub debug: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            debug: false,
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".kiln_cache")
}

/// Module resolution rules (`[resolve]`).
///
/// Lists are ordered and the first match wins. Absent keys fall back to
/// Node-style defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ResolveConfig {
    /// Extensions tried, in order, when a path does not name an existing file.
    pub extensions: Vec<String>,
    /// Specifier-prefix substitutions, matched on whole leading path segments.
    pub alias: BTreeMap<String, String>,
    /// Module directory names searched from the importer upward. Absolute
    /// entries are searched as-is.
    pub modules: Vec<String>,
    /// File names (without extension) tried when a path names a directory.
    pub main_files: Vec<String>,
    /// `package.json` fields consulted, in order, when a path names a directory.
    pub main_fields: Vec<String>,
}

impl Default for ResolveConfig {
    fn default() -> Self {
        Self {
            extensions: [".tsx", ".ts", ".jsx", ".mjs", ".js", ".es6", ".es", ".json"]
                .into_iter()
                .map(String::from)
                .collect(),
            alias: BTreeMap::new(),
            modules: vec!["node_modules".to_string()],
            main_files: vec!["index".to_string()],
            main_fields: vec!["module".to_string(), "main".to_string()],
        }
    }
}

impl ResolveConfig {
    /// Replaces the extension list.
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an alias entry.
    pub fn with_alias(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.alias.insert(key.into(), value.into());
        self
    }

    /// Replaces the module directory list.
    pub fn with_modules<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.modules = modules.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces the main-file list.
    pub fn with_main_files<I, S>(mut self, main_files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.main_files = main_files.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces the manifest entry-field list.
    pub fn with_main_fields<I, S>(mut self, main_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.main_fields = main_fields.into_iter().map(Into::into).collect();
        self
    }

    /// Returns `true` if `dir` is given as an absolute module directory.
    pub fn is_absolute_module_dir(dir: &str) -> bool {
        Path::new(dir).is_absolute()
    }
}
