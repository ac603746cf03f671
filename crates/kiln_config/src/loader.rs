//! Configuration file loading and validation.

use crate::error::ConfigError;
use crate::types::ProjectConfig;
use std::path::{Component, Path, PathBuf};

/// Name of the configuration file at the project root.
pub const CONFIG_FILE: &str = "kiln.toml";

/// Loads and validates the configuration for a project directory.
///
/// Reads `<project_dir>/kiln.toml` if present. A project without a config
/// file gets the defaults.
pub fn load_config(project_dir: &Path) -> Result<ProjectConfig, ConfigError> {
    let config_path = project_dir.join(CONFIG_FILE);
    if !config_path.exists() {
        return Ok(ProjectConfig::new(project_dir));
    }
    let content = std::fs::read_to_string(&config_path)?;
    load_config_from_str(&content, project_dir)
}

/// Parses and validates a `kiln.toml` configuration from a string.
///
/// Useful for testing without filesystem dependencies.
pub fn load_config_from_str(content: &str, root_dir: &Path) -> Result<ProjectConfig, ConfigError> {
    let mut config: ProjectConfig =
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.root_dir = root_dir.to_path_buf();
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &ProjectConfig) -> Result<(), ConfigError> {
    let resolve = &config.resolve;
    for ext in &resolve.extensions {
        if ext.len() < 2 || !ext.starts_with('.') {
            return Err(ConfigError::ValidationError(format!(
                "extension '{ext}' must start with '.'"
            )));
        }
    }
    if let Some(key) = resolve.alias.keys().find(|k| k.is_empty()) {
        return Err(ConfigError::ValidationError(format!(
            "alias key '{key}' must not be empty"
        )));
    }
    if resolve.modules.iter().any(String::is_empty) {
        return Err(ConfigError::ValidationError(
            "module directory names must not be empty".to_string(),
        ));
    }
    if resolve.main_files.iter().any(String::is_empty) {
        return Err(ConfigError::ValidationError(
            "main file names must not be empty".to_string(),
        ));
    }
    validate_cache_dir(config)
}

/// Rejects a cache directory that is the project root or one of its parents.
/// The cache layout in that directory is cleared on a version change.
fn validate_cache_dir(config: &ProjectConfig) -> Result<(), ConfigError> {
    if config.cache.dir.as_os_str().is_empty() {
        return Err(ConfigError::ValidationError(
            "cache.dir must not be empty".to_string(),
        ));
    }
    let cache_dir = normalize(&config.cache_dir());
    if normalize(&config.root_dir).starts_with(&cache_dir) {
        return Err(ConfigError::ValidationError(format!(
            "cache.dir '{}' must not be the project root or one of its parents",
            config.cache.dir.display()
        )));
    }
    Ok(())
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}
